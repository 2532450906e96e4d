//! Deskflow — multi-channel support ticket triage.
//!
//! Channel connectors (Telegram, WhatsApp gateway, mailbox) normalize inbound
//! traffic into tickets, a durable consumer-group bus carries the work, and a
//! confidence-gated pipeline classifies, escalates, and drafts replies for
//! human approval.

pub mod bus;
pub mod config;
pub mod connectors;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod router;
pub mod services;
pub mod store;
pub mod workers;

pub use error::{Error, Result};
