//! Decision pipeline: language detection, classification, escalation,
//! knowledge-base retrieval, response drafting, and the ordered status
//! decision.

pub mod classify;
pub mod language;
pub mod processor;

pub use processor::TicketProcessor;
