//! Core ticket/conversation data model.

pub mod message;
pub mod nlp;
pub mod ticket;

pub use message::{Attachment, Message, SenderType};
pub use nlp::{NlpResult, TriageVerdict};
pub use ticket::{Priority, Ticket, TicketSource, TicketStatus};
