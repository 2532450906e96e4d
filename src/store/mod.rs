//! Persistence layer: `TicketStore` trait plus backends.

pub mod libsql_backend;
pub mod memory;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{AuditRecord, ContactRef, FeedbackRecord, TicketStore};
