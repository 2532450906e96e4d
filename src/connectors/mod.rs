//! Channel connectors: Telegram bot, QR-authenticated WhatsApp gateway,
//! polled IMAP mailbox.

pub mod connector;
pub mod mailbox;
pub mod telegram;
pub mod whatsapp;

pub use connector::{
    Connector, ConnectorEvent, HealthSnapshot, InboundEvent, SendOptions, SessionState,
};
pub use mailbox::MailboxConnector;
pub use telegram::TelegramConnector;
pub use whatsapp::WhatsappConnector;
