//! Messaging adapters (terminal, Telegram, WhatsApp).

pub mod manager;
pub mod telegram;
pub mod terminal;
pub mod traits;
pub mod whatsapp;

pub use manager::MessagingManager;
pub use traits::Messaging;
