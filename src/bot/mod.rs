//! Telegram surface: API client wrapper, inline keyboards, callback codec.

pub mod buttons;
pub mod telegram;

pub use buttons::{AdviceContext, CallbackData, ContextStore};
pub use telegram::{ChatNotifier, TelegramClient};
