#[cfg(feature = "telegram")]
pub mod telegram;
pub mod telegram_fmt;
pub mod traits;

#[cfg(feature = "telegram")]
pub use telegram::{OnEventFn, TelegramChannel, TelegramTransport, event_callback};
pub use traits::{
    Button, ChannelLifecycle, ChannelStatus, EventKind, InboundEvent, MediaKind, MediaRef,
    MessageRef, Sender, TextFormat, Transport,
};
