pub mod loader;
pub mod model;

pub use loader::{ConfigLoader, ConfigOverrides};
pub use model::{
    AppConfig, ConversationConfig, LogConfig, MediaConfig, OpenAiConfig, RetryConfig,
    SecurityConfig, StorageConfig, StreamConfig, TelegramConfig,
};
