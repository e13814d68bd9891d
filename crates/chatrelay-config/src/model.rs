use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are ChatGPT, a large language model trained by OpenAI. Answer as concisely as possible";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_CALLER_TAG: &str = "chatrelay";
pub const DEFAULT_DB_FILENAME: &str = "chatrelay-v2.db";

/// Top-level configuration, assembled from a file, the environment and CLI flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub openai: OpenAiConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub conversation: ConversationConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub media: MediaConfig,
    pub log: LogConfig,
    /// Upper bound on how long shutdown waits for in-flight turns.
    pub shutdown_timeout_secs: Option<u64>,
}

impl AppConfig {
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: String,
    /// Sent as the `user` field of every completion request.
    pub caller_tag: String,
    pub transcription_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            default_model: DEFAULT_MODEL.to_string(),
            caller_tag: DEFAULT_CALLER_TAG.to_string(),
            transcription_model: "whisper-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub db_filename: String,
    pub dialog_retention_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("chatrelay"))
            .unwrap_or_else(|| PathBuf::from("data"));
        Self {
            data_dir,
            db_filename: DEFAULT_DB_FILENAME.to_string(),
            dialog_retention_secs: 60 * 60,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }

    pub fn dialog_retention(&self) -> Duration {
        Duration::from_secs(self.dialog_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret mixed with each user's salt to derive transcript keys.
    pub encryption_password: String,
    pub kdf_iterations: u32,
    /// Invite code accepted for any user in addition to per-user codes.
    pub default_invite_code: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_password: String::new(),
            kdf_iterations: 100_000,
            default_invite_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub system_prompt: String,
    /// Models a user may pick with `/model`. Empty means only the default.
    pub models: Vec<String>,
    pub streaming: bool,
    pub placeholder_text: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            models: Vec::new(),
            streaming: true,
            placeholder_text: "…".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: f64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            factor: 1.5,
            max_attempts: 5,
            jitter: 0.1,
            attempt_timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub flush_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub overall_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1500,
            idle_timeout_secs: 30,
            overall_timeout_secs: 5 * 60,
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            timeout_secs: 120,
        }
    }
}

impl MediaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
