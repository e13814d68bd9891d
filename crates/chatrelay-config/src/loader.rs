use std::path::{Path, PathBuf};

use chatrelay_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Values supplied on the command line. They win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub openai_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub encryption_password: Option<String>,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds an [`AppConfig`] from an optional YAML/TOML file, environment
/// variables and CLI overrides, in that order of precedence (lowest first).
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: EnvLookup,
    overrides: ConfigOverrides,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env: Box::new(|key| std::env::var(key).ok()),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_file(mut self, path: Option<PathBuf>) -> Self {
        self.file = path;
        self
    }

    /// Replace the environment source (used by tests).
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn load(self) -> Result<AppConfig> {
        let mut config = match &self.file {
            Some(path) => read_file(path)?,
            None => AppConfig::default(),
        };

        self.apply_env(&mut config);
        self.apply_overrides(&mut config);
        validate(&config)?;
        Ok(config)
    }

    fn apply_env(&self, config: &mut AppConfig) {
        let env = |key: &str| {
            (self.env)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = env("OPENAI_TOKEN") {
            config.openai.api_key = v;
        }
        if let Some(v) = env("OPENAI_BASE_URL") {
            config.openai.base_url = Some(v);
        }
        if let Some(v) = env("TELEGRAM_BOT_TOKEN") {
            config.telegram.bot_token = v;
        }
        if let Some(v) = env("DATA_DIR") {
            config.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ENCRYPTION_PASSWORD") {
            config.security.encryption_password = v;
        }
        if let Some(v) = env("CHATRELAY_INVITE_CODE") {
            config.security.default_invite_code = Some(v);
        }
    }

    fn apply_overrides(&self, config: &mut AppConfig) {
        let o = &self.overrides;
        if let Some(v) = &o.openai_token {
            config.openai.api_key = v.clone();
        }
        if let Some(v) = &o.telegram_bot_token {
            config.telegram.bot_token = v.clone();
        }
        if let Some(v) = &o.data_dir {
            config.storage.data_dir = v.clone();
        }
        if let Some(v) = &o.encryption_password {
            config.security.encryption_password = v.clone();
        }
    }
}

fn read_file(path: &Path) -> Result<AppConfig> {
    info!("loading configuration from {}", path.display());
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display())))
    } else {
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display())))
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.telegram.bot_token.trim().is_empty() {
        return Err(Error::Config("telegram bot token is required".into()));
    }
    if config.openai.api_key.trim().is_empty() {
        return Err(Error::Config("OpenAI API token is required".into()));
    }
    if config.security.encryption_password.is_empty() {
        return Err(Error::Config("encryption password is required".into()));
    }
    if let Some(base_url) = &config.openai.base_url {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid openai.base_url '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "openai.base_url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
    }
    if config.retry.max_attempts == 0 {
        return Err(Error::Config("retry.max_attempts must be at least 1".into()));
    }
    if config.retry.factor <= 1.0 {
        return Err(Error::Config("retry.factor must be greater than 1".into()));
    }
    if config.stream.flush_interval_ms == 0 {
        return Err(Error::Config("stream.flush_interval_ms must be positive".into()));
    }
    if config.security.kdf_iterations == 0 {
        return Err(Error::Config("security.kdf_iterations must be positive".into()));
    }
    debug!(
        "configuration validated (model={}, streaming={})",
        config.openai.default_model, config.conversation.streaming
    );
    Ok(())
}
