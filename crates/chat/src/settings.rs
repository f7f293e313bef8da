use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tutor_delivery::{ClientConfig, DEFAULT_TUTOR_MODEL, RIG_OPENAI_PROVIDER_ID};

use crate::retry::{
    DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MULTIPLIER, RetryPolicy,
};
use crate::tab::Tab;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "tutor";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "TUTOR_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            auto_retry: default_auto_retry(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            auto_retry: self.auto_retry,
        }
    }

    fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.multiplier = self.multiplier.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub preamble: Option<String>,
}

impl Default for TutorSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            preamble: None,
        }
    }
}

impl TutorSettings {
    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn to_client_config(&self) -> Option<ClientConfig> {
        if !self.is_valid() {
            return None;
        }

        let mut config =
            ClientConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model);
        if let Some(preamble) = &self.preamble {
            config = config.with_preamble(preamble.clone());
        }
        Some(config)
    }

    fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChatSettings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub tutor: TutorSettings,
    #[serde(default)]
    pub default_tab: Tab,
}

impl ChatSettings {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tutor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads from the default location, falling back to defaults on any problem.
    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!("{error}. using defaults");
                Self::default()
            }
        }
    }

    /// Defaults, then the JSON file if present, then `TUTOR_*` environment overrides.
    pub fn try_load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"))
            .extract::<Self>()
            .map(Self::normalized)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    pub fn normalized(self) -> Self {
        Self {
            retry: self.retry.normalized(),
            tutor: self.tutor.normalized(),
            default_tab: self.default_tab,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to parse settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY.as_millis() as u64
}

fn default_multiplier() -> u32 {
    DEFAULT_RETRY_MULTIPLIER
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}

fn default_auto_retry() -> bool {
    true
}

fn default_provider_id() -> String {
    RIG_OPENAI_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_TUTOR_MODEL.to_string()
}
