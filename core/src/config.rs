use async_trait::async_trait;
use directories::BaseDirs;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Providers whose API key may come from a `<PROVIDER>_API_KEY` variable.
const ENV_KEY_PROVIDERS: &[&str] = &[
    "openai",
    "openrouter",
    "groq",
    "together",
    "mistral",
    "deepseek",
    "custom",
];

const BASE_URL_ENV: &str = "CHORUS_BASE_URL";

/// Credentials and endpoint settings, fetched fresh for every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub api_keys: HashMap<String, String>,
    pub custom_base_url: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl ProviderSettings {
    pub fn with_api_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider.into(), key.into());
        self
    }

    pub fn with_custom_base_url(mut self, url: impl Into<String>) -> Self {
        self.custom_base_url = Some(url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The non-blank API key stored for `provider`.
    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(|key| key.trim())
            .filter(|key| !key.is_empty())
    }

    pub fn custom_base_url(&self) -> Option<&str> {
        self.custom_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no API key configured for `{0}`")]
    MissingApiKey(String),
    #[error("no base URL configured for `{0}`")]
    MissingBaseUrl(String),
    #[error("AI configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingApiKey(provider) => {
                format!("Add your {provider} API key in Settings to use this model.")
            }
            Self::MissingBaseUrl(provider) => {
                format!("Add a base URL for the {provider} provider in Settings.")
            }
            Self::Invalid(detail) => {
                format!("AI not configured: {detail}. Update chorus.yaml.")
            }
        }
    }
}

/// Source of provider settings. Implementations must not cache: the streaming
/// core calls this once per request.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn provider_settings(&self) -> Result<ProviderSettings, ConfigError>;
}

/// Fixed settings, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub ProviderSettings);

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn provider_settings(&self) -> Result<ProviderSettings, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Settings read from `chorus.yaml`, overlaid with environment variables.
#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    path: Option<PathBuf>,
}

impl FileSettings {
    /// Looks the file up in the standard locations on every read.
    pub fn discover() -> Self {
        Self { path: None }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    async fn read_file(&self) -> Result<Option<ChorusConfig>, ConfigError> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => match locate_config_file() {
                Some(path) => path,
                None => return Ok(None),
            },
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_config(&contents, &path).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConfigError::Invalid(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl SettingsSource for FileSettings {
    async fn provider_settings(&self) -> Result<ProviderSettings, ConfigError> {
        let config = self.read_file().await?;
        let settings = resolve_settings(config, |name| std::env::var(name).ok())?;
        tracing::debug!(
            providers = settings.api_keys.len(),
            custom_base_url = settings.custom_base_url.is_some(),
            "resolved provider settings"
        );
        Ok(settings)
    }
}

fn parse_config(contents: &str, path: &Path) -> Result<ChorusConfig, ConfigError> {
    serde_yaml::from_str(contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid {}: {err}", path.display())))
}

fn resolve_settings(
    config: Option<ChorusConfig>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ProviderSettings, ConfigError> {
    let app = config.and_then(|config| config.app).unwrap_or_default();

    let mut api_keys: HashMap<String, String> = app
        .api_keys
        .into_iter()
        .map(|(provider, key)| (provider.trim().to_ascii_lowercase(), key.trim().to_string()))
        .filter(|(_, key)| !key.is_empty())
        .collect();
    for provider in ENV_KEY_PROVIDERS {
        let var = format!("{}_API_KEY", provider.to_ascii_uppercase());
        if let Some(key) = env(&var).map(|key| key.trim().to_string()) {
            if !key.is_empty() {
                api_keys.insert((*provider).to_string(), key);
            }
        }
    }

    let non_blank = |url: String| {
        let url = url.trim().to_string();
        (!url.is_empty()).then_some(url)
    };
    let custom_base_url = env(BASE_URL_ENV)
        .and_then(non_blank)
        .or_else(|| app.custom_base_url.and_then(non_blank));
    if let Some(url) = &custom_base_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "custom_base_url must start with http:// or https://, got `{url}`"
            )));
        }
    }

    let request_timeout = match app.request_timeout_secs {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than zero".to_string(),
            ))
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    Ok(ProviderSettings {
        api_keys,
        custom_base_url,
        request_timeout,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    chorus_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn chorus_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("chorus");
        paths.push(config_dir.join("chorus.yaml"));
        paths.push(config_dir.join("chorus.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".chorus").join("chorus.yaml"));
        paths.push(home_dir.join(".chorus").join("chorus.yml"));
    } else {
        paths.push(PathBuf::from("chorus.yaml"));
        paths.push(PathBuf::from("chorus.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct ChorusConfig {
    app: Option<AppSection>,
}

#[derive(Debug, Default, Deserialize)]
struct AppSection {
    #[serde(default)]
    api_keys: HashMap<String, String>,
    #[serde(default)]
    custom_base_url: Option<String>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
}
