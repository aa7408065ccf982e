pub mod providers;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::MailsiftError;
use crate::index::hnsw::HnswParams;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the database, index files and sync lock
    pub state_dir: Option<PathBuf>,

    pub imap: Option<ImapConfig>,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub codes: CodesConfig,
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Provider preset name, or "custom"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// IMAP server hostname (taken from the preset when omitted)
    pub host: Option<String>,

    pub port: Option<u16>,

    /// Use implicit TLS. Plaintext connections are not supported.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Username (usually email address)
    pub user: Option<String>,

    pub password: Option<PasswordSource>,

    /// Mailbox to mirror
    pub folder: Option<String>,
}

/// Password source - raw value, environment variable, or command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PasswordSource {
    /// Raw password value
    Raw(String),
    /// Environment variable holding the password
    Env { env: String },
    /// Command whose stdout is the password
    Command { command: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Ollama,
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_backend")]
    pub backend: EmbeddingBackend,

    #[serde(default = "default_ollama_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,

    /// Also used as the SQLite busy timeout
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_m")]
    pub m: usize,

    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Verification-code detection applied during sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodesConfig {
    /// "default", "strict", "broad" or "custom"
    #[serde(default = "default_pattern_set")]
    pub pattern_set: String,

    /// Regex used when `pattern_set = "custom"`
    pub custom: Option<String>,
}

fn default_provider() -> String {
    "custom".to_string()
}

fn default_true() -> bool {
    true
}

fn default_backend() -> EmbeddingBackend {
    EmbeddingBackend::Ollama
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimension() -> usize {
    768
}

fn default_embed_timeout_secs() -> u64 {
    120
}

fn default_batch_size() -> usize {
    64
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_commit_timeout_ms() -> u64 {
    5000
}

fn default_max_text_chars() -> usize {
    2000
}

fn default_m() -> usize {
    HnswParams::default().m
}

fn default_ef_construction() -> usize {
    HnswParams::default().ef_construction
}

fn default_ef_search() -> usize {
    HnswParams::default().ef_search
}

fn default_seed() -> u64 {
    HnswParams::default().seed
}

fn default_pattern_set() -> String {
    "default".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_ollama_url(),
            model: default_model(),
            dimension: default_dimension(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_chunk_retries: default_max_chunk_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            commit_timeout_ms: default_commit_timeout_ms(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            seed: default_seed(),
        }
    }
}

impl Default for CodesConfig {
    fn default() -> Self {
        Self {
            pattern_set: default_pattern_set(),
            custom: None,
        }
    }
}

impl IndexConfig {
    pub fn params(&self) -> HnswParams {
        HnswParams {
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
            seed: self.seed,
        }
    }
}

impl CodesConfig {
    pub fn pattern_set(&self) -> Result<code_detector::PatternSet, MailsiftError> {
        if self.pattern_set.eq_ignore_ascii_case("custom") {
            let pattern = self.custom.as_deref().ok_or_else(|| {
                MailsiftError::Config("codes.custom is required for the custom pattern set".into())
            })?;
            return code_detector::PatternSet::custom(pattern)
                .map_err(|e| MailsiftError::Config(format!("Invalid custom code pattern: {}", e)));
        }
        code_detector::PatternSet::from_name(&self.pattern_set).ok_or_else(|| {
            MailsiftError::Config(format!("Unknown pattern set: {}", self.pattern_set))
        })
    }
}

/// Connection settings after provider presets and overrides are applied
#[derive(Debug, Clone)]
pub struct ResolvedImap {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub folder: String,
}

impl ImapConfig {
    pub fn resolve(&self) -> Result<ResolvedImap, MailsiftError> {
        if !self.tls {
            return Err(MailsiftError::Config(
                "plaintext IMAP is not supported, set tls = true".into(),
            ));
        }

        let user = std::env::var("MAILSIFT_USER")
            .ok()
            .or_else(|| self.user.clone())
            .ok_or_else(|| MailsiftError::Config("imap.user is not set".into()))?;

        let provider = if self.provider.eq_ignore_ascii_case("custom") && self.host.is_none() {
            providers::provider_for_email(&user).unwrap_or("custom")
        } else {
            self.provider.as_str()
        };
        let preset = providers::preset(provider);
        if preset.is_none() && !provider.eq_ignore_ascii_case("custom") {
            return Err(MailsiftError::Config(format!(
                "Unknown provider '{}', expected one of: {}",
                provider,
                providers::supported_providers().join(", ")
            )));
        }

        let host = self
            .host
            .clone()
            .or_else(|| preset.map(|p| p.host.to_string()))
            .ok_or_else(|| MailsiftError::Config("imap.host is required for custom providers".into()))?;
        let port = self.port.or(preset.map(|p| p.port)).unwrap_or(993);
        let folder = self
            .folder
            .clone()
            .or_else(|| preset.map(|p| p.folder.to_string()))
            .unwrap_or_else(|| "INBOX".to_string());

        let password = match std::env::var("MAILSIFT_PASSWORD") {
            Ok(p) => p,
            Err(_) => self
                .password
                .as_ref()
                .ok_or_else(|| MailsiftError::Config("imap.password is not set".into()))?
                .resolve()?,
        };

        Ok(ResolvedImap {
            host,
            port,
            user,
            password,
            folder,
        })
    }
}

impl PasswordSource {
    pub fn resolve(&self) -> Result<String, MailsiftError> {
        match self {
            PasswordSource::Raw(p) => Ok(p.clone()),
            PasswordSource::Env { env } => std::env::var(env)
                .map_err(|_| MailsiftError::Config(format!("Environment variable {} is not set", env))),
            PasswordSource::Command { command } => {
                let output = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .map_err(|e| MailsiftError::Config(format!("Failed to run password command: {}", e)))?;
                if !output.status.success() {
                    return Err(MailsiftError::Config(format!(
                        "Password command exited with {}",
                        output.status
                    )));
                }
                let password = String::from_utf8_lossy(&output.stdout)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                Ok(password)
            }
        }
    }
}

impl AppConfig {
    /// State directory: `MAILSIFT_STATE_DIR`, then the config, then the
    /// platform data dir.
    pub fn state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("MAILSIFT_STATE_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("mailsift"))
            .unwrap_or_else(|| PathBuf::from(".mailsift"))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.commit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MailsiftError> {
        if self.sync.batch_size == 0 {
            return Err(MailsiftError::Config("sync.batch_size must be positive".into()));
        }
        if self.sync.max_text_chars == 0 {
            return Err(MailsiftError::Config("sync.max_text_chars must be positive".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(MailsiftError::Config("embedding.dimension must be positive".into()));
        }
        if self.index.m < 2 {
            return Err(MailsiftError::Config("index.m must be at least 2".into()));
        }
        if self.index.ef_search == 0 || self.index.ef_construction == 0 {
            return Err(MailsiftError::Config("index ef values must be positive".into()));
        }
        if let Some(imap) = &self.imap {
            if !imap.tls {
                return Err(MailsiftError::Config(
                    "plaintext IMAP is not supported, set tls = true".into(),
                ));
            }
        }
        self.codes.pattern_set()?;
        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mailsift").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mailsift").join("config.toml"));
        paths.push(home_dir.join(".mailsift.toml"));
    }

    paths
}

/// Load configuration from `path`, or the first default path that exists.
pub fn load(path: Option<&Path>) -> Result<AppConfig, MailsiftError> {
    let config = match path {
        Some(path) => load_from_path(path)?,
        None => match default_config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                info!("Found config at: {:?}", path);
                load_from_path(&path)?
            }
            None => {
                info!("No config file found, using defaults");
                AppConfig::default()
            }
        },
    };
    config.validate()?;
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<AppConfig, MailsiftError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| MailsiftError::Config(format!("Failed to read config: {}", e)))?;

    parse(&content)
}

pub fn parse(content: &str) -> Result<AppConfig, MailsiftError> {
    toml::from_str(content).map_err(|e| MailsiftError::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.sync.batch_size, 64);
        assert_eq!(config.sync.max_chunk_retries, 3);
        assert_eq!(config.embedding.backend, EmbeddingBackend::Ollama);
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.index.params(), HnswParams::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
state_dir = "/tmp/mailsift-test"

[imap]
provider = "gmail"
user = "me@gmail.com"
password = { command = "echo secret" }

[embedding]
backend = "hashing"
dimension = 256

[sync]
batch_size = 16

[codes]
pattern_set = "strict"
"#,
        )
        .unwrap();

        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/mailsift-test")));
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashing);
        assert_eq!(config.sync.batch_size, 16);
        assert_eq!(config.sync.retry_backoff_ms, 500);
        let imap = config.imap.as_ref().unwrap();
        assert!(matches!(imap.password, Some(PasswordSource::Command { .. })));
        assert_eq!(config.codes.pattern_set().unwrap().name(), "strict");
    }

    #[test]
    fn test_password_sources() {
        assert_eq!(PasswordSource::Raw("pw".into()).resolve().unwrap(), "pw");
        assert_eq!(
            PasswordSource::Command {
                command: "printf 'hunter2\\n'".into()
            }
            .resolve()
            .unwrap(),
            "hunter2"
        );
        assert!(PasswordSource::Env {
            env: "MAILSIFT_TEST_UNSET_VARIABLE".into()
        }
        .resolve()
        .is_err());
    }

    #[test]
    fn test_resolve_preset() {
        let imap = ImapConfig {
            provider: "fastmail".into(),
            host: None,
            port: None,
            tls: true,
            user: Some("me@fastmail.com".into()),
            password: Some(PasswordSource::Raw("pw".into())),
            folder: None,
        };
        if std::env::var("MAILSIFT_USER").is_err() && std::env::var("MAILSIFT_PASSWORD").is_err() {
            let resolved = imap.resolve().unwrap();
            assert_eq!(resolved.host, "imap.fastmail.com");
            assert_eq!(resolved.port, 993);
            assert_eq!(resolved.folder, "INBOX");
            assert_eq!(resolved.password, "pw");
        }
    }

    #[test]
    fn test_plaintext_rejected() {
        let config = parse(
            r#"
[imap]
host = "127.0.0.1"
port = 1143
tls = false
user = "me"
password = "pw"
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(MailsiftError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = parse("[sync]\nbatch_size = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config = parse("[codes]\npattern_set = \"custom\"\n").unwrap();
        assert!(config.validate().is_err());

        let config = parse("[codes]\npattern_set = \"nonsense\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_is_parse_error() {
        assert!(parse("[embedding]\nbackend = \"gpu\"\n").is_err());
    }
}
