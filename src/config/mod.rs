use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Complete server configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Where saved credentials and their key live
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_store_file")]
    pub store_file: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

/// Per-user config directory, `~/.snowflake-mcp` when the platform has none.
fn default_storage_directory() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("snowflake-mcp"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".snowflake-mcp")))
        .unwrap_or_else(|| PathBuf::from(".snowflake-mcp"))
}

fn default_store_file() -> String {
    "credentials.enc".to_string()
}

fn default_key_file() -> String {
    ".key".to_string()
}

impl StorageConfig {
    pub fn store_path(&self) -> PathBuf {
        self.directory.join(&self.store_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.directory.join(&self.key_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
            store_file: default_store_file(),
            key_file: default_key_file(),
        }
    }
}

/// Snowflake handshake settings
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound for one login attempt (seconds)
    #[serde(default = "default_login_timeout")]
    pub login_timeout_seconds: u64,
    /// Upper bound for any other request (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// `{account}` is replaced by the account identifier
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_client_app_id")]
    pub client_app_id: String,
}

fn default_login_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_base_url() -> String {
    "https://{account}.snowflakecomputing.com".to_string()
}

fn default_client_app_id() -> String {
    "snowflake-mcp".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            login_timeout_seconds: default_login_timeout(),
            request_timeout_seconds: default_request_timeout(),
            base_url: default_base_url(),
            client_app_id: default_client_app_id(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

/// Default location of `server.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snowflake-mcp").join("server.toml"))
}

/// Load configuration from TOML file
pub fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(config)
}
