use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use snowflake_mcp::api::{create_tools_router, ToolsAppState};
use snowflake_mcp::config::{default_config_path, load_config, ServerConfig};
use snowflake_mcp::credentials::{ConnectionOptions, CredentialStore, EncryptedFileStore};
use snowflake_mcp::resolver::{CredentialResolver, CredentialSources, PartialCredentials};
use snowflake_mcp::session::{RestConnector, SessionManager};
use snowflake_mcp::tools::{AuthTools, ToolError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "snowflake-mcp")]
#[command(version, about = "Snowflake credential resolution and authentication tools")]
struct Cli {
    /// JSON connection config (account, user, password, warehouse, database, schema, role)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Snowflake account identifier
    #[arg(long)]
    account: Option<String>,

    /// Snowflake login name
    #[arg(long)]
    user: Option<String>,

    /// Snowflake password
    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    warehouse: Option<String>,

    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    schema: Option<String>,

    #[arg(long)]
    role: Option<String>,

    /// Server settings (TOML). Defaults to <config dir>/snowflake-mcp/server.toml if present
    #[arg(long)]
    server_config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address for the HTTP API, overrides [api].bind_address
    #[arg(long)]
    bind: Option<String>,

    /// Tools to disable
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    exclude_tools: Vec<String>,
}

impl Cli {
    /// Credentials given on the command line, captured once.
    fn credentials(&mut self) -> PartialCredentials {
        PartialCredentials {
            account: self.account.take(),
            user: self.user.take(),
            password: self.password.take().map(SecretString::from),
            options: ConnectionOptions {
                warehouse: self.warehouse.take(),
                database: self.database.take(),
                schema: self.schema.take(),
                role: self.role.take(),
            },
        }
    }

    fn server_config(&self) -> Result<ServerConfig> {
        if let Some(path) = &self.server_config {
            return load_config(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => load_config(&path),
            _ => Ok(ServerConfig::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Initialize tracing subscriber; stdout stays free for protocol bridges
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("snowflake_mcp={}", cli.log_level).into()),
        )
        .init();

    info!("Snowflake MCP starting...");

    let mut config = cli.server_config().context("Failed to load server config")?;
    if let Some(bind) = cli.bind.take() {
        config.api.bind_address = bind;
    }

    info!(
        storage_dir = %config.storage.directory.display(),
        login_timeout_seconds = config.connection.login_timeout_seconds,
        base_url = %config.connection.base_url,
        bind_address = %config.api.bind_address,
        "Configuration loaded"
    );

    let store: Arc<dyn CredentialStore> = Arc::new(
        EncryptedFileStore::open(config.storage.store_path(), config.storage.key_path())
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let connector =
        Arc::new(RestConnector::new(&config.connection).context("Failed to build connector")?);
    let sessions = Arc::new(SessionManager::new(
        connector,
        Duration::from_secs(config.connection.login_timeout_seconds),
    ));

    let sources = CredentialSources {
        config_file: Some(cli.config.clone()),
        cli: cli.credentials(),
        env: PartialCredentials::from_env(),
    };
    let resolver = CredentialResolver::new(sources, Arc::clone(&store));

    let tools = Arc::new(
        AuthTools::new(store, resolver, Arc::clone(&sessions))
            .with_excluded(cli.exclude_tools.iter().cloned()),
    );

    // Connect from static sources; failures are kept for the status resource
    match tools.ensure_connected().await {
        Ok(status) => info!(
            identity = ?status.identity.map(|i| i.to_string()),
            provenance = ?status.provenance.map(|p| p.as_str()),
            "Connected at startup"
        ),
        Err(ToolError::NotAuthenticated { saved, .. }) => info!(
            saved = saved.len(),
            "No static credentials; waiting for authenticate_snowflake or use_saved_credentials"
        ),
        Err(e) => warn!(error = %e, "Startup connection failed"),
    }

    // Start HTTP API server; no CORS layer, the tools are same-origin only
    let router = create_tools_router(ToolsAppState { tools });
    let listener = tokio::net::TcpListener::bind(&config.api.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind_address))?;
    info!(address = %config.api.bind_address, "Tools API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Tools API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    sessions.close().await;
    info!("Snowflake MCP stopped");

    Ok(())
}
