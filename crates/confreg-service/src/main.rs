use clap::{Parser, ValueEnum};
use confreg_adapters::{SignatureGatewayConfig, WidgetGatewayConfig};
use confreg_core::{OriginAllowList, StoreConfig};
use confreg_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "confregd", version, about = "Conference registration callables service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092")]
    listen: SocketAddr,
    /// Document store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "CONFREG_STORAGE")]
    storage: StorageMode,
    #[arg(long, env = "CONFREG_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, default_value_t = 5, env = "CONFREG_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    #[arg(long, env = "CONFREG_SIGNATURE_MERCHANT_ID", default_value = "")]
    signature_merchant_id: String,
    #[arg(long, env = "CONFREG_SIGNATURE_SECRET", default_value = "", hide_env_values = true)]
    signature_secret: String,
    #[arg(long, env = "CONFREG_SIGNATURE_APPROVAL_URL")]
    signature_approval_url: Option<String>,
    #[arg(long, env = "CONFREG_SIGNATURE_RETURN_URL")]
    signature_return_url: Option<String>,
    #[arg(long, env = "CONFREG_WIDGET_CLIENT_KEY", default_value = "")]
    widget_client_key: String,
    /// Conference site the widget gateway redirects back to.
    #[arg(long, env = "CONFREG_PUBLIC_BASE_URL")]
    public_base_url: Option<String>,
    /// Comma-separated origins allowed in addition to society domains.
    #[arg(long, env = "CONFREG_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,
    #[arg(long, default_value_t = OriginAllowList::DEFAULT_TTL_SECS, env = "CONFREG_ORIGIN_CACHE_TTL_SECS")]
    origin_cache_ttl_secs: i64,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StoreConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_config(cli: Cli) -> anyhow::Result<ServiceConfig> {
    let store = resolve_storage(&cli)?;

    let mut signature = SignatureGatewayConfig {
        merchant_id: cli.signature_merchant_id,
        merchant_secret: cli.signature_secret,
        ..SignatureGatewayConfig::default()
    };
    if let Some(url) = cli.signature_approval_url {
        signature.approval_url = url;
    }
    if let Some(url) = cli.signature_return_url {
        signature.return_url = url;
    }

    let mut widget = WidgetGatewayConfig {
        client_key: cli.widget_client_key,
        ..WidgetGatewayConfig::default()
    };
    if let Some(url) = cli.public_base_url {
        widget.public_base_url = url;
    }

    Ok(ServiceConfig {
        store,
        signature,
        widget,
        static_origins: cli
            .allowed_origins
            .into_iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect(),
        origin_cache_ttl_secs: cli.origin_cache_ttl_secs,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "confreg_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let listen = cli.listen;
    let config = resolve_config(cli)?;
    if config.signature.merchant_id.is_empty() {
        warn!("signature gateway merchant id is not configured");
    }
    info!(storage = config.store.label(), "bootstrapping confreg-service");

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("confreg-service listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
