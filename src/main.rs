//! Weituo server - delegation marketplace backend for a WeChat mini-program

use std::time::Duration;

use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weituo::wechat::WxClient;
use weituo::{routes, AppState};

#[derive(Parser, Debug)]
#[command(name = "weituo", about = "Delegation marketplace backend")]
struct Args {
    /// Database connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:weituo.db")]
    database_url: String,

    /// Listen address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind: String,

    /// WeChat mini-program appid
    #[arg(long, env = "WX_APPID", default_value = "")]
    wx_appid: String,

    /// WeChat mini-program secret
    #[arg(long, env = "WX_SECRET", default_value = "")]
    wx_secret: String,

    /// Skip the WeChat code exchange and treat login codes as openids
    #[arg(long, env = "WX_OFFLINE", default_value_t = false)]
    wx_offline: bool,

    /// Grace window before an unconfirmed completion auto-finalizes
    #[arg(long, env = "CONFIRM_GRACE_SECS", default_value_t = 86400)]
    confirm_grace_secs: u64,

    /// Session validity window
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 86400)]
    session_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weituo=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Database connection
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let wx = WxClient::new(args.wx_appid, args.wx_secret, args.wx_offline);
    let state = AppState::new(
        pool,
        wx,
        Duration::from_secs(args.confirm_grace_secs),
        Duration::from_secs(args.session_ttl_secs),
    );

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
