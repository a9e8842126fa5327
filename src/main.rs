use std::sync::Arc;

use anyhow::Context;
use clean_mail::config::AppConfig;
use clean_mail::engine::Orchestrator;
use clean_mail::mailbox::{GraphMailbox, StaticTokenSource};
use clean_mail::notify::notifier_from_config;
use clean_mail::scheduler;
use clean_mail::server;
use clean_mail::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 CleanMail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Trigger API: http://0.0.0.0:{}/api/cron", config.port);
    eprintln!("   Graph: {}", config.graph_api_base);

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    if config.graph_access_token.is_none() {
        eprintln!("   Warning: GRAPH_ACCESS_TOKEN not set, every run will fail to authenticate");
    }
    if config.cron_secret.is_none() {
        eprintln!("   Warning: CRON_SECRET not set, trigger endpoints reject every request");
    }
    eprintln!(
        "   Notifications: {}",
        if config.webhook_url.is_some() { "webhook" } else { "disabled" }
    );

    // ── Engine ───────────────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::new(GraphMailbox::new(config.graph_api_base.clone())),
        Arc::new(StaticTokenSource::new(config.graph_access_token.clone())),
        notifier_from_config(config.webhook_url.clone()),
        config.engine_config(),
    ));

    // ── Schedule ─────────────────────────────────────────────────────────
    let _schedule_handle = match config.schedule.as_deref() {
        Some(expr) => {
            let schedule = scheduler::parse_schedule(expr)?;
            eprintln!("   Schedule: {expr}");
            Some(scheduler::spawn_schedule(Arc::clone(&orchestrator), schedule))
        }
        None => {
            eprintln!("   Schedule: disabled (external cron only)");
            None
        }
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = server::routes(orchestrator, config.cron_secret.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Trigger server started");
    axum::serve(listener, app).await?;

    Ok(())
}
