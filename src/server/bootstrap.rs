use crate::config::BuffyConfig;
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Buffy lifecycle: load config → build state → start upstream supervisors
/// and the notification consumer → serve proxy/admin → shut down on signal
/// with a bounded drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = BuffyConfig::load(&args.config_path)?;
    config.show_info();

    let shutdown = Arc::new(Notify::new());
    // `ProxyState::new` starts each upstream's probe task as a side effect
    // of construction.
    let state = ProxyState::new(config, shutdown.clone())?;

    let proxy_listen = state.config.server_listen_host_port();
    let admin_listen = state.config.admin_listen_host_port();
    let admin_path = state.config.buffy.admin.path.clone();

    tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = server::run_admin_server(&admin_listen, admin_path, state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        }
    });

    tracing::info!("server: starting buffy, listen={}", proxy_listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&proxy_listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Block until SIGHUP, SIGINT, SIGTERM, or SIGQUIT, then
/// notify every probe task, the notification consumer, and the HTTP
/// servers via the shared `shutdown` signal.
async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut hangup =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler");
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
    #[cfg(unix)]
    let mut quit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
        .expect("failed to install SIGQUIT handler");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
            _ = hangup.recv() => tracing::info!("server: received SIGHUP, shutting down"),
            _ = terminate.recv() => tracing::info!("server: received SIGTERM, shutting down"),
            _ = quit.recv() => tracing::info!("server: received SIGQUIT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("server: received ctrl-c, shutting down");
    }

    shutdown.notify_waiters();
}
