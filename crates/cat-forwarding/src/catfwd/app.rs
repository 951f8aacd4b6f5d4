use std::path::PathBuf;

use anyhow::Context;

use crate::catfwd::{
    config, logging, net,
    shutdown::Shutdown,
    tunnel::client::{Client, ClientOptions, CloseReason},
};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Local TCP port to expose.
    pub port: u16,
    pub config_path: Option<PathBuf>,
    /// Relay address override (`--server` / `CATFWD_SERVER`).
    pub server_addr: Option<String>,
    pub verbose: bool,
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;
    let cfg = match &resolved {
        Some(r) => config::load_config(&r.path)
            .with_context(|| format!("load config: {}", r.path.display()))?,
        None => config::Config::default(),
    };
    let cfg = cfg.with_server_addr(opts.server_addr)?;

    let logrt = logging::init(&cfg.logging, opts.verbose)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(r) = &resolved {
        tracing::debug!(path = %r.path.display(), source = %r.source, "config: loaded");
    }
    tracing::info!(
        server = %cfg.server_addr,
        local_port = opts.port,
        version = %cfg.version,
        handshake_timeout = %humantime::format_duration(cfg.handshake_timeout),
        "cat-forwarding: starting"
    );

    let shutdown = Shutdown::new();
    let client = Client::new(
        ClientOptions {
            server_addr: cfg.server_addr.clone(),
            version: cfg.version.clone(),
            local_host: cfg.local_host.clone(),
            local_port: opts.port,
            connect_timeout: cfg.connect_timeout,
            handshake_timeout: cfg.handshake_timeout,
            buffer_size: cfg.buffer_size,
        },
        shutdown.clone(),
    );

    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            if shutdown.trigger() {
                tracing::info!("shutdown: signal");
            }
        }
    });

    let established = tokio::select! {
        res = client.establish() => res?,
        _ = shutdown.wait() => {
            signals.abort();
            return Ok(());
        }
    };

    println!(
        "🐾 Cat Forwarding activated on port {} to {}:{}! Your cat is now purring across the globe! 🐾",
        opts.port,
        net::relay_host(&cfg.server_addr),
        established.assigned_port
    );

    let reason = client.forward(established).await;
    signals.abort();
    tracing::debug!(state = %client.state(), "tunnel: session finished");

    match reason {
        CloseReason::RelayDisconnected => tracing::info!("cat-forwarding: relay closed the session"),
        CloseReason::Shutdown => tracing::info!("cat-forwarding: stopped"),
    }
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
