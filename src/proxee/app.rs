use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::proxee::{admin, config, logging, telemetry};
use crate::proxee::tunnel::{
    backoff::Backoff,
    client::{ClientOptions, TunnelClient},
    establish::{DirectDial, Establish, Rendezvous, RendezvousOptions},
    heartbeat::HeartbeatOptions,
    identity::PeerIdentity,
    mux::{SelectorMux, Service},
};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path, &overrides)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if !resolved.path.is_file() {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: no file; using flags and environment");
    }

    let prom = Arc::new(telemetry::init_prometheus()?);

    let establish = build_establish(&cfg)?;
    let mux = SelectorMux::new(cfg.services.iter().map(|s| Service {
        selector: s.selector.clone(),
        local_addr: s.local_addr.clone(),
    }))?;
    if mux.selectors().is_empty() {
        tracing::warn!("config: no services; every inbound stream will be refused");
    }

    tracing::info!(
        config = %resolved.path.display(),
        hostname = %cfg.hostname,
        target = %establish.describe(),
        admin_addr = %cfg.admin_addr,
        services = cfg.services.len(),
        heartbeat = %humantime::format_duration(cfg.heartbeat.interval),
        "proxee: starting"
    );

    let client = Arc::new(TunnelClient::new(
        client_options(&cfg),
        establish,
        Arc::new(mux),
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = admin::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            client: client.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    {
        let client = client.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn build_establish(cfg: &config::Config) -> anyhow::Result<Arc<dyn Establish>> {
    match &cfg.rendezvous {
        Some(rv) => {
            let identity = if rv.debug_identity {
                tracing::warn!(port = rv.advertised_port, "rendezvous: deterministic peer identity; never use in production");
                PeerIdentity::deterministic(u64::from(rv.advertised_port))
            } else {
                PeerIdentity::generate()
            };
            let opts = RendezvousOptions {
                base_url: rv.base_url.clone(),
                hostname: cfg.hostname.clone(),
                advertised_host: rv.advertised_host.clone(),
                advertised_port: rv.advertised_port,
                identity,
                request_timeout: rv.request_timeout,
            };
            Ok(Arc::new(Rendezvous::new(opts, &cfg.proxy.transport)?))
        }
        None => Ok(Arc::new(DirectDial::new(cfg.proxy.addr(), &cfg.proxy.transport)?)),
    }
}

fn client_options(cfg: &config::Config) -> ClientOptions {
    ClientOptions {
        hostname: cfg.hostname.clone(),
        dial_timeout: cfg.proxy.dial_timeout,
        register_timeout: cfg.proxy.register_timeout,
        backoff: Backoff::new(cfg.backoff.base, cfg.backoff.jitter),
        heartbeat: HeartbeatOptions {
            interval: cfg.heartbeat.interval,
            timeout: cfg.heartbeat.timeout,
            max_failures: cfg.heartbeat.max_failures,
        },
        max_concurrent_streams: cfg.max_concurrent_streams,
    }
}

async fn shutdown_signal() {
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
