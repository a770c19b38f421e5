use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::sluice::{
    admin,
    auth::Authenticator,
    config, dispatch, logging, net, telemetry, tls,
    tunnel::{
        client::Client,
        server::ServerContext,
        transport::{Connector, HttpUpgradeConnector},
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        server = cfg.server.is_some(),
        client = cfg.client.is_some(),
        admin_addr = %cfg.admin_addr,
        "sluice: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let (reload_tx, reload_rx) = watch::channel(telemetry::ReloadSignal::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = JoinSet::new();
    let mut server_ctx: Option<ServerContext> = None;

    if let Some(sc) = &cfg.server {
        let auth = Authenticator::from_file(sc.users_file.as_deref())
            .map_err(|e| anyhow::anyhow!("server: {e}"))?;
        if auth.store().is_open() {
            tracing::warn!("server: no users_file configured; any client may connect and register any address");
        } else {
            tracing::info!(users = auth.store().len(), "server: users loaded");
        }

        let mut ctx = ServerContext::new(Arc::new(auth), sc.tunnel.clone());

        let acceptor = match &sc.tls {
            None => None,
            Some(t) => Some(TlsAcceptor::from(server_tls(t)?)),
        };
        if let (Some(t), Some(a)) = (&sc.tls, &acceptor) {
            if t.client_ca_file.is_some() {
                tracing::info!("server: client certificates required");
            }
            if t.terminate_reverse {
                ctx = ctx.with_reverse_tls(a.clone());
            }
        }

        let proxy_upstream = match &sc.proxy_upstream {
            Some(u) => Some(
                reqwest::Url::parse(u).with_context(|| format!("server: invalid proxy_upstream {u}"))?,
            ),
            None => None,
        };
        let app = dispatch::router(
            ctx.clone(),
            dispatch::WebOptions {
                proxy_upstream,
                static_dir: sc.static_dir.clone(),
            },
        )?;

        let listener = net::bind(&sc.listen_addr, "server").await?;
        let handshake_timeout = sc.tunnel.handshake_timeout;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            dispatch::serve(listener, app, acceptor, handshake_timeout, shutdown).await
        });

        // Upgraded sessions outlive the HTTP listener; they watch the token instead.
        {
            let token = ctx.shutdown.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                wait_shutdown(&mut shutdown).await;
                token.cancel();
                Ok(())
            });
        }

        server_ctx = Some(ctx);
    }

    if let Some(cc) = &cfg.client {
        let mut connector = HttpUpgradeConnector::new(cc.server_url.clone(), cc.tunnel.dial_timeout)
            .with_headers(cc.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        if cc.server_url.tls {
            let client_tls = tls::client_config(&tls::ClientTlsOptions {
                ca_file: cc.tls.ca_file.clone(),
                insecure_skip_verify: cc.tls.skip_verify,
                client_cert: cc.tls.cert_file.clone().zip(cc.tls.key_file.clone()),
            })?;
            if cc.tls.skip_verify {
                tracing::warn!("client: TLS certificate verification disabled");
            }
            connector = connector.with_tls(client_tls, cc.tls.server_name.clone());
        }

        let connector: Arc<dyn Connector> = Arc::new(connector);
        let client = Client::new(cc.tunnel.clone(), connector)?;
        tracing::info!(server = %cc.server_url, specs = cc.tunnel.specs.len(), "client: configured");

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Users file reload loop (polling + admin + SIGHUP).
    if let Some(ctx) = &server_ctx {
        let auth = ctx.auth.clone();
        let config_path = resolved.path.clone();
        let mut reload_rx = reload_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut enabled = cfg.reload.enabled;
        let mut poll = cfg.reload.poll_interval;
        tasks.spawn(async move {
            reload_loop(
                auth,
                config_path,
                &mut reload_rx,
                &mut shutdown,
                &mut enabled,
                &mut poll,
            )
            .await;
            Ok(())
        });

        #[cfg(unix)]
        {
            let reload_tx = reload_tx.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { forward_sighup(reload_tx, shutdown).await });
        }
    }

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            sessions: server_ctx.as_ref().map(|c| c.sessions.clone()),
            auth: server_ctx.as_ref().map(|c| c.auth.clone()),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM or unexpected task termination.
    tokio::select! {
        res = shutdown_signal() => {
            if let Err(err) = res {
                tracing::warn!(err = %err, "shutdown: signal handler failed");
            }
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    if let Some(ctx) = &server_ctx {
        ctx.shutdown.cancel();
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn server_tls(t: &config::ServerTlsConfig) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let (certs, key) = match &t.cert {
        config::CertSource::Files { cert_file, key_file } => {
            (tls::load_certs(cert_file)?, tls::load_key(key_file)?)
        }
        config::CertSource::SelfSigned => {
            tracing::warn!("server: using a self-signed certificate; clients need skip_verify or the exported CA");
            tls::self_signed(vec!["localhost".to_string()])?
        }
    };
    tls::server_config(certs, key, t.client_ca_file.as_deref())
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(unix)]
async fn forward_sighup(
    reload_tx: watch::Sender<telemetry::ReloadSignal>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return Ok(()),
            got = hup.recv() => {
                if got.is_none() {
                    return Ok(());
                }
                tracing::info!("reload: SIGHUP");
                reload_tx.send_modify(|s| s.next());
            }
        }
    }
}

/// Reloads the users file on request, or when it (or the config file) changes on disk.
async fn reload_loop(
    auth: Arc<Authenticator>,
    config_path: PathBuf,
    reload_rx: &mut watch::Receiver<telemetry::ReloadSignal>,
    shutdown: &mut watch::Receiver<bool>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let mut last_sig = watched_sig(&auth, &config_path);

    loop {
        let sleep_dur = if *enabled {
            (*poll_interval).max(Duration::from_millis(200))
        } else {
            Duration::from_secs(3600)
        };

        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = reload_rx.changed() => {
                if res.is_err() {
                    break;
                }
                apply_reload(&auth, &config_path, enabled, poll_interval).await;
                last_sig = watched_sig(&auth, &config_path);
            }
            _ = tokio::time::sleep(sleep_dur) => {
                if !*enabled {
                    continue;
                }
                let sig = watched_sig(&auth, &config_path);
                if sig == last_sig {
                    continue;
                }
                apply_reload(&auth, &config_path, enabled, poll_interval).await;
                last_sig = sig;
            }
        }
    }
}

async fn apply_reload(
    auth: &Arc<Authenticator>,
    config_path: &Path,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    match config::load_config(config_path) {
        Ok(cfg) => {
            *enabled = cfg.reload.enabled;
            *poll_interval = cfg.reload.poll_interval;
            let wanted = cfg.server.as_ref().and_then(|s| s.users_file.clone());
            if wanted.as_deref() != auth.users_file() {
                tracing::warn!("reload: users_file path changed; restart required to switch files");
            }
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), err = %err, "reload: config load failed");
        }
    }

    if auth.users_file().is_none() {
        return;
    }

    // Argon2 parameter checks and file IO stay off the reactor.
    let a = auth.clone();
    match tokio::task::spawn_blocking(move || a.reload()).await {
        Ok(Ok(n)) => {
            metrics::counter!("sluice_users_reloads_total", "result" => "ok").increment(1);
            tracing::info!(users = n, "reload: users applied");
        }
        Ok(Err(err)) => {
            metrics::counter!("sluice_users_reloads_total", "result" => "error").increment(1);
            tracing::warn!(err = %err, "reload: users file rejected; keeping previous users");
        }
        Err(err) => tracing::warn!(err = %err, "reload: task failed"),
    }
}

type FileSig = (u64, u64);

fn watched_sig(auth: &Authenticator, config_path: &Path) -> (Option<FileSig>, Option<FileSig>) {
    (
        file_sig(config_path).ok(),
        auth.users_file().and_then(|p| file_sig(p).ok()),
    )
}

fn file_sig(path: &Path) -> anyhow::Result<FileSig> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}
