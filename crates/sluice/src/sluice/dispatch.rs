//! The server's single HTTP(S) entry point.
//!
//! Requests asking to upgrade to the tunnel protocol become sessions; all
//! other traffic is served as ordinary web traffic.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Extension, Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONNECTION, HOST, UPGRADE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::watch,
    task::JoinSet,
    time,
};
use tokio_rustls::TlsAcceptor;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::sluice::tunnel::{
    error::TunnelError, protocol::PROTOCOL_TOKEN, server::ServerContext, server::serve_session,
};

/// Request bodies forwarded to `proxy_upstream` are buffered up to this size.
pub const MAX_PROXY_BODY: usize = 16 * 1024 * 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Default)]
pub struct WebOptions {
    pub proxy_upstream: Option<reqwest::Url>,
    pub static_dir: Option<PathBuf>,
}

struct Upstream {
    base: reqwest::Url,
    client: reqwest::Client,
}

struct DispatchState {
    tunnel: ServerContext,
    upstream: Option<Upstream>,
}

type Shared = Arc<DispatchState>;

pub fn router(tunnel: ServerContext, web: WebOptions) -> anyhow::Result<Router> {
    let upstream = match web.proxy_upstream {
        Some(base) => Some(Upstream {
            base,
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| anyhow::anyhow!("dispatch: build proxy client: {e}"))?,
        }),
        None => None,
    };
    let has_upstream = upstream.is_some();
    let st: Shared = Arc::new(DispatchState { tunnel, upstream });

    let web_app = if has_upstream {
        Router::new().fallback(proxy).with_state(st.clone())
    } else if let Some(dir) = web.static_dir {
        Router::new().fallback_service(ServeDir::new(dir))
    } else {
        Router::new()
            .route("/health", get(health))
            .route("/version", get(version))
            .fallback(not_found)
    };

    Ok(web_app
        .layer(middleware::from_fn_with_state(st, tunnel_upgrade))
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> &'static str {
    "OK\n"
}

async fn version() -> String {
    format!("{}\n", env!("CARGO_PKG_VERSION"))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found\n")
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The protocol a request asks to upgrade to, if it asks at all.
fn requested_upgrade(headers: &HeaderMap) -> Option<String> {
    if !has_token(headers, CONNECTION, "upgrade") {
        return None;
    }
    let v = headers.get(UPGRADE)?.to_str().ok()?.trim();
    (!v.is_empty()).then(|| v.to_string())
}

fn remote_of(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_default()
}

async fn tunnel_upgrade(State(st): State<Shared>, mut req: Request, next: Next) -> Response {
    let Some(proto) = requested_upgrade(req.headers()) else {
        return next.run(req).await;
    };
    if !has_token(req.headers(), UPGRADE, PROTOCOL_TOKEN) {
        tracing::debug!(protocol = %proto, uri = %req.uri(), "dispatch: unsupported upgrade; serving as plain request");
        return next.run(req).await;
    }

    let remote = remote_of(&req);
    let on_upgrade = hyper::upgrade::on(&mut req);
    let ctx = st.tunnel.clone();
    tokio::spawn(async move {
        let io = match on_upgrade.await {
            Ok(io) => io,
            Err(err) => {
                tracing::warn!(remote = %remote, err = %err, "dispatch: upgrade failed");
                return;
            }
        };
        match serve_session(ctx, TokioIo::new(io), remote.clone()).await {
            Ok(()) => {}
            // already logged with the user name
            Err(TunnelError::Auth) => {}
            Err(err) => {
                tracing::warn!(remote = %remote, err = %err, "tunnel: handshake failed");
            }
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [(CONNECTION, "upgrade"), (UPGRADE, PROTOCOL_TOKEN)],
    )
        .into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named by Connection are hop-by-hop as well
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for h in HOP_BY_HOP.iter().copied().map(str::to_string).chain(named) {
        headers.remove(h.as_str());
    }
}

fn upstream_url(base: &reqwest::Url, path: &str, query: Option<&str>) -> reqwest::Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(query);
    url
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad gateway\n").into_response()
}

async fn proxy(State(st): State<Shared>, req: Request) -> Response {
    let Some(up) = &st.upstream else {
        return not_found().await.into_response();
    };
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_PROXY_BODY).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large\n").into_response(),
    };

    let url = upstream_url(&up.base, parts.uri.path(), parts.uri.query());
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    let orig_host = headers.remove(HOST);
    headers.remove("content-length");
    if let Some(ip) = remote {
        let xff = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prev) => format!("{prev}, {ip}"),
            None => ip,
        };
        if let Ok(v) = HeaderValue::from_str(&xff) {
            headers.insert("x-forwarded-for", v);
        }
    }
    if let Some(h) = orig_host {
        headers.insert("x-forwarded-host", h);
    }

    let resp = match up
        .client
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(upstream = %url, err = %err, "dispatch: upstream request failed");
            return bad_gateway();
        }
    };

    let status = resp.status();
    let mut out_headers = resp.headers().clone();
    strip_hop_by_hop(&mut out_headers);
    out_headers.remove("content-length");
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(upstream = %url, err = %err, "dispatch: upstream body failed");
            return bad_gateway();
        }
    };
    let mut out = Response::new(Body::from(bytes));
    *out.status_mut() = status;
    *out.headers_mut() = out_headers;
    out
}

async fn serve_connection<IO>(io: IO, app: Router)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = TowerToHyperService::new(app);
    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), svc)
        .with_upgrades();
    if let Err(err) = conn.await {
        tracing::debug!(err = %err, "dispatch: connection ended");
    }
}

/// Accepts connections until `shutdown` flips, then gives open requests a
/// short drain period. Upgraded tunnel sessions are owned by the tunnel context.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, tls = tls.is_some(), "dispatch: listening");

    let mut conns = JoinSet::new();
    loop {
        let (tcp, peer) = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => continue,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(err = %err, "dispatch: accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let _ = tcp.set_nodelay(true);
        let app = app.clone().layer(Extension(ConnectInfo(peer)));
        let tls = tls.clone();
        conns.spawn(async move {
            match tls {
                None => serve_connection(tcp, app).await,
                Some(acceptor) => match time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => serve_connection(stream, app).await,
                    Ok(Err(err)) => {
                        tracing::debug!(peer = %peer, err = %err, "dispatch: tls handshake failed");
                    }
                    Err(_) => {
                        tracing::debug!(peer = %peer, "dispatch: tls handshake timed out");
                    }
                },
            }
        });
    }

    drop(listener);
    let _ = time::timeout(DRAIN_TIMEOUT, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    conns.abort_all();
    tracing::info!(addr = %addr, "dispatch: stopped");
    Ok(())
}
