use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use hyper::{
    Request, StatusCode,
    header::{CONNECTION, HOST, HeaderName, HeaderValue, UPGRADE},
};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::sluice::tunnel::{
    error::TunnelError, protocol::PROTOCOL_TOKEN, registry::dial, spec::HostPort,
};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Where the client finds the server. `ws`/`wss` are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub tls: bool,
    pub addr: HostPort,
    pub path: String,
}

impl ServerUrl {
    fn default_port(&self) -> u16 {
        if self.tls { 443 } else { 80 }
    }

    /// Value for the `Host` header; the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.addr.port != self.default_port() {
            self.addr.to_string()
        } else if self.addr.host.contains(':') {
            format!("[{}]", self.addr.host)
        } else {
            self.addr.host.clone()
        }
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}{}", self.addr, self.path)
    }
}

impl FromStr for ServerUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            anyhow::bail!("tunnel: empty server url");
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        let url = reqwest::Url::parse(&with_scheme)
            .map_err(|e| anyhow::anyhow!("tunnel: invalid server url {raw:?}: {e}"))?;

        let (tls, default_port) = match url.scheme() {
            "https" | "wss" => (true, 443),
            "http" | "ws" => (false, 80),
            other => anyhow::bail!("tunnel: unsupported url scheme {other:?} in {raw:?}"),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("tunnel: server url {raw:?} has no host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }

        Ok(ServerUrl {
            tls,
            addr: HostPort::new(host, url.port().unwrap_or(default_port)),
            path,
        })
    }
}

/// Produces a fresh upgraded byte stream to the server on every call.
#[async_trait]
pub trait Connector: Send + Sync {
    fn describe(&self) -> String;
    async fn connect(&self) -> Result<BoxedStream, TunnelError>;
}

/// TCP dial, optional TLS, then an HTTP/1.1 upgrade to the tunnel protocol.
pub struct HttpUpgradeConnector {
    url: ServerUrl,
    tls: Option<TlsConnector>,
    server_name: Option<String>,
    headers: Vec<(HeaderName, HeaderValue)>,
    dial_timeout: Duration,
}

impl HttpUpgradeConnector {
    pub fn new(url: ServerUrl, dial_timeout: Duration) -> Self {
        Self {
            url,
            tls: None,
            server_name: None,
            headers: Vec::new(),
            dial_timeout,
        }
    }

    /// Required for `https` urls. `server_name` overrides the SNI/verification name.
    pub fn with_tls(mut self, cfg: Arc<rustls::ClientConfig>, server_name: Option<String>) -> Self {
        self.tls = Some(TlsConnector::from(cfg));
        self.server_name = server_name.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_headers<'a>(
        mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> anyhow::Result<Self> {
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| anyhow::anyhow!("tunnel: invalid header name {k:?}: {e}"))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| anyhow::anyhow!("tunnel: invalid value for header {k:?}: {e}"))?;
            self.headers.push((name, value));
        }
        Ok(self)
    }

    async fn open_transport(&self) -> Result<BoxedStream, TunnelError> {
        let tcp = dial(&self.url.addr, self.dial_timeout).await?;
        if !self.url.tls {
            return Ok(Box::new(tcp));
        }
        let Some(tls) = &self.tls else {
            return Err(TunnelError::Transport(format!(
                "{} requires tls but no tls client is configured",
                self.url
            )));
        };
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| self.url.addr.host.clone());
        let name = ServerName::try_from(name.clone())
            .map_err(|e| TunnelError::Transport(format!("invalid tls server name {name:?}: {e}")))?;
        let conn = tls
            .connect(name, tcp)
            .await
            .map_err(|e| TunnelError::Transport(format!("tls handshake: {e}")))?;
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Connector for HttpUpgradeConnector {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn connect(&self) -> Result<BoxedStream, TunnelError> {
        let io = self.open_transport().await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(io))
            .await
            .map_err(|e| TunnelError::Transport(format!("http handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                tracing::debug!(err = %err, "tunnel: upgrade connection ended");
            }
        });

        let mut builder = Request::get(self.url.path.as_str())
            .header(HOST, self.url.host_header())
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, PROTOCOL_TOKEN);
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        let req = builder
            .body(Body::empty())
            .map_err(|e| TunnelError::Transport(format!("build upgrade request: {e}")))?;

        let mut res = sender
            .send_request(req)
            .await
            .map_err(|e| TunnelError::Transport(format!("upgrade request: {e}")))?;
        if res.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(TunnelError::Transport(format!(
                "server answered {} instead of switching protocols",
                res.status()
            )));
        }
        let upgraded = hyper::upgrade::on(&mut res)
            .await
            .map_err(|e| TunnelError::Transport(format!("upgrade: {e}")))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}
