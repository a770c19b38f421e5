use std::{collections::HashSet, fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
    time,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::sluice::{
    auth::UserRecord,
    tunnel::{
        error::TunnelError,
        session::Session,
        spec::{HostPort, TunnelSpec},
        stream::Stream,
    },
};

/// Bound on a reverse listener's TLS handshake.
const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminates TLS on reverse listeners before bytes enter the tunnel.
#[derive(Clone)]
pub struct ReverseTls(pub TlsAcceptor);

impl fmt::Debug for ReverseTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReverseTls")
    }
}

struct ActiveStreamGuard;

impl ActiveStreamGuard {
    fn new() -> Self {
        metrics::counter!("sluice_proxied_streams_total").increment(1);
        metrics::gauge!("sluice_active_streams").increment(1.0);
        Self
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        metrics::gauge!("sluice_active_streams").decrement(1.0);
    }
}

/// Checks a spec against the user's address patterns.
pub fn authorize(
    spec: &TunnelSpec,
    scope: &UserRecord,
    allow_reverse: bool,
) -> Result<(), TunnelError> {
    if spec.is_reverse() && !allow_reverse {
        return Err(TunnelError::Authorization(
            "reverse tunnels are disabled on this server".into(),
        ));
    }
    let addr = spec.authorization_addr();
    if !scope.may_use(addr) {
        return Err(TunnelError::Authorization(format!(
            "user {:?} may not use {}",
            scope.name, addr
        )));
    }
    Ok(())
}

/// Targets a session's peer may ask us to dial.
#[derive(Debug, Default, Clone)]
pub struct Permits {
    targets: HashSet<HostPort>,
}

impl Permits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, target: HostPort) {
        self.targets.insert(target);
    }

    pub fn allows(&self, target: &HostPort) -> bool {
        self.targets.contains(target)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A registered spec. Listening specs own their socket until deregistered.
#[derive(Debug)]
pub struct Handle {
    spec: TunnelSpec,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    tls: Option<ReverseTls>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Handle {
    fn permit_only(spec: TunnelSpec) -> Self {
        Self {
            spec,
            listener: None,
            local_addr: None,
            tls: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    async fn bind(spec: TunnelSpec, tls: Option<ReverseTls>) -> Result<Self, TunnelError> {
        let addr = spec.bind.to_string();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::Bind {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().ok();
        Ok(Self {
            spec,
            listener: Some(listener),
            local_addr,
            tls,
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// The bound address, for listening specs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some() || self.task.is_some()
    }

    /// Starts turning accepted connections into streams on `session`.
    pub fn start(&mut self, session: &Session) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.task = Some(tokio::spawn(accept_loop(
            listener,
            session.clone(),
            self.spec.clone(),
            self.tls.clone(),
            self.cancel.clone(),
        )));
    }

    /// Stops the listener and every stream it spawned. The socket is closed on return.
    pub async fn deregister(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.listener = None;
        tracing::debug!(spec = %self.spec, "tunnel: deregistered");
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns specs into listeners and inbound streams into dialed connections.
#[derive(Debug, Clone)]
pub struct Registry {
    dial_timeout: Duration,
    allow_reverse: bool,
    reverse_tls: Option<ReverseTls>,
}

impl Registry {
    pub fn new(dial_timeout: Duration, allow_reverse: bool) -> Self {
        Self {
            dial_timeout,
            allow_reverse,
            reverse_tls: None,
        }
    }

    /// Reverse listeners registered from now on speak TLS to their callers.
    pub fn with_reverse_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.reverse_tls = Some(ReverseTls(acceptor));
        self
    }

    /// Server side: authorizes `spec` for `scope` and, for reverse specs,
    /// binds the listener right away so conflicts surface in the handshake.
    pub async fn register(
        &self,
        spec: &TunnelSpec,
        scope: &UserRecord,
    ) -> Result<Handle, TunnelError> {
        authorize(spec, scope, self.allow_reverse)?;
        if spec.is_reverse() {
            Handle::bind(spec.clone(), self.reverse_tls.clone()).await
        } else {
            Ok(Handle::permit_only(spec.clone()))
        }
    }

    /// Client side: listens locally for a forward spec.
    pub async fn bind_local(&self, spec: &TunnelSpec) -> Result<Handle, TunnelError> {
        Handle::bind(spec.clone(), None).await
    }

    /// Accepts peer-opened streams for as long as the session lives, dialing
    /// permitted targets and refusing the rest.
    pub fn serve_inbound(&self, session: Session, permits: Arc<Permits>) -> JoinHandle<()> {
        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            let mut conns = JoinSet::new();
            loop {
                tokio::select! {
                    next = session.accept_stream() => match next {
                        Some(stream) => {
                            conns.spawn(handle_inbound(stream, permits.clone(), dial_timeout));
                        }
                        None => break,
                    },
                    Some(_) = conns.join_next(), if !conns.is_empty() => {}
                }
            }
            conns.abort_all();
            while conns.join_next().await.is_some() {}
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Session,
    spec: TunnelSpec,
    tls: Option<ReverseTls>,
    cancel: CancellationToken,
) {
    let target = spec.target.to_string();
    tracing::info!(session = %session.id(), spec = %spec, tls = tls.is_some(), "tunnel: listening");

    let mut conns = JoinSet::new();
    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session.closed() => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => continue,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(spec = %spec, err = %err, "tunnel: accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let session = session.clone();
        let target = target.clone();
        let tls = tls.clone();
        conns.spawn(async move {
            let _ = tcp.set_nodelay(true);
            let Some(ReverseTls(acceptor)) = tls else {
                open_and_pipe(&session, &target, peer, tcp).await;
                return;
            };
            match time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(conn)) => open_and_pipe(&session, &target, peer, conn).await,
                Ok(Err(err)) => {
                    tracing::debug!(peer = %peer, err = %err, "tunnel: tls handshake failed");
                }
                Err(_) => tracing::debug!(peer = %peer, "tunnel: tls handshake timed out"),
            }
        });
    }

    drop(listener);
    conns.abort_all();
    while conns.join_next().await.is_some() {}
}

async fn open_and_pipe<C>(session: &Session, target: &str, peer: SocketAddr, conn: C)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    match session.open_stream(target).await {
        Ok(stream) => pipe(stream, conn).await,
        Err(err) => {
            tracing::warn!(
                session = %session.id(),
                peer = %peer,
                target = %target,
                err = %err,
                "tunnel: open stream failed"
            );
        }
    }
}

async fn handle_inbound(mut stream: Stream, permits: Arc<Permits>, dial_timeout: Duration) {
    let target = match stream.target().parse::<HostPort>() {
        Ok(t) if permits.allows(&t) => t,
        _ => {
            tracing::warn!(
                session = %stream.session_id(),
                stream = stream.id(),
                target = %stream.target(),
                "tunnel: stream target not permitted"
            );
            stream.reject();
            return;
        }
    };

    let tcp = match dial(&target, dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(
                session = %stream.session_id(),
                stream = stream.id(),
                target = %target,
                err = %err,
                "tunnel: dial target failed"
            );
            stream.reject();
            return;
        }
    };

    if let Err(err) = stream.accept() {
        tracing::debug!(stream = stream.id(), err = %err, "tunnel: stream gone before accept");
        return;
    }
    pipe(stream, tcp).await;
}

pub async fn dial(target: &HostPort, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let conn = if timeout.is_zero() {
        connect.await
    } else {
        time::timeout(timeout, connect)
            .await
            .map_err(|_| TunnelError::Timeout("dial target"))?
    };
    let conn = conn.map_err(|e| TunnelError::Transport(format!("dial {target}: {e}")))?;
    let _ = conn.set_nodelay(true);
    Ok(conn)
}

/// Copies bytes both ways until both sides finished; half-closes propagate.
pub async fn pipe<C>(mut stream: Stream, mut conn: C)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let _active = ActiveStreamGuard::new();
    let id = stream.id();
    match tokio::io::copy_bidirectional(&mut stream, &mut conn).await {
        Ok((to_target, from_target)) => {
            metrics::counter!("sluice_bytes_proxied_total", "direction" => "to_target")
                .increment(to_target);
            metrics::counter!("sluice_bytes_proxied_total", "direction" => "from_target")
                .increment(from_target);
            tracing::debug!(
                session = %stream.session_id(),
                stream = id,
                to_target,
                from_target,
                "tunnel: stream finished"
            );
        }
        Err(err) => {
            tracing::debug!(session = %stream.session_id(), stream = id, err = %err, "tunnel: stream aborted");
        }
    }
}
