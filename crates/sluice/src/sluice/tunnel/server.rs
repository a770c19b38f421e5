use std::{sync::Arc, time::Duration};

use futures_util::SinkExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::sluice::{
    auth::{Authenticator, UserRecord},
    telemetry::{SessionInfo, SessionRegistry, new_session_id, now_unix_ms},
    tunnel::{
        error::TunnelError,
        frame::FrameCodec,
        protocol::{
            ControlMessage, PROTOCOL_VERSION, ProtocolError, SpecResult, recv_control,
            send_control,
        },
        registry::{Handle, Permits, Registry},
        session::{DEFAULT_KEEPALIVE, DEFAULT_MAX_STREAMS, Role, Session, SessionConfig},
        spec::TunnelSpec,
    },
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub keepalive: Duration,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_streams: usize,
    pub allow_reverse: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            allow_reverse: true,
        }
    }
}

/// Process-wide state shared by every tunnel session on this server.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub auth: Arc<Authenticator>,
    pub sessions: Arc<SessionRegistry>,
    pub registry: Registry,
    pub opts: ServerOptions,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(auth: Arc<Authenticator>, opts: ServerOptions) -> Self {
        Self {
            auth,
            sessions: Arc::new(SessionRegistry::new()),
            registry: Registry::new(opts.dial_timeout, opts.allow_reverse),
            opts,
            shutdown: CancellationToken::new(),
        }
    }

    /// Reverse listeners terminate TLS with `acceptor`.
    pub fn with_reverse_tls(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.registry = self.registry.with_reverse_tls(acceptor);
        self
    }
}

fn protocol_error(err: ProtocolError) -> TunnelError {
    match err {
        ProtocolError::Closed => TunnelError::Transport("connection closed during handshake".into()),
        ProtocolError::Frame(e) if !e.is_corrupt() => TunnelError::Transport(e.to_string()),
        other => TunnelError::Protocol(other.to_string()),
    }
}

/// Registers every requested spec in order. A failing spec never affects the others.
pub async fn register_all(
    registry: &Registry,
    scope: &UserRecord,
    specs: &[String],
) -> (Vec<Handle>, Permits, Vec<SpecResult>) {
    let mut handles = Vec::new();
    let mut permits = Permits::new();
    let mut results = Vec::with_capacity(specs.len());

    for raw in specs {
        let spec = match raw.parse::<TunnelSpec>() {
            Ok(s) => s,
            Err(err) => {
                results.push(SpecResult::rejected(raw.as_str(), "parse", err));
                continue;
            }
        };
        match registry.register(&spec, scope).await {
            Ok(handle) => {
                if !spec.is_reverse() {
                    permits.allow(spec.target.clone());
                }
                handles.push(handle);
                results.push(SpecResult::accepted(raw.as_str()));
            }
            Err(err) => {
                tracing::warn!(user = %scope.name, spec = %raw, err = %err, "tunnel: spec rejected");
                results.push(SpecResult::rejected(raw.as_str(), err.kind(), &err));
            }
        }
    }

    let accepted = results.iter().filter(|r| r.accepted).count() as u64;
    metrics::counter!("sluice_spec_registrations_total", "result" => "accepted").increment(accepted);
    metrics::counter!("sluice_spec_registrations_total", "result" => "rejected")
        .increment(results.len() as u64 - accepted);

    (handles, permits, results)
}

/// Runs the server half of one tunnel connection: handshake, then the session
/// until either side ends it or the server shuts down.
pub async fn serve_session<T>(ctx: ServerContext, io: T, remote: String) -> Result<(), TunnelError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(io, FrameCodec);

    let hello = time::timeout(ctx.opts.handshake_timeout, recv_control(&mut framed))
        .await
        .map_err(|_| TunnelError::Timeout("handshake"))?
        .map_err(protocol_error)?;
    let ControlMessage::Hello {
        version,
        client_version,
        user,
        secret,
        specs,
    } = hello
    else {
        return Err(TunnelError::Protocol(format!(
            "expected hello, got {}",
            hello.name()
        )));
    };

    if version != PROTOCOL_VERSION {
        let reason = ProtocolError::BadVersion(version).to_string();
        let _ = send_control(&mut framed, &ControlMessage::Rejected { reason: reason.clone() }).await;
        let _ = framed.close().await;
        return Err(TunnelError::Protocol(reason));
    }

    let auth = ctx.auth.clone();
    let name = user.clone();
    let verdict = tokio::task::spawn_blocking(move || auth.authenticate(&name, secret.expose()))
        .await
        .map_err(|e| TunnelError::Transport(format!("auth task: {e}")))?;
    let scope = match verdict {
        Ok(scope) => scope,
        Err(err) => {
            tracing::warn!(user = %user, remote = %remote, err = %err, "tunnel: authentication failed");
            let _ = send_control(
                &mut framed,
                &ControlMessage::Rejected {
                    reason: TunnelError::Auth.to_string(),
                },
            )
            .await;
            let _ = framed.close().await;
            return Err(TunnelError::Auth);
        }
    };

    let session_id = new_session_id();
    let (mut handles, permits, results) = register_all(&ctx.registry, &scope, &specs).await;
    let accepted: Vec<String> = results
        .iter()
        .filter(|r| r.accepted)
        .map(|r| r.spec.clone())
        .collect();
    let welcome = ControlMessage::Welcome {
        session_id: session_id.clone(),
        version: PROTOCOL_VERSION,
        keepalive_ms: ctx.opts.keepalive.as_millis() as u64,
        results,
    };
    if let Err(err) = send_control(&mut framed, &welcome).await {
        for h in handles {
            h.deregister().await;
        }
        return Err(protocol_error(err));
    }

    // Clients never send slower than the interval we announced.
    let cfg = SessionConfig {
        max_streams: ctx.opts.max_streams,
        ..SessionConfig::default().with_keepalive(ctx.opts.keepalive)
    };
    let session = Session::new(framed, Role::Server, session_id.clone(), cfg);
    for h in handles.iter_mut() {
        h.start(&session);
    }
    let inbound = ctx.registry.serve_inbound(session.clone(), Arc::new(permits));

    metrics::counter!("sluice_sessions_total").increment(1);
    ctx.sessions.add(
        SessionInfo {
            id: session_id.clone(),
            user: scope.name.clone(),
            remote: remote.clone(),
            specs: accepted.clone(),
            started_at_unix_ms: now_unix_ms(),
            streams: 0,
        },
        session.clone(),
    );
    tracing::info!(
        session = %session_id,
        user = %scope.name,
        remote = %remote,
        client_version = %client_version,
        specs = accepted.len(),
        "tunnel: session established"
    );

    tokio::select! {
        _ = session.closed() => {}
        _ = ctx.shutdown.cancelled() => session.close("server shutting down"),
    }

    for h in handles {
        h.deregister().await;
    }
    let _ = inbound.await;
    ctx.sessions.remove(&session_id);

    let reason = session
        .close_reason()
        .map(|r| r.to_string())
        .unwrap_or_default();
    tracing::info!(session = %session_id, user = %scope.name, reason = %reason, "tunnel: session ended");
    Ok(())
}
