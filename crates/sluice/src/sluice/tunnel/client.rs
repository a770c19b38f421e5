use std::{fmt, sync::Arc, time::Duration};

use rand::{RngExt, rng};
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tokio_util::codec::Framed;

use crate::sluice::tunnel::{
    error::{CloseReason, TunnelError},
    frame::FrameCodec,
    protocol::{ControlMessage, PROTOCOL_VERSION, ProtocolError, Secret, recv_control, send_control},
    registry::{Handle, Permits, Registry},
    server::{DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT},
    session::{
        DEFAULT_KEEPALIVE, DEFAULT_MAX_STREAMS, KEEPALIVE_MISSES, Role, Session, SessionConfig,
    },
    spec::TunnelSpec,
    transport::Connector,
};

/// Lifecycle of the client's control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Authenticating => "authenticating",
            ConnState::Active => "active",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user: String,
    pub secret: Secret,
    pub specs: Vec<String>,
    pub keepalive: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_streams: usize,
    /// Consecutive failed attempts before giving up; negative retries forever.
    pub max_retry_count: i64,
    pub min_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// A session that lived this long resets the backoff.
    pub stable_after: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            secret: Secret::default(),
            specs: Vec::new(),
            keepalive: DEFAULT_KEEPALIVE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            max_retry_count: -1,
            min_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(5 * 60),
            stable_after: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff (x2) with +/-25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jittered = base.mul_f64(0.75 + rng().random::<f64>() * 0.5);
        jittered.clamp(self.min, self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Send interval and idle deadline for a session with this server.
///
/// We send at the smaller non-zero of both intervals. Silence is judged
/// against what the server promised to send; a server that sends nothing
/// can never be timed out.
fn keepalive_plan(own: Duration, server_ms: u64) -> (Duration, Duration) {
    let server = Duration::from_millis(server_ms);
    let send = match (own.is_zero(), server.is_zero()) {
        (true, _) => server,
        (false, true) => own,
        (false, false) => own.min(server),
    };
    (send, server * KEEPALIVE_MISSES)
}

enum Outcome {
    Shutdown,
    Ended {
        active_for: Duration,
        reason: Option<CloseReason>,
    },
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Keeps one session to the server alive, re-registering every spec after a drop.
pub struct Client {
    opts: ClientOptions,
    connector: Arc<dyn Connector>,
    registry: Registry,
    state: watch::Sender<ConnState>,
}

impl Client {
    pub fn new(opts: ClientOptions, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        for raw in &opts.specs {
            raw.parse::<TunnelSpec>()
                .map_err(|e| anyhow::anyhow!("tunnel: invalid spec {raw:?}: {e}"))?;
        }
        let (state, _) = watch::channel(ConnState::Disconnected);
        Ok(Self {
            registry: Registry::new(opts.dial_timeout, true),
            opts,
            connector,
            state,
        })
    }

    pub fn state(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    fn set_state(&self, s: ConnState) {
        let prev = self.state.send_replace(s);
        if prev != s {
            tracing::debug!(from = %prev, to = %s, server = %self.connector.describe(), "tunnel: client state");
        }
    }

    /// Runs until `shutdown` flips to true, or until `max_retry_count`
    /// consecutive attempts failed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(self.opts.min_retry_interval, self.opts.max_retry_interval);
        let mut failures: i64 = 0;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnState::Connecting);
            let outcome = self.run_once(&mut shutdown).await;
            self.set_state(ConnState::Disconnected);

            match outcome {
                Ok(Outcome::Shutdown) => return Ok(()),
                Ok(Outcome::Ended { active_for, reason }) => {
                    failures = 0;
                    if active_for >= self.opts.stable_after {
                        backoff.reset();
                    }
                    let reason = reason.map(|r| r.to_string()).unwrap_or_default();
                    tracing::warn!(
                        server = %self.connector.describe(),
                        reason = %reason,
                        uptime = %humantime::format_duration(Duration::from_secs(active_for.as_secs())),
                        "tunnel: session lost"
                    );
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        server = %self.connector.describe(),
                        err = %err,
                        attempt = failures,
                        "tunnel: connect failed"
                    );
                    if self.opts.max_retry_count >= 0 && failures > self.opts.max_retry_count {
                        anyhow::bail!("tunnel: giving up after {failures} failed attempts: {err}");
                    }
                }
            }

            let delay = backoff.next_delay();
            tracing::info!(
                server = %self.connector.describe(),
                backoff = %humantime::format_duration(Duration::from_millis(delay.as_millis() as u64)),
                "tunnel: reconnecting"
            );
            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => {
                    return Ok(());
                }
                _ = time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Outcome, TunnelError> {
        // Dial, TLS, upgrade and the hello exchange share one deadline.
        let deadline = Instant::now() + self.opts.handshake_timeout;
        let io = tokio::select! {
            r = time::timeout_at(deadline, self.connector.connect()) => {
                r.map_err(|_| TunnelError::Timeout("handshake"))??
            }
            _ = wait_shutdown(shutdown) => return Ok(Outcome::Shutdown),
        };

        self.set_state(ConnState::Authenticating);
        let mut framed = Framed::new(io, FrameCodec);
        let hello = ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            user: self.opts.user.clone(),
            secret: self.opts.secret.clone(),
            specs: self.opts.specs.clone(),
        };
        time::timeout_at(deadline, send_control(&mut framed, &hello))
            .await
            .map_err(|_| TunnelError::Timeout("handshake"))?
            .map_err(handshake_error)?;
        let reply = time::timeout_at(deadline, recv_control(&mut framed))
            .await
            .map_err(|_| TunnelError::Timeout("handshake"))?
            .map_err(handshake_error)?;

        let (session_id, keepalive_ms, results) = match reply {
            ControlMessage::Welcome {
                session_id,
                version,
                keepalive_ms,
                results,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(TunnelError::Protocol(
                        ProtocolError::BadVersion(version).to_string(),
                    ));
                }
                (session_id, keepalive_ms, results)
            }
            ControlMessage::Rejected { reason } => {
                if reason == TunnelError::Auth.to_string() {
                    return Err(TunnelError::Auth);
                }
                return Err(TunnelError::Protocol(format!("rejected: {reason}")));
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected welcome, got {}",
                    other.name()
                )));
            }
        };

        let mut permits = Permits::new();
        let mut local: Vec<Handle> = Vec::new();
        for r in &results {
            if !r.accepted {
                tracing::warn!(
                    session = %session_id,
                    spec = %r.spec,
                    kind = r.error_kind.as_deref().unwrap_or(""),
                    err = r.error.as_deref().unwrap_or(""),
                    "tunnel: spec rejected by server"
                );
                continue;
            }
            let Ok(spec) = r.spec.parse::<TunnelSpec>() else {
                continue;
            };
            if spec.is_reverse() {
                permits.allow(spec.target.clone());
                continue;
            }
            match self.registry.bind_local(&spec).await {
                Ok(h) => local.push(h),
                Err(err) => {
                    tracing::warn!(session = %session_id, spec = %spec, err = %err, "tunnel: local listener failed");
                }
            }
        }

        let (keepalive_interval, idle_timeout) = keepalive_plan(self.opts.keepalive, keepalive_ms);
        let cfg = SessionConfig {
            keepalive_interval,
            idle_timeout,
            max_streams: self.opts.max_streams,
            ..SessionConfig::default()
        };
        let session = Session::new(framed, Role::Client, session_id.clone(), cfg);
        for h in local.iter_mut() {
            h.start(&session);
        }
        let inbound = self.registry.serve_inbound(session.clone(), Arc::new(permits));

        self.set_state(ConnState::Active);
        tracing::info!(
            session = %session_id,
            server = %self.connector.describe(),
            accepted = results.iter().filter(|r| r.accepted).count(),
            rejected = results.iter().filter(|r| !r.accepted).count(),
            "tunnel: connected"
        );
        let started = Instant::now();

        let requested = tokio::select! {
            _ = session.closed() => false,
            _ = wait_shutdown(shutdown) => {
                session.close("client shutting down");
                true
            }
        };

        for h in local {
            h.deregister().await;
        }
        let _ = inbound.await;

        if requested {
            return Ok(Outcome::Shutdown);
        }
        Ok(Outcome::Ended {
            active_for: started.elapsed(),
            reason: session.close_reason(),
        })
    }
}

fn handshake_error(err: ProtocolError) -> TunnelError {
    match err {
        ProtocolError::Closed => TunnelError::Transport("connection closed during handshake".into()),
        ProtocolError::Frame(e) if !e.is_corrupt() => TunnelError::Transport(e.to_string()),
        other => TunnelError::Protocol(other.to_string()),
    }
}
