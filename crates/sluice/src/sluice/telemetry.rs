use std::{
    fmt::Write as _,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rand::{RngExt, rng};
use serde::Serialize;

use crate::sluice::tunnel::session::Session;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user: String,
    pub remote: String,
    pub specs: Vec<String>,
    pub started_at_unix_ms: u64,
    pub streams: usize,
}

#[derive(Debug)]
struct Entry {
    info: SessionInfo,
    session: Session,
}

/// Live tunnel sessions on this server.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Entry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, info: SessionInfo, session: Session) {
        metrics::gauge!("sluice_active_sessions").increment(1.0);
        self.sessions
            .insert(info.id.clone(), Entry { info, session });
    }

    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            metrics::gauge!("sluice_active_sessions").decrement(1.0);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for e in self.sessions.iter() {
            let mut info = e.value().info.clone();
            info.streams = e.value().session.stream_count();
            out.push(info);
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Asks every session to go away. Entries are removed by their owners.
    pub fn close_all(&self, reason: &str) {
        for e in self.sessions.iter() {
            e.value().session.close(reason);
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 128 random bits, hex encoded.
pub fn new_session_id() -> String {
    let mut r = rng();
    let mut out = String::with_capacity(32);
    for _ in 0..2 {
        let _ = write!(out, "{:016x}", r.random::<u64>());
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ReloadSignal {
    // Monotonic counter; increment indicates a reload request.
    pub seq: u64,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self { seq: 0 }
    }

    pub fn next(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }
}

pub type SharedSessions = Arc<SessionRegistry>;

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use tokio_util::codec::Framed;

    use super::*;
    use crate::sluice::tunnel::{
        frame::FrameCodec,
        session::{Role, SessionConfig},
    };

    #[test]
    fn session_ids_are_unique_hex() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn registry_tracks_and_closes_sessions() {
        let (a, b) = tokio::io::duplex(4096);
        let s = Session::new(Framed::new(a, FrameCodec), Role::Server, "one", SessionConfig::default());
        let _peer = Session::new(Framed::new(b, FrameCodec), Role::Client, "one", SessionConfig::default());

        let reg = SessionRegistry::new();
        reg.add(
            SessionInfo {
                id: "one".into(),
                user: "alice".into(),
                remote: "127.0.0.1:5000".into(),
                specs: vec!["R:8080:localhost:80".into()],
                started_at_unix_ms: now_unix_ms(),
                streams: 0,
            },
            s.clone(),
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot()[0].user, "alice");

        reg.close_all("maintenance");
        s.closed().await;
        reg.remove("one");
        assert!(reg.is_empty());
    }
}
