use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot},
    time::Instant,
};
use tokio_util::{
    codec::{Framed, FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::sluice::tunnel::{
    error::{CloseReason, TunnelError},
    frame::{Frame, FrameCodec, FrameError, FrameKind},
    protocol::ControlMessage,
    stream::{Inbound, MAX_DATA_CHUNK, Stream, StreamCore},
};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);
/// Silent intervals tolerated before the peer is considered gone.
pub const KEEPALIVE_MISSES: u32 = 3;
pub const DEFAULT_MAX_STREAMS: usize = 1024;
pub const DEFAULT_WINDOW: u32 = 256 * 1024;
pub const DEFAULT_ID_GRACE: Duration = Duration::from_secs(10);
/// DATA bytes a session queues toward the transport before writers stall.
pub const DEFAULT_SEND_BUFFER: usize = 1024 * 1024;

/// Which end of the connection this session is. Clients open odd stream IDs,
/// servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn owns(self, id: u32) -> bool {
        (id % 2 == 1) == (self == Role::Client)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often we send a keepalive. Zero sends none.
    pub keepalive_interval: Duration,
    /// Close after receiving nothing for this long. Zero waits forever.
    ///
    /// Must follow the peer's send interval, not ours.
    pub idle_timeout: Duration,
    /// Upper bound on DATA bytes queued for the transport.
    pub send_buffer: usize,
    pub max_streams: usize,
    pub initial_window: u32,
    pub open_timeout: Duration,
    pub id_grace: Duration,
    pub max_stream_id: u32,
    pub accept_backlog: usize,
}

impl SessionConfig {
    /// Both peers send every `interval`; silence for `KEEPALIVE_MISSES` intervals closes.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self.idle_timeout = interval * KEEPALIVE_MISSES;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE,
            idle_timeout: DEFAULT_KEEPALIVE * KEEPALIVE_MISSES,
            send_buffer: DEFAULT_SEND_BUFFER,
            max_streams: DEFAULT_MAX_STREAMS,
            initial_window: DEFAULT_WINDOW,
            open_timeout: Duration::from_secs(10),
            id_grace: DEFAULT_ID_GRACE,
            max_stream_id: u32::MAX,
            accept_backlog: 128,
        }
    }
}

#[derive(Debug)]
struct IdAllocator {
    next: Option<u32>,
    max: u32,
    released: VecDeque<(u32, Instant)>,
    grace: Duration,
}

impl IdAllocator {
    fn new(first: u32, max: u32, grace: Duration) -> Self {
        Self {
            next: Some(first).filter(|f| *f <= max),
            max,
            released: VecDeque::new(),
            grace,
        }
    }

    fn allocate(&mut self, now: Instant, live: impl Fn(u32) -> bool) -> Option<u32> {
        if let Some(id) = self.next {
            self.next = id.checked_add(2).filter(|n| *n <= self.max);
            return Some(id);
        }
        while let Some(&(id, at)) = self.released.front() {
            if now.duration_since(at) < self.grace {
                return None;
            }
            self.released.pop_front();
            if !live(id) {
                return Some(id);
            }
        }
        None
    }

    fn release(&mut self, id: u32, now: Instant) {
        self.released.push_back((id, now));
    }
}

struct Slot {
    core: Arc<StreamCore>,
    inbox: mpsc::UnboundedSender<Inbound>,
    pending_open: Option<oneshot::Sender<Result<(), TunnelError>>>,
}

struct Outbound {
    frame: Frame,
    budget: Option<OwnedSemaphorePermit>,
}

struct StreamTable {
    slots: HashMap<u32, Slot>,
    ids: IdAllocator,
}

pub(crate) struct SessionShared {
    pub(crate) id: String,
    role: Role,
    pub(crate) cfg: SessionConfig,
    out: mpsc::UnboundedSender<Outbound>,
    /// One permit per queued DATA byte; returned once the frame hit the transport.
    pub(crate) send_budget: Arc<Semaphore>,
    table: Mutex<StreamTable>,
    cancel: CancellationToken,
    reason: OnceLock<CloseReason>,
    limit: Arc<Semaphore>,
    started: Instant,
    last_recv_ms: AtomicU64,
}

impl SessionShared {
    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn closed_error(&self) -> TunnelError {
        let reason = self
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| CloseReason::Transport("connection lost".into()));
        TunnelError::SessionClosed(reason)
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.out
            .send(Outbound {
                frame,
                budget: None,
            })
            .map_err(|_| self.closed_error())
    }

    /// Queues DATA holding `budget` until the write loop has written it.
    pub(crate) fn send_data(
        &self,
        frame: Frame,
        budget: OwnedSemaphorePermit,
    ) -> Result<(), TunnelError> {
        self.out
            .send(Outbound {
                frame,
                budget: Some(budget),
            })
            .map_err(|_| self.closed_error())
    }

    /// Drops a fully closed stream from the table and frees its ID.
    pub(crate) fn finish(&self, core: &Arc<StreamCore>) {
        let mut t = self.table();
        let live = t
            .slots
            .get(&core.id)
            .is_some_and(|s| Arc::ptr_eq(&s.core, core));
        if live {
            t.slots.remove(&core.id);
            self.release(&mut t, core.id);
        }
    }

    fn release(&self, t: &mut StreamTable, id: u32) {
        if self.role.owns(id) {
            t.ids.release(id, Instant::now());
        }
    }

    fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_recv_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_recv_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub(crate) fn shutdown(&self, reason: CloseReason) {
        if self.reason.set(reason.clone()).is_err() {
            return;
        }
        if let CloseReason::Local(msg) = &reason {
            let go_away = ControlMessage::GoAway {
                reason: msg.clone(),
            };
            if let Ok(payload) = go_away.encode() {
                let _ = self.send(Frame::control(payload));
            }
        }

        let slots: Vec<Slot> = self.table().slots.drain().map(|(_, s)| s).collect();
        let streams = slots.len();
        for slot in slots {
            let err = TunnelError::SessionClosed(reason.clone());
            slot.core.on_reset(err.clone());
            let _ = slot.inbox.send(Inbound::Reset(err.clone()));
            if let Some(tx) = slot.pending_open {
                let _ = tx.send(Err(err));
            }
        }
        self.limit.close();
        self.send_budget.close();
        self.cancel.cancel();

        if reason.is_requested() {
            tracing::info!(session = %self.id, streams, reason = %reason, "session closed");
        } else {
            tracing::warn!(session = %self.id, streams, reason = %reason, "session closed");
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<(), CloseReason> {
        match frame.kind {
            FrameKind::Control => self.on_control(frame),
            FrameKind::Open if frame.is_ack() => self.on_open_ack(frame.stream_id),
            FrameKind::Open => self.on_open(frame, incoming),
            FrameKind::Data => self.on_data(frame),
            FrameKind::WindowUpdate => self.on_window_update(frame),
            FrameKind::Close => {
                self.on_close(frame);
                Ok(())
            }
        }
    }

    fn on_control(&self, frame: Frame) -> Result<(), CloseReason> {
        if frame.is_keepalive() {
            return Ok(());
        }
        match ControlMessage::decode(&frame.payload) {
            Ok(ControlMessage::GoAway { reason }) => Err(CloseReason::Remote(reason)),
            Ok(other) => {
                tracing::warn!(session = %self.id, message = other.name(), "unexpected control message");
                Ok(())
            }
            Err(err) => Err(CloseReason::Protocol(err.to_string())),
        }
    }

    fn on_open(
        self: &Arc<Self>,
        frame: Frame,
        incoming: &mpsc::Sender<Stream>,
    ) -> Result<(), CloseReason> {
        let id = frame.stream_id;
        if self.role.owns(id) {
            return Err(CloseReason::Protocol(format!(
                "peer opened stream {id} from our id space"
            )));
        }
        let target = String::from_utf8(frame.payload.to_vec())
            .map_err(|_| CloseReason::Protocol(format!("stream {id} target is not utf-8")))?;

        let Ok(permit) = self.limit.clone().try_acquire_owned() else {
            tracing::warn!(session = %self.id, stream = id, "stream limit reached; resetting");
            let _ = self.send(Frame::reset(id));
            return Ok(());
        };

        let (core, inbox) = {
            let mut t = self.table();
            if t.slots.contains_key(&id) {
                return Err(CloseReason::Protocol(format!("duplicate stream id {id}")));
            }
            let core = StreamCore::new(id, self.cfg.initial_window);
            let (tx, rx) = mpsc::unbounded_channel();
            t.slots.insert(
                id,
                Slot {
                    core: core.clone(),
                    inbox: tx,
                    pending_open: None,
                },
            );
            (core, rx)
        };

        let stream = Stream::new(core, self.clone(), inbox, target, true, permit);
        if let Err(err) = incoming.try_send(stream) {
            tracing::warn!(session = %self.id, stream = id, "accept backlog full; resetting");
            // dropping the stream resets it
            drop(err.into_inner());
        }
        Ok(())
    }

    fn on_open_ack(&self, id: u32) -> Result<(), CloseReason> {
        let mut t = self.table();
        let Some(slot) = t.slots.get_mut(&id) else {
            tracing::debug!(session = %self.id, stream = id, "open ack for unknown stream");
            return Ok(());
        };
        let Some(tx) = slot.pending_open.take() else {
            return Err(CloseReason::Protocol(format!(
                "unexpected open ack for stream {id}"
            )));
        };
        slot.core.on_open_ack();
        drop(t);
        let _ = tx.send(Ok(()));
        Ok(())
    }

    fn on_data(&self, frame: Frame) -> Result<(), CloseReason> {
        let id = frame.stream_id;
        let t = self.table();
        let Some(slot) = t.slots.get(&id) else {
            tracing::debug!(session = %self.id, stream = id, "data for unknown stream");
            return Ok(());
        };
        slot.core
            .on_data(frame.payload.len())
            .map_err(|e| CloseReason::Protocol(e.to_string()))?;
        let _ = slot.inbox.send(Inbound::Data(frame.payload));
        Ok(())
    }

    fn on_window_update(&self, frame: Frame) -> Result<(), CloseReason> {
        let id = frame.stream_id;
        let t = self.table();
        let Some(slot) = t.slots.get(&id) else {
            tracing::debug!(session = %self.id, stream = id, "window update for unknown stream");
            return Ok(());
        };
        slot.core
            .on_window_update(frame.window_increment())
            .map_err(|e| CloseReason::Protocol(e.to_string()))
    }

    fn on_close(&self, frame: Frame) {
        let id = frame.stream_id;
        let mut t = self.table();
        if !t.slots.contains_key(&id) {
            tracing::debug!(session = %self.id, stream = id, "close for unknown stream");
            return;
        }

        if frame.is_rst() {
            let Some(slot) = t.slots.remove(&id) else {
                return;
            };
            self.release(&mut t, id);
            drop(t);
            slot.core.on_reset(TunnelError::StreamClosed);
            match slot.pending_open {
                Some(tx) => {
                    let _ = tx.send(Err(TunnelError::StreamRefused));
                }
                None => {
                    let _ = slot.inbox.send(Inbound::Reset(TunnelError::StreamClosed));
                }
            }
            return;
        }

        let done = match t.slots.get(&id) {
            Some(slot) => {
                let done = slot.core.on_remote_fin();
                let _ = slot.inbox.send(Inbound::Fin);
                done
            }
            None => false,
        };
        if done {
            t.slots.remove(&id);
            self.release(&mut t, id);
        }
    }
}

/// One physical connection carrying many [`Stream`]s.
///
/// Cheap to clone; every clone drives the same connection. The session ends when
/// the transport fails, the peer violates the protocol or goes quiet past the
/// keepalive deadline, or [`Session::close`] is called.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<Stream>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Takes over a transport after the handshake. Bytes already buffered by
    /// `framed` are preserved.
    pub fn new<T>(
        framed: Framed<T, FrameCodec>,
        role: Role,
        id: impl Into<String>,
        cfg: SessionConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(cfg.accept_backlog.max(1));

        let parts = framed.into_parts();
        let (rd, wr) = tokio::io::split(parts.io);
        let mut reader = FramedRead::new(rd, FrameCodec);
        *reader.read_buffer_mut() = parts.read_buf;
        let mut writer = FramedWrite::new(wr, FrameCodec);
        writer.write_buffer_mut().extend_from_slice(&parts.write_buf);

        let shared = Arc::new(SessionShared {
            id: id.into(),
            role,
            table: Mutex::new(StreamTable {
                slots: HashMap::new(),
                ids: IdAllocator::new(role.first_id(), cfg.max_stream_id, cfg.id_grace),
            }),
            limit: Arc::new(Semaphore::new(cfg.max_streams.max(1))),
            send_budget: Arc::new(Semaphore::new(cfg.send_buffer.max(MAX_DATA_CHUNK))),
            cfg,
            out: out_tx,
            cancel: CancellationToken::new(),
            reason: OnceLock::new(),
            started: Instant::now(),
            last_recv_ms: AtomicU64::new(0),
        });

        tokio::spawn(read_loop(shared.clone(), reader, in_tx));
        tokio::spawn(write_loop(shared.clone(), writer, out_rx));
        if !shared.cfg.keepalive_interval.is_zero() || !shared.cfg.idle_timeout.is_zero() {
            tokio::spawn(keepalive_loop(shared.clone()));
        }

        Self {
            shared,
            incoming: Arc::new(tokio::sync::Mutex::new(in_rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Opens a stream toward `target` and waits for the peer to accept it.
    ///
    /// Waits for capacity when `max_streams` streams are live.
    pub async fn open_stream(&self, target: &str) -> Result<Stream, TunnelError> {
        let sh = &self.shared;
        if sh.reason.get().is_some() {
            return Err(sh.closed_error());
        }
        let permit = sh
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| sh.closed_error())?;

        let (ack, stream) = {
            let mut t = sh.table();
            if sh.reason.get().is_some() {
                return Err(sh.closed_error());
            }
            let StreamTable { slots, ids } = &mut *t;
            let id = ids
                .allocate(Instant::now(), |id| slots.contains_key(&id))
                .ok_or(TunnelError::IdsExhausted)?;
            let core = StreamCore::new(id, sh.cfg.initial_window);
            let (tx, rx) = mpsc::unbounded_channel();
            let (ack_tx, ack_rx) = oneshot::channel();
            slots.insert(
                id,
                Slot {
                    core: core.clone(),
                    inbox: tx,
                    pending_open: Some(ack_tx),
                },
            );
            let stream = Stream::new(core, sh.clone(), rx, target.to_string(), false, permit);
            (ack_rx, stream)
        };

        sh.send(Frame::open(stream.id(), target))?;
        match tokio::time::timeout(sh.cfg.open_timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                metrics::counter!("sluice_streams_opened_total").increment(1);
                Ok(stream)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(sh.closed_error()),
            Err(_) => Err(TunnelError::Timeout("stream open")),
        }
    }

    /// Next stream opened by the peer; `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<Stream> {
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            s = rx.recv() => s,
        }
    }

    /// Closes the session and every stream in it, telling the peer why.
    pub fn close(&self, reason: impl Into<String>) {
        self.shared.shutdown(CloseReason::Local(reason.into()));
    }

    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.reason.get().cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.table().slots.len()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

async fn read_loop<R>(
    shared: Arc<SessionShared>,
    mut reader: FramedRead<R, FrameCodec>,
    incoming: mpsc::Sender<Stream>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = reader.next() => next,
        };
        let frame = match next {
            None => break CloseReason::Transport("connection closed by peer".into()),
            Some(Err(err)) if err.is_corrupt() => break CloseReason::Protocol(err.to_string()),
            Some(Err(err)) => break CloseReason::Transport(err.to_string()),
            Some(Ok(frame)) => frame,
        };
        shared.touch();
        if let Err(reason) = shared.dispatch(frame, &incoming) {
            break reason;
        }
    };
    shared.shutdown(reason);
}

async fn write_loop<W>(
    shared: Arc<SessionShared>,
    mut writer: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    // An in-flight write gets this long to finish after the session is cancelled.
    const LINGER: Duration = Duration::from_secs(1);

    let failure = loop {
        let first = tokio::select! {
            biased;
            f = rx.recv() => match f {
                Some(f) => f,
                None => break None,
            },
            _ = shared.cancel.cancelled() => break None,
        };

        // Budget permits drop with the batch, after the flush.
        let write = async {
            let mut held = Vec::new();
            let mut next = Some(first);
            while let Some(Outbound { frame, budget }) = next {
                writer.feed(frame).await?;
                held.extend(budget);
                next = rx.try_recv().ok();
            }
            writer.flush().await?;
            drop(held);
            Ok::<_, FrameError>(())
        };
        let lingering = async {
            shared.cancel.cancelled().await;
            tokio::time::sleep(LINGER).await;
        };
        tokio::select! {
            res = write => if let Err(err) = res {
                break Some(err);
            },
            _ = lingering => break None,
        }
    };

    if let Some(err) = failure {
        shared.shutdown(CloseReason::Transport(err.to_string()));
        return;
    }

    let _ = tokio::time::timeout(LINGER, async {
        while let Ok(out) = rx.try_recv() {
            writer.feed(out.frame).await?;
        }
        writer.flush().await?;
        writer.get_mut().shutdown().await?;
        Ok::<_, FrameError>(())
    })
    .await;
}

/// Sends on our own interval; judges the peer only by `idle_timeout`.
async fn keepalive_loop(shared: Arc<SessionShared>) {
    let every = shared.cfg.keepalive_interval;
    let deadline = shared.cfg.idle_timeout;
    let period = match (every.is_zero(), deadline.is_zero()) {
        (false, true) => every,
        (true, false) => deadline / KEEPALIVE_MISSES,
        _ => every.min(deadline / KEEPALIVE_MISSES),
    }
    .max(Duration::from_millis(5));
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_sent = Instant::now();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        if !deadline.is_zero() && shared.idle_for() > deadline {
            shared.shutdown(CloseReason::KeepaliveTimeout);
            return;
        }
        if !every.is_zero() && last_sent.elapsed() + Duration::from_millis(1) >= every {
            if shared.send(Frame::keepalive()).is_err() {
                return;
            }
            last_sent = Instant::now();
        }
    }
}
