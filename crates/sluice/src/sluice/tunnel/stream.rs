use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{OwnedSemaphorePermit, mpsc},
};
use tokio_util::sync::PollSemaphore;

use crate::sluice::tunnel::{error::TunnelError, frame::Frame, session::SessionShared};

/// Largest DATA payload a stream writes in one frame.
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Upper bound for accumulated send credit; more is a peer bug.
pub const MAX_WINDOW: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClose {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    HalfClosed(HalfClose),
    Closed,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Fin,
    Reset(TunnelError),
}

#[derive(Debug)]
struct Flags {
    opening: bool,
    local_fin: bool,
    remote_fin: bool,
    closed: bool,
    send_credit: u32,
    recv_window: u32,
    write_waker: Option<Waker>,
    write_err: Option<TunnelError>,
}

impl Flags {
    fn state(&self) -> StreamState {
        if self.closed || (self.local_fin && self.remote_fin) {
            StreamState::Closed
        } else if self.opening {
            StreamState::Opening
        } else if self.local_fin {
            StreamState::HalfClosed(HalfClose::Local)
        } else if self.remote_fin {
            StreamState::HalfClosed(HalfClose::Remote)
        } else {
            StreamState::Open
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// Per-stream state shared between the session read loop and the [`Stream`] handle.
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub(crate) id: u32,
    flags: Mutex<Flags>,
}

pub(crate) enum CloseAction {
    Nothing,
    Fin,
    Reset,
}

impl StreamCore {
    pub(crate) fn new(id: u32, window: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            flags: Mutex::new(Flags {
                opening: true,
                local_fin: false,
                remote_fin: false,
                closed: false,
                send_credit: window,
                recv_window: window,
                write_waker: None,
                write_err: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state()
    }

    pub(crate) fn on_open_ack(&self) {
        self.lock().opening = false;
    }

    /// Accounts inbound DATA against the advertised receive window.
    pub(crate) fn on_data(&self, len: usize) -> Result<(), TunnelError> {
        let mut f = self.lock();
        if f.opening {
            return Err(TunnelError::Protocol(format!(
                "data on stream {} before open completed",
                self.id
            )));
        }
        if f.remote_fin {
            return Err(TunnelError::Protocol(format!(
                "data on stream {} after close",
                self.id
            )));
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > f.recv_window {
            return Err(TunnelError::Protocol(format!(
                "stream {} exceeded receive window ({} > {})",
                self.id, len, f.recv_window
            )));
        }
        f.recv_window -= len;
        Ok(())
    }

    pub(crate) fn on_window_update(&self, increment: u32) -> Result<(), TunnelError> {
        let mut f = self.lock();
        let credit = f.send_credit.checked_add(increment).filter(|c| *c <= MAX_WINDOW);
        let Some(credit) = credit else {
            return Err(TunnelError::Protocol(format!(
                "stream {} window overflow",
                self.id
            )));
        };
        f.send_credit = credit;
        f.wake_writer();
        Ok(())
    }

    /// Returns true when this completed the close in both directions.
    pub(crate) fn on_remote_fin(&self) -> bool {
        let mut f = self.lock();
        if f.remote_fin || f.closed {
            return false;
        }
        f.remote_fin = true;
        if f.local_fin {
            f.closed = true;
            return true;
        }
        false
    }

    pub(crate) fn on_reset(&self, err: TunnelError) {
        let mut f = self.lock();
        f.closed = true;
        f.opening = false;
        if f.write_err.is_none() {
            f.write_err = Some(err);
        }
        f.wake_writer();
    }

    fn write_error(f: &Flags) -> TunnelError {
        f.write_err.clone().unwrap_or(TunnelError::StreamClosed)
    }

    fn reserve_send(&self, want: usize, cx: &mut Context<'_>) -> Poll<Result<usize, TunnelError>> {
        let mut f = self.lock();
        if f.closed || f.local_fin {
            return Poll::Ready(Err(Self::write_error(&f)));
        }
        if f.opening {
            return Poll::Ready(Err(TunnelError::StreamClosed));
        }
        if f.send_credit == 0 {
            f.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = want.min(f.send_credit as usize).min(MAX_DATA_CHUNK);
        f.send_credit -= n as u32;
        Poll::Ready(Ok(n))
    }

    fn grant(&self, n: u32) -> bool {
        let mut f = self.lock();
        if f.closed || f.remote_fin {
            return false;
        }
        f.recv_window = f.recv_window.saturating_add(n);
        true
    }

    /// Marks the write side finished. `Ok(None)` if it already was.
    fn local_fin(&self) -> Result<Option<bool>, TunnelError> {
        let mut f = self.lock();
        if f.closed {
            if f.local_fin {
                return Ok(None);
            }
            return Err(Self::write_error(&f));
        }
        if f.opening {
            return Err(TunnelError::StreamClosed);
        }
        if f.local_fin {
            return Ok(None);
        }
        f.local_fin = true;
        if f.remote_fin {
            f.closed = true;
        }
        f.wake_writer();
        Ok(Some(f.closed))
    }

    /// Returns true if this call moved the stream out of `Opening`.
    fn accept(&self) -> Result<bool, TunnelError> {
        let mut f = self.lock();
        if f.closed {
            return Err(Self::write_error(&f));
        }
        let was_opening = std::mem::replace(&mut f.opening, false);
        Ok(was_opening)
    }

    fn begin_close(&self) -> CloseAction {
        let mut f = self.lock();
        if f.closed {
            return CloseAction::Nothing;
        }
        let action = if f.remote_fin && !f.opening {
            if f.local_fin {
                CloseAction::Nothing
            } else {
                CloseAction::Fin
            }
        } else {
            CloseAction::Reset
        };
        f.closed = true;
        f.local_fin = true;
        f.wake_writer();
        action
    }
}

/// One multiplexed byte pipe inside a [`Session`](super::session::Session).
///
/// Reads drain buffered DATA and then report EOF once the peer half-closed.
/// `shutdown` (or [`Stream::close_write`]) half-closes the write side;
/// [`Stream::close`] or dropping the handle closes both directions.
pub struct Stream {
    core: Arc<StreamCore>,
    session: Arc<SessionShared>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    target: String,
    inbound: bool,
    read_buf: Bytes,
    read_done: bool,
    unacked: u32,
    /// Send credit taken from the peer window but not yet written.
    reserved: usize,
    budget: PollSemaphore,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        core: Arc<StreamCore>,
        session: Arc<SessionShared>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        target: String,
        inbound: bool,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            core,
            inbox,
            target,
            inbound,
            read_buf: Bytes::new(),
            read_done: false,
            unacked: 0,
            reserved: 0,
            budget: PollSemaphore::new(session.send_budget.clone()),
            session,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// The `host:port` this stream was opened for.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Confirms an inbound stream to the opener (`Opening -> Open`).
    pub fn accept(&mut self) -> Result<(), TunnelError> {
        if !self.inbound || !self.core.accept()? {
            return Ok(());
        }
        self.session.send(Frame::open_ack(self.core.id))?;
        metrics::counter!("sluice_streams_opened_total").increment(1);
        Ok(())
    }

    /// Refuses an inbound stream; the opener sees `StreamRefused`.
    pub fn reject(mut self) {
        self.close();
    }

    /// Half-closes the write side. Idempotent.
    pub fn close_write(&mut self) -> Result<(), TunnelError> {
        let Some(fully_closed) = self.core.local_fin()? else {
            return Ok(());
        };
        self.session.send(Frame::close(self.core.id))?;
        if fully_closed {
            self.session.finish(&self.core);
        }
        Ok(())
    }

    /// Closes both directions. A stream whose peer has not finished sending is reset.
    pub fn close(&mut self) {
        match self.core.begin_close() {
            CloseAction::Nothing => {}
            CloseAction::Fin => {
                let _ = self.session.send(Frame::close(self.core.id));
            }
            CloseAction::Reset => {
                let _ = self.session.send(Frame::reset(self.core.id));
            }
        }
        self.read_done = true;
        self.read_buf = Bytes::new();
        self.session.finish(&self.core);
    }

    fn consumed(&mut self, n: usize) {
        self.unacked = self.unacked.saturating_add(n as u32);
        let threshold = (self.session.cfg.initial_window / 2).max(1);
        if self.unacked < threshold {
            return;
        }
        let credit = std::mem::take(&mut self.unacked);
        if self.core.grant(credit) {
            let _ = self
                .session
                .send(Frame::window_update(self.core.id, credit));
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                this.consumed(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }

            match this.inbox.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Inbound::Data(b))) => this.read_buf = b,
                Poll::Ready(Some(Inbound::Fin)) | Poll::Ready(None) => this.read_done = true,
                Poll::Ready(Some(Inbound::Reset(err))) => {
                    this.read_done = true;
                    let err = match err {
                        TunnelError::StreamClosed => std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "stream reset by peer",
                        ),
                        other => other.into(),
                    };
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        // Peer credit first, so a stalled stream never sits on session budget.
        if this.reserved == 0 {
            match this.core.reserve_send(data.len(), cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
                Poll::Ready(Ok(n)) => this.reserved = n,
            }
        }
        let n = this.reserved.min(data.len());
        let budget = match this.budget.poll_acquire_many(cx, n as u32) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => return Poll::Ready(Err(this.session.closed_error().into())),
            Poll::Ready(Some(permit)) => permit,
        };
        this.reserved -= n;
        let frame = Frame::data(this.core.id, Bytes::copy_from_slice(&data[..n]));
        match this.session.send_data(frame, budget) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(self.close_write().map_err(Into::into))
    }
}
