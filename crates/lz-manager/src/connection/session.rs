//! Peer sessions
//!
//! A [`Session`] is the broker's handle on one WebSocket connection to an
//! agent or a console. Outbound envelopes go through a bounded queue that a
//! dedicated writer task drains into the socket; inbound frames are read by
//! whoever owns the matching [`SessionReader`] (the router's receive loop).
//!
//! Closing is cooperative: [`Session::close`] cancels the session's token,
//! the writer sends a close frame and exits, and the reader returns `None`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use lz_core::error::ConnectionError;
use lz_core::{PeerAddr, PeerRole};
use lz_protocol::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth per session.
///
/// Envelopes are small and the broker sends at most a handful per inbound
/// message, so a full queue means the peer has stopped reading.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection.
///
/// Addresses are reused across reconnects; the id tells two sessions to the
/// same address apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One live connection to a peer
pub struct Session {
    id: SessionId,
    addr: PeerAddr,
    role: PeerRole,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    send_timeout: Duration,
}

impl Session {
    /// Create a session over an existing outbound queue.
    ///
    /// Whoever holds the receiving end of `outbound` is responsible for
    /// delivering the JSON text frames; [`Session::open`] wires it to a
    /// WebSocket writer task.
    pub fn new(
        addr: PeerAddr,
        role: PeerRole,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id: SessionId::next(),
            addr,
            role,
            outbound,
            cancel,
            send_timeout,
        }
    }

    /// Dial `ws://{addr}:{port}` and start the session's writer task
    pub async fn open(
        addr: PeerAddr,
        role: PeerRole,
        port: u16,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<(Arc<Session>, SessionReader), ConnectionError> {
        let url = addr.ws_url(port);
        tracing::trace!("Dialing {} at {}", role, url);

        let (stream, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| ConnectionError::ConnectTimeout(addr))?
                .map_err(|e| ConnectionError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                })?;

        let (sink, stream) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let session = Arc::new(Session::new(
            addr,
            role,
            outbound_tx,
            cancel.clone(),
            send_timeout,
        ));

        let writer_span = tracing::debug_span!("writer", %role, %addr, id = %session.id);
        tokio::spawn(run_writer(sink, outbound_rx, cancel.clone()).instrument(writer_span));

        let reader = session.reader(stream);
        Ok((session, reader))
    }

    /// Build the inbound half of this session over a stream of frames.
    ///
    /// The reader stops when the session closes, and closes the session
    /// when the stream ends.
    pub fn reader<S>(&self, frames: S) -> SessionReader
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Send + 'static,
    {
        SessionReader::new(frames, self.cancel.clone())
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address
    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    /// Peer population
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Whether envelopes can still be sent on this session
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Queue an envelope for delivery.
    ///
    /// Returns [`ConnectionError::Closed`] once the session is closed or its
    /// writer has exited, and [`ConnectionError::SendTimeout`] when the
    /// queue stays full for the configured send timeout. A timeout leaves
    /// the session open.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        let text = envelope.to_json()?;
        match self.outbound.send_timeout(text, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => {
                self.cancel.cancel();
                Err(ConnectionError::Closed)
            }
            Err(SendTimeoutError::Timeout(_)) => Err(ConnectionError::SendTimeout(self.addr)),
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Closing {} {} ({})", self.role, self.addr, self.id);
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            PeerRole::Agent => write!(f, "Agent({})", self.addr.device_id()),
            PeerRole::App => write!(f, "App({})", self.addr),
        }
    }
}

/// Drain the outbound queue into the socket until the session closes
async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => {
                let Some(text) = next else { break };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!("Write failed: {}", e);
                    break;
                }
            }
        }
    }

    cancel.cancel();
    outbound.close();
    let _ = sink.close().await;
}

/// Inbound half of a session
pub struct SessionReader {
    frames: BoxStream<'static, Result<Message, tungstenite::Error>>,
    cancel: CancellationToken,
}

impl SessionReader {
    /// Wrap a stream of WebSocket frames.
    ///
    /// `cancel` must be the token of the [`Session`] this reader belongs to.
    fn new<S>(frames: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Send + 'static,
    {
        Self {
            frames: frames.boxed(),
            cancel,
        }
    }

    /// Next text payload, or `None` once the connection is gone.
    ///
    /// Binary frames holding UTF-8 are treated as text. Control frames are
    /// skipped. Reaching the end of the stream closes the session. Frames
    /// still buffered when the session closes are never returned.
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                frame = self.frames.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(text),
                    Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    self.cancel.cancel();
                    return None;
                }
                Some(Err(e)) => {
                    tracing::debug!("Read failed: {}", e);
                    self.cancel.cancel();
                    return None;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::detached_session;
    use lz_protocol::command;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_delivers_json_text() {
        let (session, mut outbound) = detached_session(addr("10.0.0.5"), PeerRole::Agent);

        session
            .send(&Envelope::manager(command::REGISTER))
            .await
            .unwrap();

        let text = outbound.recv().await.unwrap();
        let envelope = Envelope::from_json(&text).unwrap();
        assert_eq!(envelope.command, "register");
    }

    #[tokio::test]
    async fn test_send_after_close_is_closed_error() {
        let (session, _outbound) = detached_session(addr("10.0.0.5"), PeerRole::Agent);
        session.close();

        assert!(!session.is_open());
        let err = session.send(&Envelope::manager(command::PING)).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_writer_exit_is_closed_error() {
        let (session, outbound) = detached_session(addr("10.0.0.5"), PeerRole::App);
        drop(outbound);

        assert!(!session.is_open());
        let err = session.send(&Envelope::manager(command::PING)).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_full_queue_times_out_without_closing() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(
            addr("10.0.0.5"),
            PeerRole::Agent,
            tx,
            CancellationToken::new(),
            Duration::from_millis(20),
        );

        session.send(&Envelope::manager(command::PING)).await.unwrap();
        let err = session.send(&Envelope::manager(command::PING)).await.unwrap_err();

        assert!(matches!(err, ConnectionError::SendTimeout(_)));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_reader_yields_text_and_closes_at_end() {
        let cancel = CancellationToken::new();
        let frames = futures::stream::iter(vec![
            Ok(Message::Text("one".into())),
            Ok(Message::Ping(Default::default())),
            Ok(Message::Binary(b"two".to_vec().into())),
        ]);
        let mut reader = SessionReader::new(frames, cancel.clone());

        assert_eq!(reader.next_text().await.as_deref(), Some("one"));
        assert_eq!(reader.next_text().await.as_deref(), Some("two"));
        assert_eq!(reader.next_text().await, None);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_reader_stops_when_session_closes() {
        let (session, _outbound) = detached_session(addr("10.0.0.5"), PeerRole::Agent);
        let mut reader = session.reader(futures::stream::pending());

        session.close();
        assert_eq!(reader.next_text().await, None);
    }

    #[tokio::test]
    async fn test_reader_drops_buffered_frames_after_close() {
        let (session, _outbound) = detached_session(addr("10.0.0.5"), PeerRole::Agent);
        let frames = futures::stream::iter(vec![Ok(Message::Text("late".into()))]);
        let mut reader = session.reader(frames);

        session.close();
        assert_eq!(reader.next_text().await, None);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (tx, _rx) = mpsc::channel(1);
        let a = Session::new(
            addr("10.0.0.5"),
            PeerRole::Agent,
            tx.clone(),
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        let b = Session::new(
            addr("10.0.0.5"),
            PeerRole::Agent,
            tx,
            CancellationToken::new(),
            Duration::from_secs(1),
        );
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_string(), "Agent(5)");
    }
}
