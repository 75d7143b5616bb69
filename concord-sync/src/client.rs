//! WebSocket client for a [`SyncServer`](crate::server::SyncServer).
//!
//! Provides:
//! - Connection lifecycle (connect, join, close)
//! - Request/reply correlation over one socket
//! - Tracking of the newest document clock the client has seen, used as the
//!   observed clock for submissions
//! - Live events, delivered on a channel
//!
//! Reconnecting is connect + `subscribe(last_sequence + 1)`: the server
//! replays what was missed and continues with live commits.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use concord_core::{AuthorId, DocumentId, OpPayload, VectorClock};

use crate::broadcast::Event;
use crate::engine::{HeartbeatAck, SubmitResult};
use crate::error::ProtocolError;
use crate::protocol::{ClientFrame, ClientMessage, ServerFrame, ServerMessage};
use crate::storage::OperationRecord;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ServerMessage>>>>;

/// The sync client.
pub struct SyncClient {
    document: DocumentId,
    author: AuthorId,
    state: Arc<RwLock<ConnectionState>>,
    /// Newest document clock seen through replies and events.
    clock: Arc<RwLock<VectorClock>>,
    /// Highest committed sequence seen.
    sequence: Arc<AtomicU64>,
    next_request: AtomicU64,
    pending: Pending,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    event_rx: Option<mpsc::Receiver<Event>>,
    /// Held from reading the clock until the commit reply has been
    /// observed, so two submits never share an observed clock.
    submit_lock: Mutex<()>,
    timeout: Duration,
}

impl SyncClient {
    /// Connect to `url` and join `document` as `author`.
    pub async fn connect(
        url: &str,
        document: DocumentId,
        author: impl Into<AuthorId>,
    ) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (outgoing_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let clock = Arc::new(RwLock::new(VectorClock::new()));
        let sequence = Arc::new(AtomicU64::new(0));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(256);

        // Reader task: route replies to their request, events to the channel
        {
            let state = state.clone();
            let clock = clock.clone();
            let sequence = sequence.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let bytes: Vec<u8> = match msg {
                        Ok(Message::Binary(data)) => data.into(),
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let frame = match ServerFrame::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Dropping undecodable server frame: {e}");
                            continue;
                        }
                    };
                    observe(&frame.message, &clock, &sequence).await;
                    match (frame.request, frame.message) {
                        (None, ServerMessage::Event(event)) => {
                            let _ = event_tx.send(event).await;
                        }
                        (None, ServerMessage::Error { message, .. }) => {
                            log::warn!("Server error: {message}");
                        }
                        (None, other) => log::debug!("Ignoring unsolicited {other:?}"),
                        (Some(request), message) => {
                            let mut pending = pending.lock().await;
                            let done = message.is_final();
                            if let Some(tx) = pending.get(&request) {
                                let _ = tx.send(message);
                            }
                            if done {
                                pending.remove(&request);
                            }
                        }
                    }
                }
                *state.write().await = ConnectionState::Disconnected;
                // Fail every outstanding request.
                pending.lock().await.clear();
            });
        }

        let author = author.into();
        let client = Self {
            document,
            author: author.clone(),
            state,
            clock,
            sequence,
            next_request: AtomicU64::new(1),
            pending,
            outgoing_tx,
            event_rx: Some(event_rx),
            submit_lock: Mutex::new(()),
            timeout: Duration::from_secs(10),
        };
        match client.request_one(ClientMessage::Join { document, author }).await? {
            ServerMessage::Joined { .. } => Ok(client),
            other => Err(unexpected(other)),
        }
    }

    /// Reply timeout for every request (default 10s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the live event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.event_rx.take()
    }

    async fn request(
        &self,
        message: ClientMessage,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, ProtocolError> {
        if *self.state.read().await == ConnectionState::Disconnected {
            return Err(ProtocolError::Closed);
        }
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(request, tx);
        let bytes = ClientFrame { request, message }.encode()?;
        if self.outgoing_tx.send(bytes).await.is_err() {
            self.pending.lock().await.remove(&request);
            return Err(ProtocolError::Closed);
        }
        Ok(rx)
    }

    async fn next_reply(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Result<ServerMessage, ProtocolError> {
        let reply = tokio::time::timeout(self.timeout, rx.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .ok_or(ProtocolError::Closed)?;
        match reply {
            ServerMessage::Error {
                code,
                message,
                reset_secs,
            } => Err(ProtocolError::Rejected {
                code,
                message,
                reset_secs,
            }),
            other => Ok(other),
        }
    }

    async fn request_one(&self, message: ClientMessage) -> Result<ServerMessage, ProtocolError> {
        let mut rx = self.request(message).await?;
        self.next_reply(&mut rx).await
    }

    /// Submit `payload` against the newest clock this client has seen.
    /// Concurrent calls on one client are committed one after another.
    pub async fn submit(&self, payload: OpPayload) -> Result<SubmitResult, ProtocolError> {
        let _turn = self.submit_lock.lock().await;
        let observed = self.clock().await;
        self.submit_with(observed, payload).await
    }

    /// Submit `payload` with an explicit observed clock.
    pub async fn submit_with(
        &self,
        observed: VectorClock,
        payload: OpPayload,
    ) -> Result<SubmitResult, ProtocolError> {
        match self.request_one(ClientMessage::Submit { observed, payload }).await? {
            ServerMessage::Committed(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&self, payload: Vec<u8>) -> Result<HeartbeatAck, ProtocolError> {
        match self.request_one(ClientMessage::Heartbeat { payload }).await? {
            ServerMessage::PresenceAck(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        match self.request_one(ClientMessage::Leave).await? {
            ServerMessage::Left => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Every committed operation from `from` to the head.
    pub async fn replay(&self, from: u64) -> Result<Vec<OperationRecord>, ProtocolError> {
        let mut rx = self.request(ClientMessage::Replay { from }).await?;
        let mut ops = Vec::new();
        loop {
            match self.next_reply(&mut rx).await? {
                ServerMessage::ReplayBatch(batch) => ops.extend(batch),
                ServerMessage::ReplayDone { .. } => return Ok(ops),
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Start receiving live events, catching up from `from` first.
    pub async fn subscribe(&self, from: u64) -> Result<(), ProtocolError> {
        match self.request_one(ClientMessage::Subscribe { from }).await? {
            ServerMessage::Subscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        match self.request_one(ClientMessage::Ping).await? {
            ServerMessage::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn author(&self) -> &AuthorId {
        &self.author
    }

    /// Newest document clock seen.
    pub async fn clock(&self) -> VectorClock {
        self.clock.read().await.clone()
    }

    /// Highest committed sequence seen.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

/// Fold a server message into the client's view of the document.
async fn observe(message: &ServerMessage, clock: &RwLock<VectorClock>, sequence: &AtomicU64) {
    match message {
        ServerMessage::Joined { sequence: seq, clock: head } => {
            clock.write().await.merge_from(head);
            sequence.fetch_max(*seq, Ordering::Relaxed);
        }
        ServerMessage::Committed(result) => {
            clock.write().await.merge_from(&result.clock);
            sequence.fetch_max(result.sequence, Ordering::Relaxed);
        }
        ServerMessage::Event(Event::Operation(op)) => {
            clock.write().await.merge_from(&op.stamped());
            sequence.fetch_max(op.sequence, Ordering::Relaxed);
        }
        ServerMessage::ReplayBatch(ops) => {
            let mut clock = clock.write().await;
            for op in ops {
                clock.merge_from(&op.stamped());
                sequence.fetch_max(op.sequence, Ordering::Relaxed);
            }
        }
        _ => {}
    }
}

fn unexpected(message: ServerMessage) -> ProtocolError {
    ProtocolError::Unexpected(format!("{message:?}"))
}
