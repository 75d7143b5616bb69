//! WebSocket front end for a [`SyncEngine`].
//!
//! ```text
//! Client A ──┐                     ┌── OperationLog ── LogStore
//!             ├── Session ── SyncEngine ┤
//! Client B ──┘   (doc, author)     └── Broadcaster ─┬─► document:<id>:operations
//!                                                    └─► document:<id>:presence
//! ```
//!
//! Each connection runs one task. It answers request frames in order and,
//! once subscribed, interleaves live events. When an author's last socket on
//! a document closes, their presence session there is ended.

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use concord_core::{AuthorId, DocumentId};

use crate::broadcast::{Event, Subscription};
use crate::engine::SyncEngine;
use crate::error::{ProtocolError, SyncError};
use crate::protocol::{ClientFrame, ClientMessage, ServerFrame, ServerMessage};
use crate::storage::OperationRecord;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that could not be decoded or were too large.
    pub rejected_frames: u64,
}

type OperationStream = Pin<Box<dyn Stream<Item = Result<OperationRecord, SyncError>> + Send>>;

/// Live connections per joined `(document, author)`.
type Connections = Arc<Mutex<HashMap<(DocumentId, AuthorId), usize>>>;

/// Per-connection state.
struct Session {
    binding: Option<(DocumentId, AuthorId)>,
    operations: Option<OperationStream>,
    presence: Option<Subscription>,
    connections: Connections,
}

impl Session {
    fn new(connections: Connections) -> Self {
        Self {
            binding: None,
            operations: None,
            presence: None,
            connections,
        }
    }

    /// Answer one request. Replies are written to `sink` as they are
    /// produced.
    async fn handle<S>(
        &mut self,
        engine: &SyncEngine,
        frame: ClientFrame,
        sink: &mut S,
    ) -> Result<(), ProtocolError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let request = frame.request;
        let reply = match frame.message {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Join { document, author } => self.join(engine, document, author).await,
            message => match self.binding.clone() {
                Some((document, author)) => {
                    return self
                        .handle_bound(engine, request, document, author, message, sink)
                        .await;
                }
                None => ServerMessage::bad_request("join a document first"),
            },
        };
        send_frame(sink, &ServerFrame::reply(request, reply)).await
    }

    async fn join(
        &mut self,
        engine: &SyncEngine,
        document: DocumentId,
        author: AuthorId,
    ) -> ServerMessage {
        if let Some((joined, _)) = &self.binding {
            return ServerMessage::bad_request(format!("connection already joined {joined}"));
        }
        if let Err(e) = engine.log().engine().namespace().validate(&author) {
            return ServerMessage::error(&SyncError::Validation(e));
        }
        match engine.document(document) {
            Ok(head) => {
                log::info!("{author} joined {document} at #{}", head.sequence);
                *self
                    .connections
                    .lock()
                    .await
                    .entry((document, author.clone()))
                    .or_default() += 1;
                self.binding = Some((document, author));
                ServerMessage::Joined {
                    sequence: head.sequence,
                    clock: head.clock,
                }
            }
            Err(e) => ServerMessage::error(&e),
        }
    }

    /// Unbind the connection. Returns the binding if this was the author's
    /// last connection to the document.
    async fn release(&mut self) -> Option<(DocumentId, AuthorId)> {
        let binding = self.binding.take()?;
        let mut connections = self.connections.lock().await;
        match connections.get_mut(&binding) {
            Some(count) if *count > 1 => {
                *count -= 1;
                None
            }
            _ => {
                connections.remove(&binding);
                Some(binding)
            }
        }
    }

    async fn handle_bound<S>(
        &mut self,
        engine: &SyncEngine,
        request: u64,
        document: DocumentId,
        author: AuthorId,
        message: ClientMessage,
        sink: &mut S,
    ) -> Result<(), ProtocolError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let reply = match message {
            ClientMessage::Submit { observed, payload } => {
                match engine.submit_operation(document, author, observed, payload).await {
                    Ok(result) => ServerMessage::Committed(result),
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientMessage::Heartbeat { payload } => {
                match engine.heartbeat(document, author, payload).await {
                    Ok(ack) => ServerMessage::PresenceAck(ack),
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientMessage::Leave => {
                engine.leave(document, &author).await;
                ServerMessage::Left
            }
            ClientMessage::Replay { from } => {
                return Self::replay(engine, request, document, from, sink).await;
            }
            ClientMessage::Subscribe { from } => match engine.resume(document, from).await {
                Ok(stream) => {
                    self.operations = Some(Box::pin(stream));
                    self.presence = Some(engine.subscribe_presence(document).await);
                    ServerMessage::Subscribed
                }
                Err(e) => ServerMessage::error(&e),
            },
            ClientMessage::Join { .. } | ClientMessage::Ping => {
                ServerMessage::bad_request("unexpected message")
            }
        };
        send_frame(sink, &ServerFrame::reply(request, reply)).await
    }

    /// Stream the log from `from` in batches of `replay_page_size`, then
    /// `ReplayDone`. Each batch is sent before the next page is read.
    async fn replay<S>(
        engine: &SyncEngine,
        request: u64,
        document: DocumentId,
        from: u64,
        sink: &mut S,
    ) -> Result<(), ProtocolError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let mut stream = match engine.replay(document, from) {
            Ok(stream) => Box::pin(stream),
            Err(e) => {
                return send_frame(sink, &ServerFrame::reply(request, ServerMessage::error(&e)))
                    .await;
            }
        };
        let batch_size = engine.config().commit.replay_page_size.max(1);
        let mut batch = Vec::new();
        let mut through = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(op) => {
                    through = op.sequence;
                    batch.push(op);
                    if batch.len() >= batch_size {
                        let full = std::mem::take(&mut batch);
                        send_frame(sink, &ServerFrame::reply(request, ServerMessage::ReplayBatch(full)))
                            .await?;
                    }
                }
                Err(e) => {
                    return send_frame(sink, &ServerFrame::reply(request, ServerMessage::error(&e)))
                        .await;
                }
            }
        }
        if !batch.is_empty() {
            send_frame(sink, &ServerFrame::reply(request, ServerMessage::ReplayBatch(batch))).await?;
        }
        send_frame(sink, &ServerFrame::reply(request, ServerMessage::ReplayDone { through })).await
    }
}

async fn next_operation(
    operations: &mut Option<OperationStream>,
) -> Option<Result<OperationRecord, SyncError>> {
    match operations {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_presence(presence: &mut Option<Subscription>) -> Option<Arc<Event>> {
    match presence {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ProtocolError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| ProtocolError::Connection(e.to_string()))
}

/// The sync server.
pub struct SyncServer {
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
    connections: Connections,
}

impl SyncServer {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn bind_addr(&self) -> &str {
        &self.engine.config().server.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let listener = TcpListener::bind(self.bind_addr())
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProtocolError> {
        let local = listener
            .local_addr()
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        log::info!("Sync server listening on {local}");

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| ProtocolError::Connection(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let session = Session::new(self.connections.clone());
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, session).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<RwLock<ServerStats>>,
        mut session: Session,
    ) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let max_bytes = engine.config().server.max_message_bytes;
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            if bytes.len() > max_bytes {
                                stats.write().await.rejected_frames += 1;
                                let err = ProtocolError::TooLarge { size: bytes.len(), limit: max_bytes };
                                log::warn!("Rejected frame from {addr}: {err}");
                                let frame = ServerFrame { request: None, message: ServerMessage::bad_request(err.to_string()) };
                                if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                                    break Err(e);
                                }
                                continue;
                            }
                            let sent = match ClientFrame::decode(&bytes) {
                                Ok(frame) => session.handle(&engine, frame, &mut ws_sender).await,
                                Err(e) => {
                                    stats.write().await.rejected_frames += 1;
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    let frame = ServerFrame { request: None, message: ServerMessage::bad_request(e.to_string()) };
                                    send_frame(&mut ws_sender, &frame).await
                                }
                            };
                            if let Err(e) = sent {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(ProtocolError::Connection(e.to_string()));
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                item = next_operation(&mut session.operations) => {
                    let frame = match item {
                        Some(Ok(op)) => ServerFrame::event(Event::Operation(op)),
                        Some(Err(e)) => {
                            session.operations = None;
                            ServerFrame { request: None, message: ServerMessage::error(&e) }
                        }
                        None => {
                            // The live side lagged; the client resubscribes from
                            // its last sequence.
                            session.operations = None;
                            let e = SyncError::Transient("operation stream interrupted; resubscribe".into());
                            ServerFrame { request: None, message: ServerMessage::error(&e) }
                        }
                    };
                    if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                        break Err(e);
                    }
                }

                event = next_presence(&mut session.presence) => {
                    match event {
                        Some(event) => {
                            let frame = ServerFrame::event(event.as_ref().clone());
                            if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                                break Err(e);
                            }
                        }
                        None => session.presence = None,
                    }
                }
            }
        };

        if let Some((document, author)) = session.release().await {
            if engine.leave(document, &author).await.is_some() {
                log::info!("{author} left {document} on disconnect");
            }
        }
        stats.write().await.active_connections -= 1;
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}
