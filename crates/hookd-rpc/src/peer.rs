//! Duplex RPC peer: one writer task, one reader task, and a pending-call map
//! routing responses back to their callers. Requests from the other side are
//! surfaced as [`IncomingRequest`] values on a channel owned by the caller of
//! [`RpcPeer::spawn`], who must keep draining it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
};
use tracing::{debug, warn};

use crate::{encode_frame, frame::frame_kind, parse_frame, Frame, RpcError, RpcResult};

const RPC_WRITER_QUEUE_CAPACITY: usize = 64;
const RPC_INCOMING_QUEUE_CAPACITY: usize = 64;

type PendingSender = oneshot::Sender<RpcResult<Value>>;

#[derive(Default)]
struct PendingCalls {
    closed: bool,
    calls: HashMap<u64, PendingSender>,
}

struct PeerShared {
    label: String,
    pending: Mutex<PendingCalls>,
    closed_tx: watch::Sender<bool>,
}

impl PeerShared {
    fn close(&self) {
        let drained: Vec<PendingSender> = {
            let mut pending = lock_unpoisoned(&self.pending);
            pending.closed = true;
            pending.calls.drain().map(|(_, sender)| sender).collect()
        };
        if !drained.is_empty() {
            debug!(
                peer = %self.label,
                pending = drained.len(),
                "failing pending rpc calls after channel close"
            );
        }
        for sender in drained {
            let _ = sender.send(Err(RpcError::Closed));
        }
        self.closed_tx.send_replace(true);
    }
}

/// A request received from the other side, answered exactly once.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
    responder: mpsc::Sender<Frame>,
}

impl IncomingRequest {
    /// Sends the outcome back; a closed writer drops the reply.
    pub async fn respond(self, outcome: Result<Value, String>) {
        let frame = Frame::response(self.id, outcome);
        if self.responder.send(frame).await.is_err() {
            debug!(
                id = self.id,
                method = %self.method,
                "rpc response dropped: writer closed"
            );
        }
    }
}

/// One end of the bridge.
pub struct RpcPeer {
    shared: Arc<PeerShared>,
    writer_tx: mpsc::Sender<Frame>,
    writer_shutdown: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    next_id: AtomicU64,
}

impl RpcPeer {
    /// Starts the reader and writer tasks on the current tokio runtime.
    pub fn spawn<R, W>(
        label: impl Into<String>,
        reader: R,
        writer: W,
    ) -> (Self, mpsc::Receiver<IncomingRequest>)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(RPC_WRITER_QUEUE_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(RPC_INCOMING_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (writer_shutdown, writer_shutdown_rx) = watch::channel(false);
        let shared = Arc::new(PeerShared {
            label: label.into(),
            pending: Mutex::new(PendingCalls::default()),
            closed_tx,
        });

        tokio::spawn(writer_loop(
            shared.clone(),
            writer,
            writer_rx,
            writer_shutdown_rx,
        ));
        tokio::spawn(reader_loop(
            shared.clone(),
            reader,
            incoming_tx,
            writer_tx.clone(),
        ));

        let peer = Self {
            shared,
            writer_tx,
            writer_shutdown,
            closed_rx,
            next_id: AtomicU64::new(1),
        };
        (peer, incoming_rx)
    }

    pub fn label(&self) -> &str {
        self.shared.label.as_str()
    }

    /// Sends a request and waits for the matching response.
    ///
    /// There is no deadline here: the call resolves when the other side
    /// answers or when the channel closes.
    pub async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = lock_unpoisoned(&self.shared.pending);
            if pending.closed {
                return Err(RpcError::Closed);
            }
            pending.calls.insert(id, sender);
        }

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.writer_tx.send(frame).await.is_err() {
            lock_unpoisoned(&self.shared.pending).calls.remove(&id);
            return Err(RpcError::Closed);
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Returns true once the inbound stream has ended or the writer failed.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Returns a watch that flips to `true` when the channel closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Resolves once the channel has closed.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Stops writing and drops the outbound stream so the other side sees
    /// end-of-input. Inbound frames keep flowing until the other side exits.
    pub fn close_writer(&self) {
        self.writer_shutdown.send_replace(true);
    }
}

async fn writer_loop<W>(
    shared: Arc<PeerShared>,
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(error) = write_frame(&mut writer, &frame).await {
                    warn!(
                        peer = %shared.label,
                        kind = frame_kind(&frame),
                        error = %error,
                        "rpc write failed"
                    );
                    shared.close();
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_frame(frame)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn reader_loop<R>(
    shared: Arc<PeerShared>,
    reader: R,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    responder: mpsc::Sender<Frame>,
) where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(peer = %shared.label, error = %error, "rpc read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_frame(&line) {
            Ok(Frame::Response { id, result, error }) => {
                let sender = lock_unpoisoned(&shared.pending).calls.remove(&id);
                let Some(sender) = sender else {
                    debug!(peer = %shared.label, id, "rpc response without pending call");
                    continue;
                };
                let outcome = match error {
                    Some(message) => Err(RpcError::Remote(message)),
                    None => Ok(result),
                };
                let _ = sender.send(outcome);
            }
            Ok(Frame::Request { id, method, params }) => {
                let request = IncomingRequest {
                    id,
                    method,
                    params,
                    responder: responder.clone(),
                };
                if let Err(mpsc::error::SendError(request)) = incoming_tx.send(request).await {
                    let message = format!("no handler registered for method '{}'", request.method);
                    request.respond(Err(message)).await;
                }
            }
            Ok(Frame::Hello { .. }) => {
                debug!(peer = %shared.label, "ignoring repeated hello frame");
            }
            Err(error) => {
                warn!(peer = %shared.label, error = %error, "discarding malformed rpc line");
            }
        }
    }
    shared.close();
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
