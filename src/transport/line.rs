use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::transport::codec::{Frame, JsonLineCodec};
use crate::transport::traits::Transport;
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = DashMap<RequestId, oneshot::Sender<HubResult<JsonRpcResponse>>>;

/// JSON-RPC over a pair of byte streams, one JSON document per line.
///
/// Any number of requests may be in flight; responses are matched back
/// to their callers by id, in whatever order the peer produces them.
pub struct LineTransport {
    name: String,
    writer: Mutex<FramedWrite<BoxedWriter, JsonLineCodec>>,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
    next_id: AtomicI64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl LineTransport {
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            name.clone(),
            FramedRead::new(reader, JsonLineCodec::new()),
            pending.clone(),
            connected.clone(),
        ));

        Self {
            name,
            writer: Mutex::new(FramedWrite::new(
                Box::new(writer) as BoxedWriter,
                JsonLineCodec::new(),
            )),
            pending,
            connected,
            next_id: AtomicI64::new(1),
            request_timeout,
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn lost(&self) -> HubError {
        HubError::ConnectionLost(self.name.clone())
    }

    async fn write(&self, request: JsonRpcRequest) -> HubResult<()> {
        let mut writer = self.writer.lock().await;
        writer.send(request).await.map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => self.lost(),
            _ => HubError::Io(e),
        })
    }
}

async fn read_loop<R>(
    name: String,
    mut frames: FramedRead<R, JsonLineCodec>,
    pending: Arc<PendingMap>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Message(value)) => route(&name, value, &pending),
            Ok(Frame::Malformed(line)) => {
                debug!(connection = %name, "Discarding non-JSON line: {}", line);
            }
            Err(e) => {
                warn!(connection = %name, "Read error: {}", e);
                break;
            }
        }
    }

    info!(connection = %name, "Stream closed");
    connected.store(false, Ordering::SeqCst);
    fail_pending(&name, &pending);
}

fn route(name: &str, value: Value, pending: &PendingMap) {
    if value.get("method").is_some() {
        debug!(connection = %name, "Ignoring message from peer: {}", value);
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(e) => {
            debug!(connection = %name, "Discarding unexpected document: {}", e);
            return;
        }
    };

    let Some(id) = response.id.clone() else {
        debug!(connection = %name, "Received response without id, ignoring");
        return;
    };

    match pending.remove(&id) {
        Some((_, tx)) => {
            let _ = tx.send(Ok(response));
        }
        None => debug!(connection = %name, "Received response with unknown id: {}", id),
    }
}

fn fail_pending(name: &str, pending: &PendingMap) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(HubError::ConnectionLost(name.to_string())));
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send_request(&self, mut request: JsonRpcRequest) -> HubResult<JsonRpcResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(self.lost());
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        request.id = Some(id.clone());

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // The reader may have drained the map between the check above and the insert.
        if !self.connected.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(self.lost());
        }

        debug!(connection = %self.name, id = %id, method = %request.method, "Sending request");
        if let Err(e) = self.write(request).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.lost()),
            Err(_) => match self.pending.remove(&id) {
                Some(_) => Err(HubError::Timeout(self.request_timeout.as_millis() as u64)),
                // Resolved at the deadline; the reader already took the entry.
                None => rx
                    .try_recv()
                    .unwrap_or_else(|_| Err(HubError::Timeout(self.request_timeout.as_millis() as u64))),
            },
        }
    }

    async fn send_notification(&self, mut request: JsonRpcRequest) -> HubResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(self.lost());
        }
        request.id = None;
        debug!(connection = %self.name, method = %request.method, "Sending notification");
        self.write(request).await
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> HubResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        fail_pending(&self.name, &self.pending);
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!(connection = %self.name, "Closing writer failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
