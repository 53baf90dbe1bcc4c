//! IPC client: one persistent connection, serialized request/response.

use crate::ipc::IpcStream;
use crate::protocol::{MessageCodec, RpcRequest, RpcResponse};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Client-side guard against a daemon that accepts but never answers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected client. Concurrent `request` calls are serialized by an
/// internal mutex so frames never interleave; a failed send poisons the
/// connection and every later call fails fast.
#[derive(Debug)]
pub struct DaemonClient {
    stream: Mutex<IpcStream>,
    broken: AtomicBool,
    next_id: AtomicU64,
}

impl DaemonClient {
    /// Connect within `deadline`.
    pub async fn connect(socket_path: &str, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, IpcStream::connect(socket_path))
            .await
            .map_err(|_| anyhow!("timed out connecting to {socket_path}"))?
            .with_context(|| format!("connecting to {socket_path}"))?;
        debug!(socket = socket_path, "connected to daemon");
        Ok(Self {
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    /// One request/response exchange. The response's `id` must echo ours.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<RpcResponse> {
        if self.broken.load(Ordering::Acquire) {
            bail!("connection is closed after a previous failure");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let request = RpcRequest::new(id.clone(), method, params);
        let framed = MessageCodec::encode(&request)?;

        let mut stream = self.stream.lock().await;
        let exchange = async {
            MessageCodec::write_frame(&mut *stream, &framed).await?;
            let body = MessageCodec::read_frame(&mut *stream)
                .await?
                .ok_or_else(|| anyhow!("daemon closed the connection"))?;
            MessageCodec::decode_response(&body)
        };

        let response = match timeout(REQUEST_TIMEOUT, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.broken.store(true, Ordering::Release);
                return Err(e);
            }
            Err(_) => {
                self.broken.store(true, Ordering::Release);
                bail!("request {method:?} timed out after {REQUEST_TIMEOUT:?}");
            }
        };

        if response.id != id {
            self.broken.store(true, Ordering::Release);
            bail!(
                "response id {:?} does not match request id {:?}",
                response.id,
                id
            );
        }
        Ok(response)
    }

    pub async fn close(self) {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.stream.into_inner();
        let _ = stream.shutdown().await;
    }
}
