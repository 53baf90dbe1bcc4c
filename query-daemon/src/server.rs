//! IPC server: accept loop, per-connection handlers, activity accounting.
//!
//! Each connection is served by one task reading frames in order, so
//! responses on a connection come back in request order. Handlers register
//! with a task tracker on spawn and deregister on exit; shutdown closes the
//! tracker and waits a bounded time for stragglers.

use crate::dispatch::Dispatcher;
use crate::ipc::{IpcListener, IpcStream};
use crate::protocol::{MessageCodec, RpcResponse, INTERNAL_ERROR, PARSE_ERROR};
use crate::watchdog::ActivityTracker;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on the shutdown drain of in-flight handlers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IpcServer {
    listener: IpcListener,
    dispatcher: Arc<Dispatcher>,
    activity: Arc<ActivityTracker>,
    connections: Arc<DashMap<Uuid, Instant>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl IpcServer {
    /// Bind the endpoint. The listener replaces stale socket files and
    /// restricts permissions itself; tokio's default listen backlog more
    /// than covers the handful of CLI clients expected here.
    pub fn bind(
        socket_path: &str,
        dispatcher: Arc<Dispatcher>,
        activity: Arc<ActivityTracker>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = IpcListener::bind(socket_path)?;
        info!(socket = socket_path, "IPC server listening");
        Ok(Self {
            listener,
            dispatcher,
            activity,
            connections: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown,
        })
    }

    pub fn socket_path(&self) -> &str {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then drain handlers (bounded). The listener
    /// is handed back so the supervisor controls when the socket file is
    /// unlinked relative to the rest of teardown.
    pub async fn run(self) -> IpcListener {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        let connection = ConnectionHandler {
                            dispatcher: self.dispatcher.clone(),
                            activity: self.activity.clone(),
                            connections: self.connections.clone(),
                            shutdown: self.shutdown.clone(),
                        };
                        self.tracker.spawn(connection.serve(stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.connections.len(),
                "handlers did not drain before deadline"
            );
        }
        info!("IPC server stopped");
        self.listener
    }
}

struct ConnectionHandler {
    dispatcher: Arc<Dispatcher>,
    activity: Arc<ActivityTracker>,
    connections: Arc<DashMap<Uuid, Instant>>,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    /// Frame-at-a-time request loop. Never lets an error escape: decode
    /// failures become `parse_error` replies, framing violations close the
    /// connection.
    async fn serve(self, mut stream: IpcStream) {
        let client_id = Uuid::new_v4();
        self.connections.insert(client_id, Instant::now());
        debug!(%client_id, "client connected");

        loop {
            let body = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = MessageCodec::read_frame(&mut stream) => match frame {
                    Ok(Some(body)) => body,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%client_id, error = %e, "closing connection on framing error");
                        break;
                    }
                },
            };

            let request = match MessageCodec::decode_request(&body) {
                Ok(request) => request,
                Err(e) => {
                    let reply =
                        RpcResponse::failure("", PARSE_ERROR, format!("invalid JSON body: {e}"));
                    if write_response(&mut stream, &reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            self.activity.touch();
            self.connections.insert(client_id, Instant::now());

            let outcome = self.dispatcher.dispatch(request, &self.shutdown).await;
            if write_response(&mut stream, &outcome.response).await.is_err() {
                break;
            }
            if outcome.shutdown {
                info!(%client_id, "shutdown requested over RPC");
                self.shutdown.cancel();
                break;
            }
        }

        self.connections.remove(&client_id);
        debug!(%client_id, "client disconnected");
    }
}

async fn write_response(stream: &mut IpcStream, response: &RpcResponse) -> Result<()> {
    let framed = match MessageCodec::encode(response) {
        Ok(framed) => framed,
        Err(e) => {
            // Result too large for the wire; degrade to an error reply.
            warn!(error = %e, "response exceeded frame bound");
            let fallback = RpcResponse::failure(
                response.id.clone(),
                INTERNAL_ERROR,
                "response exceeded maximum frame size",
            );
            MessageCodec::encode(&fallback)?
        }
    };
    MessageCodec::write_frame(stream, &framed).await
}
