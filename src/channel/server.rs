//! Loopback TCP server endpoint of the message channel.
//!
//! Accepts one connection per worker, splits the byte stream on `\n`, and
//! binds each connection to the `from` id of its first message. Inbound
//! messages resolve filter and correlation waiters first; everything else
//! lands in bounded per-destination queues.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::WireMessage;
use super::{ChannelEvent, RemoteSink};
use crate::config::ChannelConfig;
use crate::error::{Result, SwarmError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type MessageFilter = Box<dyn Fn(&WireMessage) -> bool + Send + Sync>;
type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct Waiter {
    id: u64,
    filter: MessageFilter,
    tx: oneshot::Sender<WireMessage>,
}

struct ServerState {
    config: ChannelConfig,
    connections: Mutex<HashMap<String, SharedWriter>>,
    queues: Mutex<HashMap<String, VecDeque<WireMessage>>>,
    waiters: Mutex<Vec<Waiter>>,
    waiter_seq: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ChannelEvent>,
    remote_sink: Option<Arc<dyn RemoteSink>>,
    remote_destinations: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl ServerState {
    /// Route one inbound message: a matching waiter consumes it,
    /// otherwise it joins the destination queue (head dropped on
    /// overflow).
    fn route(&self, msg: WireMessage) {
        let _ = self.events.send(ChannelEvent::Message(msg.clone()));

        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters
                .iter()
                .position(|w| (w.filter)(&msg))
                .map(|idx| waiters.remove(idx))
        };
        if let Some(waiter) = waiter {
            if waiter.tx.send(msg).is_err() {
                debug!("Waiter dropped before delivery");
            }
            return;
        }

        let mut queues = self.queues.lock();
        let queue = queues.entry(msg.to.clone()).or_default();
        if queue.len() >= self.config.max_queue_size {
            let dropped = queue.pop_front();
            warn!(
                destination = %msg.to,
                dropped_id = dropped.as_ref().map(|m| m.id.as_str()).unwrap_or(""),
                "Message queue overflow, dropped oldest"
            );
        }
        queue.push_back(msg);
    }

    fn take_queued(&self, filter: &dyn Fn(&WireMessage) -> bool) -> Option<WireMessage> {
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            if let Some(idx) = queue.iter().position(|m| filter(m)) {
                return queue.remove(idx);
            }
        }
        None
    }

    fn disconnect(&self, worker_id: &str) {
        if self.connections.lock().remove(worker_id).is_some() {
            debug!(worker_id = %worker_id, "Worker disconnected");
            let _ = self.events.send(ChannelEvent::WorkerDisconnected {
                worker_id: worker_id.to_string(),
            });
        }
    }
}

/// Orchestrator-side endpoint: one listener, many worker connections.
pub struct MessageServer {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
}

impl MessageServer {
    pub async fn bind(config: ChannelConfig) -> Result<Self> {
        Self::bind_with_sink(config, None).await
    }

    /// Bind on the loopback interface; port 0 picks a free port.
    pub async fn bind_with_sink(
        config: ChannelConfig,
        remote_sink: Option<Arc<dyn RemoteSink>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Message channel listening");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(ServerState {
            config,
            connections: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Vec::new()),
            waiter_seq: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            events,
            remote_sink,
            remote_destinations: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Connection accepted");
                        let conn_state = Arc::clone(&accept_state);
                        let handle =
                            tokio::spawn(async move { run_connection(conn_state, stream).await });
                        accept_state.tasks.lock().push(handle);
                    }
                    Err(e) => {
                        if accept_state.stopped.load(Ordering::Acquire) {
                            break;
                        }
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });
        state.tasks.lock().push(accept_task);

        Ok(Self { state, local_addr })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configured default wait budget for request/response exchanges.
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.state.config.message_timeout_ms)
    }

    /// Subscribe to channel events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.state.events.subscribe()
    }

    /// Ids of currently bound workers.
    pub fn connected_workers(&self) -> Vec<String> {
        self.state.connections.lock().keys().cloned().collect()
    }

    /// Mark a destination remote so sends bypass the local socket.
    pub fn mark_remote(&self, worker_id: &str) {
        self.state
            .remote_destinations
            .lock()
            .insert(worker_id.to_string());
    }

    /// Send to one worker. Returns `false` when the worker has no bound
    /// socket and no remote sink accepted the message.
    pub async fn send(&self, worker_id: &str, msg: WireMessage) -> Result<bool> {
        if self.state.stopped.load(Ordering::Acquire) {
            return Err(SwarmError::Disposed("message server".into()));
        }

        let is_remote = self.state.remote_destinations.lock().contains(worker_id);
        if is_remote {
            return self.remote_fallback(msg, None).await;
        }

        let writer = self.state.connections.lock().get(worker_id).cloned();
        let Some(writer) = writer else {
            if self.state.config.enable_remote_fallback {
                return self.remote_fallback(msg, None).await;
            }
            return Ok(false);
        };

        let line = msg.to_line()?;
        let write_result = {
            let mut guard = writer.lock().await;
            guard.write_all(line.as_bytes()).await
        };

        match write_result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Local send failed");
                self.state.disconnect(worker_id);
                if self.state.config.enable_remote_fallback {
                    self.remote_fallback(msg, Some(e.to_string())).await
                } else {
                    Err(SwarmError::SendFailure(format!(
                        "write to {} failed: {}",
                        worker_id, e
                    )))
                }
            }
        }
    }

    /// Hand an unsent message to the remote sink, or surface it as a
    /// `RemoteMessage` event for the outer orchestrator to deal with.
    async fn remote_fallback(&self, msg: WireMessage, local_error: Option<String>) -> Result<bool> {
        let _ = self
            .state
            .events
            .send(ChannelEvent::RemoteMessage(msg.clone()));

        match &self.state.remote_sink {
            Some(sink) => {
                sink.send(msg).await?;
                Ok(true)
            }
            None => match local_error {
                Some(e) => Err(SwarmError::SendFailure(format!(
                    "local send failed ({}) and no remote sink configured",
                    e
                ))),
                None => Ok(false),
            },
        }
    }

    /// Write to every bound connection; per-connection errors are logged.
    pub async fn broadcast(&self, msg: WireMessage) -> Result<()> {
        let line = msg.to_line()?;
        let writers: Vec<(String, SharedWriter)> = self
            .state
            .connections
            .lock()
            .iter()
            .map(|(id, w)| (id.clone(), Arc::clone(w)))
            .collect();

        for (worker_id, writer) in writers {
            let mut guard = writer.lock().await;
            if let Err(e) = guard.write_all(line.as_bytes()).await {
                warn!(worker_id = %worker_id, error = %e, "Broadcast write failed");
            }
        }
        Ok(())
    }

    /// First queued or future message matching `filter`.
    pub async fn wait_for_message<F>(&self, filter: F, timeout: Duration) -> Result<WireMessage>
    where
        F: Fn(&WireMessage) -> bool + Send + Sync + 'static,
    {
        if let Some(msg) = self.state.take_queued(&filter) {
            return Ok(msg);
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = self.state.waiter_seq.fetch_add(1, Ordering::Relaxed);
        self.state.waiters.lock().push(Waiter {
            id: waiter_id,
            filter: Box::new(filter),
            tx,
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(SwarmError::Disposed("message server".into())),
            Err(_) => {
                self.state.waiters.lock().retain(|w| w.id != waiter_id);
                Err(SwarmError::Timeout(format!(
                    "no matching message within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// The response carrying `correlation_id`. Resolved waiters consume
    /// the response without it touching the general queue.
    pub async fn wait_for_response(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<WireMessage> {
        let wanted = correlation_id.to_string();
        self.wait_for_message(
            move |msg| msg.correlation_id.as_deref() == Some(wanted.as_str()),
            timeout,
        )
        .await
    }

    /// Resolve once the worker's socket is bound. Immediate when already
    /// connected.
    pub async fn wait_for_worker(&self, worker_id: &str, timeout: Duration) -> Result<()> {
        let mut events = self.subscribe();
        if self.state.connections.lock().contains_key(worker_id) {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SwarmError::Timeout(format!(
                    "worker {} did not connect within {}ms",
                    worker_id,
                    timeout.as_millis()
                )));
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(ChannelEvent::WorkerConnected { worker_id: id })) if id == worker_id => {
                    return Ok(());
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // May have missed the connect event; re-check the map.
                    if self.state.connections.lock().contains_key(worker_id) {
                        return Ok(());
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(SwarmError::Disposed("message server".into()));
                }
                Err(_) => {
                    return Err(SwarmError::Timeout(format!(
                        "worker {} did not connect within {}ms",
                        worker_id,
                        timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Destroy all sockets, close the listener, and reject outstanding
    /// waiters.
    pub fn stop(&self) {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Message channel stopping");

        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }

        let worker_ids: Vec<String> = {
            let mut connections = self.state.connections.lock();
            let ids = connections.keys().cloned().collect();
            connections.clear();
            ids
        };
        for worker_id in worker_ids {
            let _ = self
                .state
                .events
                .send(ChannelEvent::WorkerDisconnected { worker_id });
        }

        // Dropping the senders rejects outstanding waits with Disposed.
        self.state.waiters.lock().clear();
    }
}

impl Drop for MessageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-connection read loop: buffer, split on `\n`, parse, route. The
/// first parsed message binds the connection to its `from` id.
async fn run_connection(state: Arc<ServerState>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let mut bound_id: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let msg = match WireMessage::from_line(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Dropping unparseable line");
                        let _ = state
                            .events
                            .send(ChannelEvent::Error(format!("bad frame: {}", e)));
                        continue;
                    }
                };

                if bound_id.is_none() {
                    let worker_id = msg.from.clone();
                    let previous = state
                        .connections
                        .lock()
                        .insert(worker_id.clone(), Arc::clone(&writer));
                    if previous.is_some() {
                        debug!(worker_id = %worker_id, "Rebound worker connection");
                    }
                    let _ = state.events.send(ChannelEvent::WorkerConnected {
                        worker_id: worker_id.clone(),
                    });
                    bound_id = Some(worker_id);
                }
                state.route(msg);
            }
            Err(e) => {
                debug!(error = %e, "Connection read failed");
                break;
            }
        }
    }

    if let Some(worker_id) = bound_id {
        state.disconnect(&worker_id);
    }
}
