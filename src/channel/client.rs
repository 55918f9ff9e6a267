//! Worker-side endpoint of the message channel.
//!
//! Holds one loopback TCP connection, frames outbound messages as single
//! lines, and surfaces inbound lines as events. A dropped connection is
//! retried with exponential backoff until `max_reconnect_attempts`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ChannelEvent;
use super::message::WireMessage;
use crate::config::ChannelConfig;
use crate::error::{Result, SwarmError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct ClientState {
    config: ChannelConfig,
    port: u16,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    events: broadcast::Sender<ChannelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// One worker's connection to the orchestrator channel.
pub struct MessageClient {
    state: Arc<ClientState>,
}

impl MessageClient {
    /// Connect to the server on the loopback interface.
    pub async fn connect(port: u16, config: ChannelConfig) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (read_half, write_half) = stream.into_split();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(ClientState {
            config,
            port,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            events,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let _ = state.events.send(ChannelEvent::Connected);
        spawn_read_loop(Arc::clone(&state), read_half);

        Ok(Self { state })
    }

    /// Subscribe to connection events and inbound messages.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.state.events.subscribe()
    }

    /// Write one framed message.
    pub async fn send(&self, msg: &WireMessage) -> Result<()> {
        let line = msg.to_line()?;
        let mut writer = self.state.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(SwarmError::SendFailure("client is not connected".into()));
        };
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SwarmError::SendFailure(e.to_string()))?;
        Ok(())
    }

    /// Introduce this endpoint to the server so it binds `worker_id` to
    /// the socket. Any first message works; a heartbeat is side-effect
    /// free.
    pub async fn introduce(&self, worker_id: &str) -> Result<()> {
        self.send(&WireMessage::heartbeat(worker_id, "orchestrator"))
            .await
    }

    pub fn is_connected(&self) -> bool {
        !self.state.closed.load(Ordering::Acquire)
    }

    /// Drop the connection and stop reconnecting.
    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.writer.lock().await.take();
        let _ = self.state.events.send(ChannelEvent::Disconnected);
    }
}

fn spawn_read_loop(state: Arc<ClientState>, read_half: OwnedReadHalf) {
    let loop_state = Arc::clone(&state);
    let handle = tokio::spawn(async move {
        read_until_closed(&loop_state, read_half).await;
        if loop_state.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = loop_state.events.send(ChannelEvent::Disconnected);
        reconnect(loop_state).await;
    });
    state.tasks.lock().push(handle);
}

async fn read_until_closed(state: &Arc<ClientState>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => match WireMessage::from_line(&line) {
                Ok(msg) => {
                    let _ = state.events.send(ChannelEvent::Message(msg));
                }
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable line");
                    let _ = state
                        .events
                        .send(ChannelEvent::Error(format!("bad frame: {}", e)));
                }
            },
            Err(e) => {
                debug!(error = %e, "Client read failed");
                break;
            }
        }
    }
}

/// Exponential backoff: `reconnect_delay_ms * 2^(attempt - 1)`, up to
/// `max_reconnect_attempts`, then `ReconnectFailed`.
async fn reconnect(state: Arc<ClientState>) {
    let base = state.config.reconnect_delay_ms;
    for attempt in 1..=state.config.max_reconnect_attempts {
        if state.closed.load(Ordering::Acquire) {
            return;
        }

        let delay = Duration::from_millis(base.saturating_mul(1 << (attempt - 1)));
        tokio::time::sleep(delay).await;

        match TcpStream::connect(("127.0.0.1", state.port)).await {
            Ok(stream) => {
                info!(attempt, "Reconnected to message channel");
                let (read_half, write_half) = stream.into_split();
                *state.writer.lock().await = Some(write_half);
                let _ = state.events.send(ChannelEvent::Connected);
                spawn_read_loop(state, read_half);
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }

    let _ = state.events.send(ChannelEvent::ReconnectFailed);
}
