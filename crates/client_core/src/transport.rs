use std::{sync::Mutex, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::protocol::{InboundEvent, OutboundEvent};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    codec::{self, Frame, Handshake, SocketPacket, DEFAULT_NAMESPACE},
    config::Settings,
    error::TransportError,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Outbound half of the event channel, injected into every store that
/// needs to talk to the backend.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent) -> Result<(), TransportError>;
}

pub type Inbound = mpsc::UnboundedReceiver<InboundEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Long-lived Socket.IO connection that redials on drop. Every successful
/// (re)connect is surfaced as `InboundEvent::Connect`; nothing else about
/// link failures reaches consumers.
pub struct SocketTransport {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LinkState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub fn connect(settings: &Settings) -> Result<(Self, Inbound), TransportError> {
        let ws_url = socket_url(settings.backend_url())?;
        let backoff = Backoff::new(
            settings.reconnect_initial_delay(),
            settings.reconnect_max_delay(),
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        let task = tokio::spawn(run_connection(
            ws_url,
            backoff,
            outbound_rx,
            inbound_tx,
            shutdown_rx,
            state_tx,
        ));

        Ok((
            Self {
                outbound: outbound_tx,
                shutdown: shutdown_tx,
                state: state_rx,
                task: Mutex::new(Some(task)),
            },
            inbound_rx,
        ))
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Flushes events already queued while connected, sends the namespace
    /// disconnect and waits for the connection task to finish. Events queued
    /// during a reconnect back-off have no link to go out on; they are
    /// discarded and counted in a warning.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("socket transport did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl EventSink for SocketTransport {
    fn emit(&self, event: OutboundEvent) -> Result<(), TransportError> {
        debug!(event = event.name(), "queued outbound event");
        self.outbound
            .send(event)
            .map_err(|_| TransportError::Closed)
    }
}

pub fn socket_url(backend_url: &str) -> Result<String, TransportError> {
    let mut url =
        Url::parse(backend_url).map_err(|_| TransportError::InvalidUrl(backend_url.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(TransportError::InvalidUrl(backend_url.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(backend_url.to_string()))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url.to_string())
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

enum SessionEnd {
    Shutdown,
}

async fn run_connection(
    ws_url: String,
    mut backoff: Backoff,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<LinkState>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        state_tx.send_replace(LinkState::Connecting);

        match run_session(
            &ws_url,
            &mut backoff,
            &mut outbound_rx,
            &inbound_tx,
            &mut shutdown_rx,
            &state_tx,
        )
        .await
        {
            Ok(SessionEnd::Shutdown) => break,
            Err(err) => {
                state_tx.send_replace(LinkState::Disconnected);
                let delay = backoff.next_delay();
                warn!(url = %ws_url, error = %err, ?delay, "socket link lost; reconnecting");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }
    outbound_rx.close();
    let mut discarded = 0usize;
    while outbound_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        warn!(url = %ws_url, discarded, "dropping events queued while disconnected");
    }
    state_tx.send_replace(LinkState::Closed);
    info!(url = %ws_url, "socket transport stopped");
}

async fn run_session(
    ws_url: &str,
    backoff: &mut Backoff,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    inbound_tx: &mpsc::UnboundedSender<InboundEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
    state_tx: &watch::Sender<LinkState>,
) -> Result<SessionEnd> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    let (mut writer, mut reader) = ws_stream.split();

    let handshake = timeout(HANDSHAKE_TIMEOUT, perform_handshake(&mut writer, &mut reader))
        .await
        .context("socket.io handshake timed out")??;

    let liveness = handshake.liveness_window();
    state_tx.send_replace(LinkState::Connected);
    backoff.reset();
    info!(url = %ws_url, sid = %handshake.sid, "socket connected");
    if inbound_tx.send(InboundEvent::Connect).is_err() {
        return Ok(SessionEnd::Shutdown);
    }

    // Only inbound traffic pushes the deadline back.
    let idle = sleep(liveness);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                while let Ok(event) = outbound_rx.try_recv() {
                    let frame = codec::encode_event(event.name(), &event.payload());
                    if writer.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                let _ = writer.send(Message::Text(codec::encode_disconnect())).await;
                let _ = writer.close().await;
                return Ok(SessionEnd::Shutdown);
            }
            () = &mut idle => bail!("no traffic within {liveness:?}"),
            next = reader.next() => {
                let msg = match next {
                    None => bail!("websocket closed by peer"),
                    Some(msg) => msg.context("websocket receive failed")?,
                };
                idle.as_mut().reset(Instant::now() + liveness);
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => bail!("websocket closed by peer"),
                    _ => continue,
                };
                let frame = match codec::decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable frame");
                        continue;
                    }
                };
                match frame {
                    Frame::Ping(data) => {
                        writer.send(Message::Text(codec::encode_pong(&data))).await?;
                    }
                    Frame::Close => bail!("engine.io close from server"),
                    Frame::Socket(SocketPacket::Disconnect { namespace })
                        if namespace == DEFAULT_NAMESPACE =>
                    {
                        bail!("server disconnected namespace");
                    }
                    Frame::Socket(SocketPacket::Event { namespace, name, payload, .. })
                        if namespace == DEFAULT_NAMESPACE =>
                    {
                        match InboundEvent::decode(&name, payload) {
                            Ok(event) => {
                                debug!(event = %name, "inbound event");
                                if inbound_tx.send(event).is_err() {
                                    return Ok(SessionEnd::Shutdown);
                                }
                            }
                            Err(err) => warn!(event = %name, error = %err, "dropping malformed event payload"),
                        }
                    }
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else {
                    return Ok(SessionEnd::Shutdown);
                };
                let frame = codec::encode_event(event.name(), &event.payload());
                writer
                    .send(Message::Text(frame))
                    .await
                    .with_context(|| format!("failed to send {}", event.name()))?;
            }
        }
    }
}

/// Waits for the Engine.IO open packet, joins the default namespace and
/// returns once the server acknowledges it.
async fn perform_handshake(writer: &mut WsWriter, reader: &mut WsReader) -> Result<Handshake> {
    let mut handshake: Option<Handshake> = None;
    while let Some(msg) = reader.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        match codec::decode_frame(&text)? {
            Frame::Open(open) => {
                handshake = Some(open);
                writer.send(Message::Text(codec::encode_connect())).await?;
            }
            Frame::Socket(SocketPacket::Connect { namespace, .. })
                if namespace == DEFAULT_NAMESPACE =>
            {
                return handshake.ok_or_else(|| anyhow!("namespace connect before open"));
            }
            Frame::Socket(SocketPacket::ConnectError { data, .. }) => {
                bail!("namespace connect refused: {}", data.unwrap_or_default());
            }
            Frame::Ping(data) => {
                writer.send(Message::Text(codec::encode_pong(&data))).await?;
            }
            _ => {}
        }
    }
    bail!("websocket closed during handshake")
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
