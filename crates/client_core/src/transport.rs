//! WebSocket implementation of [`MessageChannel`] with automatic reconnect.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientCommand, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{ChannelEvent, ChannelState, MessageChannel};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

pub struct WsChannel {
    outbound: mpsc::UnboundedSender<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
    supervisor: JoinHandle<()>,
}

impl WsChannel {
    /// Starts connecting to `<server_url>/ws` in the background.
    pub fn spawn(server_url: &str, policy: ReconnectPolicy) -> Result<Arc<Self>> {
        let ws_url = websocket_url(server_url)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let (state_tx, state) = watch::channel(ChannelState::Disconnected);
        let supervisor = tokio::spawn(supervise(
            ws_url,
            policy,
            outbound_rx,
            events.clone(),
            state_tx,
        ));
        Ok(Arc::new(Self {
            outbound,
            events,
            state,
            supervisor,
        }))
    }

    /// Resolves once the channel reports [`ChannelState::Connected`].
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| state.is_connected())
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("websocket supervisor stopped"))
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl MessageChannel for WsChannel {
    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: ClientCommand) -> Result<()> {
        if !self.state().is_connected() {
            bail!("channel is not connected");
        }
        self.outbound
            .send(command)
            .map_err(|_| anyhow!("websocket supervisor stopped"))
    }
}

pub fn websocket_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(with_ws_path(url)),
        other => bail!("server_url must use http(s) or ws(s), got {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot switch {server_url} to {scheme}"))?;
    Ok(with_ws_path(url))
}

fn with_ws_path(mut url: Url) -> Url {
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}

fn publish_state(
    state_tx: &watch::Sender<ChannelState>,
    events: &broadcast::Sender<ChannelEvent>,
    state: ChannelState,
) {
    if *state_tx.borrow() == state {
        return;
    }
    state_tx.send_replace(state);
    let _ = events.send(ChannelEvent::StateChanged(state));
}

async fn supervise(
    ws_url: Url,
    policy: ReconnectPolicy,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    state_tx: watch::Sender<ChannelState>,
) {
    let mut delay = policy.initial_delay;
    loop {
        publish_state(&state_tx, &events, ChannelState::Connecting);
        match connect_async(ws_url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %ws_url, "websocket connected");
                delay = policy.initial_delay;
                publish_state(&state_tx, &events, ChannelState::Connected);
                let keep_running = pump(socket, &mut outbound_rx, &events).await;
                publish_state(&state_tx, &events, ChannelState::Disconnected);
                if !keep_running {
                    return;
                }
                warn!(url = %ws_url, "websocket disconnected");
            }
            Err(err) => {
                warn!(url = %ws_url, %err, "websocket connect failed");
                publish_state(&state_tx, &events, ChannelState::Disconnected);
            }
        }

        while let Ok(command) = outbound_rx.try_recv() {
            debug!(kind = command.kind(), "dropping command queued while disconnected");
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(policy.max_delay);
    }
}

/// Shuttles frames until the socket drops. Returns `false` once the owning
/// channel is gone.
async fn pump(
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events: &broadcast::Sender<ChannelEvent>,
) -> bool {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            command = outbound_rx.recv() => {
                let Some(command) = command else {
                    let _ = writer.close().await;
                    return false;
                };
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = command.kind(), %err, "failed to encode command");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!(%err, "websocket write failed");
                    return true;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => ChannelEvent::Message(event),
                        Err(err) => {
                            warn!(%err, "unparseable server frame");
                            ChannelEvent::Malformed(text)
                        }
                    };
                    let _ = events.send(event);
                }
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "websocket read failed");
                    return true;
                }
            }
        }
    }
}
