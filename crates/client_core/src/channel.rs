use anyhow::Result;
use async_trait::async_trait;
use shared::protocol::{ClientCommand, ServerEvent};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Message(ServerEvent),
    /// A frame that did not decode as a [`ServerEvent`].
    Malformed(String),
}

/// Bidirectional realtime link to the session server.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn state(&self) -> ChannelState;
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
    async fn send(&self, command: ClientCommand) -> Result<()>;
}
