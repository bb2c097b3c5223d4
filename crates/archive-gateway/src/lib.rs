//! Reconnecting gateway session (spec §4.D), built directly on
//! `tokio_tungstenite::connect_async` the way `client-sdk/src/websocket.rs`
//! wraps it, generalized from a single fire-and-forget socket into the full
//! `Disconnected -> Connecting -> Hello -> Identifying | Resuming -> Ready
//! -> ConnectionLost` state machine.

mod connection;
mod session;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use archive_wire::gateway::{DispatchEvent, GatewayOpcode, GatewayPayload};
pub use session::GatewayEvent;
use session::{Command, SessionConfig};

/// A live gateway session. `send_payload` queues until `Ready`;
/// `destroy` terminates the socket and refuses further sends (spec §4.D).
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn connect(url: impl Into<String>, token: impl Into<String>, intents: u64) -> (GatewayHandle, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            url: url.into(),
            token: token.into(),
            intents,
        };
        let task = tokio::spawn(session::run(config, events_tx, commands_rx));
        (
            GatewayHandle {
                commands: commands_tx,
                task,
            },
            events_rx,
        )
    }

    pub fn send_payload(&self, payload: GatewayPayload) {
        let _ = self.commands.send(Command::Send(payload));
    }

    pub async fn destroy(self) {
        let _ = self.commands.send(Command::Destroy);
        let _ = self.task.await;
    }
}
