//! The reconnecting session actor (spec §4.D): one task owns the socket and
//! all session state, the same "single task owns mutable state, others
//! message it" shape `background_connection.rs`'s `receiver_loop` uses, here
//! generalized into an explicit state machine instead of a fire-and-forget
//! relay.

use std::time::Duration;

use archive_wire::gateway::{DispatchEvent, GatewayOpcode, GatewayPayload, HelloData, InvalidSessionData};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;

use crate::connection::{GatewaySocket, SocketEvent};

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Connecting,
    ConnectionLost { was_connected: bool, code: Option<u16> },
    Dispatch { payload: Box<DispatchEvent>, realtime: bool },
    SessionLost,
    PayloadSent,
    PayloadReceived,
    Error(String),
}

pub enum Command {
    Send(GatewayPayload),
    Destroy,
}

/// Close codes the upstream documents as fatal: authentication failures and
/// protocol/intent errors where resuming can never succeed.
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    last_seq: Option<u64>,
}

pub struct SessionConfig {
    pub url: String,
    pub token: String,
    pub intents: u64,
}

/// Drives the whole reconnect loop until `Command::Destroy` is received.
/// `events` is the sink `GatewayEvent`s are published on; `commands` feeds
/// `send_payload` / `destroy` requests from the handle.
pub async fn run(config: SessionConfig, events: mpsc::UnboundedSender<GatewayEvent>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut state = SessionState::default();
    let mut backoff = Duration::from_secs(1);
    let mut pending: Vec<GatewayPayload> = Vec::new();
    let mut destroyed = false;

    while !destroyed {
        let _ = events.send(GatewayEvent::Connecting);
        let socket = match GatewaySocket::connect(&config.url).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = events.send(GatewayEvent::Error(e.to_string()));
                if sleep_or_drain(backoff, &mut commands, &mut destroyed).await {
                    break;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        let was_connected = state.session_id.is_some();
        match run_connection(&config, &mut state, socket, &events, &mut commands, &mut pending).await {
            ConnectionOutcome::Destroyed => destroyed = true,
            ConnectionOutcome::Fatal => {
                let _ = events.send(GatewayEvent::ConnectionLost { was_connected, code: None });
                destroyed = true;
            }
            ConnectionOutcome::Lost { code } => {
                let _ = events.send(GatewayEvent::ConnectionLost { was_connected, code });
                if code.map(|c| FATAL_CLOSE_CODES.contains(&c)).unwrap_or(false) {
                    destroyed = true;
                } else {
                    backoff = next_backoff(backoff);
                }
            }
        }
    }
}

enum ConnectionOutcome {
    Destroyed,
    Fatal,
    Lost { code: Option<u16> },
}

async fn run_connection(
    config: &SessionConfig,
    state: &mut SessionState,
    mut socket: GatewaySocket,
    events: &mpsc::UnboundedSender<GatewayEvent>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    pending: &mut Vec<GatewayPayload>,
) -> ConnectionOutcome {
    let mut heartbeat_interval: Option<Duration> = None;
    let mut heartbeat_ack_pending = false;
    let mut ready = false;

    loop {
        let tick = async move {
            match heartbeat_interval {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    true
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Destroy) | None => {
                        socket.close().await;
                        return ConnectionOutcome::Destroyed;
                    }
                    Some(Command::Send(payload)) => {
                        if ready {
                            if socket.send(&payload).await.is_ok() {
                                let _ = events.send(GatewayEvent::PayloadSent);
                            }
                        } else {
                            pending.push(payload);
                        }
                    }
                }
            }

            event = socket.next_event() => {
                match event {
                    None => return ConnectionOutcome::Lost { code: None },
                    Some(Err(e)) => {
                        let _ = events.send(GatewayEvent::Error(e.to_string()));
                        return ConnectionOutcome::Lost { code: None };
                    }
                    Some(Ok(SocketEvent::Closed { code })) => {
                        return ConnectionOutcome::Lost { code };
                    }
                    Some(Ok(SocketEvent::Payload(payload))) => {
                        let _ = events.send(GatewayEvent::PayloadReceived);
                        if let Some(seq) = payload.s {
                            state.last_seq = Some(seq);
                        }
                        match payload.opcode() {
                            GatewayOpcode::Hello => {
                                let hello: HelloData = match serde_json::from_value(payload.d.clone()) {
                                    Ok(h) => h,
                                    Err(e) => {
                                        let _ = events.send(GatewayEvent::Error(e.to_string()));
                                        return ConnectionOutcome::Lost { code: None };
                                    }
                                };
                                heartbeat_interval = Some(jittered(Duration::from_millis(hello.heartbeat_interval)));
                                if let (Some(session_id), Some(seq)) = (&state.session_id, state.last_seq) {
                                    let resume = GatewayPayload {
                                        op: GatewayOpcode::Resume.into(),
                                        d: json!({ "token": config.token, "session_id": session_id, "seq": seq }),
                                        s: None,
                                        t: None,
                                    };
                                    if socket.send(&resume).await.is_err() {
                                        return ConnectionOutcome::Lost { code: None };
                                    }
                                } else {
                                    let identify = GatewayPayload {
                                        op: GatewayOpcode::Identify.into(),
                                        d: json!({
                                            "token": config.token,
                                            "intents": config.intents,
                                            "properties": { "os": "linux", "browser": "archive", "device": "archive" },
                                        }),
                                        s: None,
                                        t: None,
                                    };
                                    if socket.send(&identify).await.is_err() {
                                        return ConnectionOutcome::Lost { code: None };
                                    }
                                }
                            }
                            GatewayOpcode::HeartbeatAck => {
                                heartbeat_ack_pending = false;
                            }
                            GatewayOpcode::Heartbeat => {
                                let hb = heartbeat_payload(state.last_seq);
                                let _ = socket.send(&hb).await;
                            }
                            GatewayOpcode::Reconnect => {
                                return ConnectionOutcome::Lost { code: None };
                            }
                            GatewayOpcode::InvalidSession => {
                                let resumable: InvalidSessionData = serde_json::from_value(payload.d.clone())
                                    .unwrap_or(InvalidSessionData(false));
                                if !resumable.0 {
                                    state.session_id = None;
                                    state.last_seq = None;
                                    let _ = events.send(GatewayEvent::SessionLost);
                                }
                                return ConnectionOutcome::Lost { code: None };
                            }
                            GatewayOpcode::Dispatch => {
                                let name = payload.t.clone();
                                match DispatchEvent::decode(&payload) {
                                    Ok(dispatch) => {
                                        if matches!(dispatch, DispatchEvent::Ready(_)) {
                                            if let DispatchEvent::Ready(ref r) = dispatch {
                                                state.session_id = Some(r.session_id.clone());
                                            }
                                            ready = true;
                                            for queued in pending.drain(..) {
                                                if socket.send(&queued).await.is_ok() {
                                                    let _ = events.send(GatewayEvent::PayloadSent);
                                                }
                                            }
                                        }
                                        let realtime = !matches!(
                                            name.as_deref(),
                                            Some("GUILD_CREATE") | Some("GUILD_MEMBERS_CHUNK")
                                        );
                                        let _ = events.send(GatewayEvent::Dispatch {
                                            payload: Box::new(dispatch),
                                            realtime,
                                        });
                                    }
                                    Err(e) => {
                                        tracing::debug!(error = %e, "unknown or malformed dispatch event, ignored");
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            fired = tick => {
                if fired {
                    if heartbeat_ack_pending {
                        return ConnectionOutcome::Lost { code: None };
                    }
                    let hb = heartbeat_payload(state.last_seq);
                    if socket.send(&hb).await.is_err() {
                        return ConnectionOutcome::Lost { code: None };
                    }
                    heartbeat_ack_pending = true;
                }
            }
        }
    }
}

fn heartbeat_payload(last_seq: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: GatewayOpcode::Heartbeat.into(),
        d: last_seq.map(|s| json!(s)).unwrap_or(serde_json::Value::Null),
        s: None,
        t: None,
    }
}

fn jittered(interval: Duration) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.0..1.0);
    interval.mul_f64(1.0 - jitter * 0.1)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(Duration::from_secs(60))
}

/// Waits out `d` unless a command arrives first; `Destroy` (or the command
/// channel closing) short-circuits the wait and reports destruction.
async fn sleep_or_drain(d: Duration, commands: &mut mpsc::UnboundedReceiver<Command>, destroyed: &mut bool) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        cmd = commands.recv() => {
            if matches!(cmd, Some(Command::Destroy) | None) {
                *destroyed = true;
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        let mut d = Duration::from_secs(1);
        for _ in 0..10 {
            d = next_backoff(d);
        }
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn jittered_interval_never_exceeds_the_original() {
        let base = Duration::from_millis(41250);
        for _ in 0..20 {
            let jittered = jittered(base);
            assert!(jittered <= base);
            assert!(jittered >= base.mul_f64(0.9));
        }
    }

    #[test]
    fn fatal_close_codes_exclude_ordinary_disconnects() {
        assert!(FATAL_CLOSE_CODES.contains(&4004));
        assert!(!FATAL_CLOSE_CODES.contains(&1000));
    }
}
