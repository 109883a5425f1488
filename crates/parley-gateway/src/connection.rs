use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::bus::EventBus;
use crate::filter::EventFilter;
use crate::session::{SessionCloser, SessionHandle};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How much of an unparseable command makes it into the log, in characters.
const RAW_PREVIEW_CHARS: usize = 200;

/// A frame queued for the client. Event frames carry the closer of the
/// session that produced them so a frame queued just before its session
/// closed is discarded instead of sent.
struct Outbound {
    origin: Option<SessionCloser>,
    event: GatewayEvent,
}

impl Outbound {
    fn reply(event: GatewayEvent) -> Self {
        Self { origin: None, event }
    }

    /// Produced by a session that has since closed.
    fn is_stale(&self) -> bool {
        self.origin.as_ref().is_some_and(SessionCloser::is_closed)
    }
}

type Sessions = Arc<Mutex<HashMap<Topic, SessionHandle>>>;

/// Drive one gateway WebSocket. `user_id` was verified at the HTTP upgrade
/// layer; `None` means the socket is anonymous.
pub async fn handle_connection(socket: WebSocket, bus: EventBus, user_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();

    info!("{:?} connected to gateway", user_id);

    let ready = GatewayEvent::Ready { user_id };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued frames -> client, with heartbeat
    let send_bus = bus.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = out_rx.recv() => {
                    let Some(outbound) = result else { break };

                    if outbound.is_stale() {
                        continue;
                    }

                    if send_event(&mut sender, &outbound.event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                _ = send_bus.shut_down() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Read commands from client
    let recv_sessions = sessions.clone();
    let recv_bus = bus.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&recv_bus, user_id, cmd, &recv_sessions, &out_tx),
                    Err(e) => {
                        warn!(
                            "{:?} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            preview(&text)
                        );
                        let _ = out_tx.send(Outbound::reply(GatewayEvent::Error {
                            message: format!("bad command: {}", e),
                        }));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    close_all(&sessions);
    info!("{:?} disconnected from gateway", user_id);
}

fn handle_command(
    bus: &EventBus,
    user_id: Option<Uuid>,
    cmd: GatewayCommand,
    sessions: &Sessions,
    out_tx: &mpsc::UnboundedSender<Outbound>,
) {
    match cmd {
        GatewayCommand::Subscribe {
            topic,
            conversation_id,
        } => {
            let filter = match EventFilter::for_topic(topic, user_id, conversation_id) {
                Ok(filter) => filter,
                Err(e) => {
                    let _ = out_tx.send(Outbound::reply(GatewayEvent::Error {
                        message: e.to_string(),
                    }));
                    return;
                }
            };

            let session = bus.subscribe(topic, user_id, filter);
            let origin = session.closer();
            let tx = out_tx.clone();
            let handle = SessionHandle::spawn(session, move |payload| {
                tx.send(Outbound {
                    origin: Some(origin.clone()),
                    event: GatewayEvent::Event { topic, payload },
                })
                .is_ok()
            });

            info!("{:?} subscribed to {}", user_id, topic);
            // Replacing an earlier session on the same topic closes it.
            let Ok(mut sessions) = sessions.lock() else {
                error!("Session registry poisoned for {:?}", user_id);
                return;
            };
            sessions.insert(topic, handle);
            let _ = out_tx.send(Outbound::reply(GatewayEvent::Subscribed { topic }));
        }

        GatewayCommand::Unsubscribe { topic } => {
            let removed = match sessions.lock() {
                Ok(mut sessions) => sessions.remove(&topic),
                Err(_) => {
                    error!("Session registry poisoned for {:?}", user_id);
                    return;
                }
            };
            if let Some(handle) = removed {
                handle.closer().close();
                info!("{:?} unsubscribed from {}", user_id, topic);
            }
            let _ = out_tx.send(Outbound::reply(GatewayEvent::Unsubscribed { topic }));
        }
    }
}

fn close_all(sessions: &Sessions) {
    let drained: Vec<SessionHandle> = match sessions.lock() {
        Ok(mut sessions) => sessions.drain().map(|(_, handle)| handle).collect(),
        Err(poisoned) => poisoned.into_inner().drain().map(|(_, handle)| handle).collect(),
    };
    for handle in &drained {
        handle.closer().close();
    }
}

/// Leading slice of `text`, cut on a character boundary.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(RAW_PREVIEW_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

async fn send_event<S>(sender: &mut S, event: &GatewayEvent) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event).map_err(|e| {
        error!("Failed to encode gateway event: {}", e);
    })?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
