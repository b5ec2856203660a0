// =============================================================================
// Telemetry Broadcaster — Event Bus to WebSocket room bridge
// =============================================================================
//
// Two rooms: `strategy-monitor` and `pool-crawler`. Clients join with a
// `subscribe:<room>` message and receive `{event, data}` frames where data
// carries `{type, data, timestamp}`.
//
// Every bus subscription id is recorded at startup and released at
// shutdown — a leaked subscription is a correctness bug, so `shutdown`
// asserts the count drains to zero.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{
    BusEvent, EventBus, TOPIC_POOL_CRAWLER_PREFIX, TOPIC_SMART_STOP_LOSS, TOPIC_STRATEGY_STATUS,
};

pub const ROOM_STRATEGY_MONITOR: &str = "strategy-monitor";
pub const ROOM_POOL_CRAWLER: &str = "pool-crawler";

type RoomMap = HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<String>>>;

pub struct TelemetryBroadcaster {
    bus: EventBus,
    rooms: Arc<RwLock<RoomMap>>,
    /// Every bus subscription taken by this broadcaster; all released on
    /// shutdown.
    bus_subscriptions: Mutex<Vec<Uuid>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryBroadcaster {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            rooms: Arc::new(RwLock::new(RoomMap::new())),
            bus_subscriptions: Mutex::new(Vec::new()),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the runtime topics and start the fan-out tasks.
    pub fn start(self: &Arc<Self>) {
        self.bridge(TOPIC_STRATEGY_STATUS, ROOM_STRATEGY_MONITOR, "strategy:status-update");
        self.bridge(
            TOPIC_SMART_STOP_LOSS,
            ROOM_STRATEGY_MONITOR,
            "strategy:smart-stop-loss",
        );
        let crawler_pattern = format!("{TOPIC_POOL_CRAWLER_PREFIX}*");
        self.bridge(&crawler_pattern, ROOM_POOL_CRAWLER, "pool-crawler:update");
        info!("telemetry broadcaster started");
    }

    fn bridge(self: &Arc<Self>, pattern: &str, room: &'static str, event_name: &'static str) {
        let (id, mut rx) = self.bus.subscribe(pattern);
        self.bus_subscriptions.lock().push(id);

        let rooms = self.rooms.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                fan_out(&rooms, room, event_name, &event);
            }
        });
        self.forwarders.lock().push(task);
    }

    fn join(&self, room: &str, conn: Uuid, tx: mpsc::UnboundedSender<String>) {
        self.rooms
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(conn, tx);
        debug!(%conn, room, "client joined room");
    }

    fn leave(&self, room: &str, conn: Uuid) {
        if let Some(members) = self.rooms.write().get_mut(room) {
            members.remove(&conn);
        }
        debug!(%conn, room, "client left room");
    }

    fn leave_all(&self, conn: Uuid) {
        for members in self.rooms.write().values_mut() {
            members.remove(&conn);
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.read().get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Drain everything: bus subscriptions released, forwarders stopped,
    /// client channels dropped (which closes the sockets).
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.bus_subscriptions.lock().drain(..).collect();
        for id in ids {
            if !self.bus.unsubscribe(id) {
                warn!(%id, "broadcaster subscription already gone at shutdown");
            }
        }
        for task in self.forwarders.lock().drain(..) {
            task.abort();
        }
        self.rooms.write().clear();
        info!("telemetry broadcaster drained");
    }
}

fn fan_out(rooms: &RwLock<RoomMap>, room: &str, event_name: &str, event: &BusEvent) {
    let frame = serde_json::json!({
        "event": event_name,
        "data": {
            "type": event.topic,
            "data": event.payload,
            "timestamp": event.timestamp,
        },
    })
    .to_string();

    let mut dead = Vec::new();
    {
        let rooms = rooms.read();
        let Some(members) = rooms.get(room) else {
            return;
        };
        for (conn, tx) in members {
            if tx.send(frame.clone()).is_err() {
                dead.push(*conn);
            }
        }
    }
    if !dead.is_empty() {
        let mut rooms = rooms.write();
        if let Some(members) = rooms.get_mut(room) {
            for conn in dead {
                members.remove(&conn);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Axum wiring
// ---------------------------------------------------------------------------

pub fn router(broadcaster: Arc<TelemetryBroadcaster>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(broadcaster)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<TelemetryBroadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, broadcaster))
}

async fn handle_connection(socket: WebSocket, broadcaster: Arc<TelemetryBroadcaster>) {
    let conn = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    info!(%conn, "websocket client connected");

    loop {
        tokio::select! {
            // Outbound: room traffic for this connection.
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound: subscribe/unsubscribe/ping.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) =
                            handle_client_message(&broadcaster, conn, &tx, &text)
                        {
                            if sender.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%conn, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    broadcaster.leave_all(conn);
    info!(%conn, "websocket client disconnected");
}

/// Process one `{event, data}` client frame; returns the reply frame.
fn handle_client_message(
    broadcaster: &TelemetryBroadcaster,
    conn: Uuid,
    tx: &mpsc::UnboundedSender<String>,
    text: &str,
) -> Option<String> {
    let event = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => value.get("event")?.as_str()?.to_string(),
        // Bare-string frames are tolerated for hand-rolled clients.
        Err(_) => text.trim().to_string(),
    };

    if event == "ping" {
        return Some(
            serde_json::json!({
                "event": "pong",
                "data": { "timestamp": Utc::now().timestamp_millis() },
            })
            .to_string(),
        );
    }

    if let Some(room) = event.strip_prefix("subscribe:") {
        if room != ROOM_STRATEGY_MONITOR && room != ROOM_POOL_CRAWLER {
            return Some(subscribe_ack(room, false, "unknown room"));
        }
        broadcaster.join(room, conn, tx.clone());
        return Some(subscribe_ack(room, true, "subscribed"));
    }

    if let Some(room) = event.strip_prefix("unsubscribe:") {
        broadcaster.leave(room, conn);
        return Some(
            serde_json::json!({
                "event": format!("unsubscribed:{room}"),
                "data": {
                    "success": true,
                    "message": "unsubscribed",
                    "timestamp": Utc::now().timestamp_millis(),
                },
            })
            .to_string(),
        );
    }

    debug!(%conn, event, "unrecognised client event");
    None
}

fn subscribe_ack(room: &str, success: bool, message: &str) -> String {
    serde_json::json!({
        "event": format!("subscribed:{room}"),
        "data": {
            "success": success,
            "message": message,
            "timestamp": Utc::now().timestamp_millis(),
        },
    })
    .to_string()
}
