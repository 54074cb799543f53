//! WebSocket transport
//!
//! Clients send JSON requests and receive replies tagged with the request id:
//!
//! ```text
//! -> {"id": 7, "endpoint": "get-state", "data": {"device_id": "arm"}}
//! <- {"id": 7, "success": true, "response": "{\"position\":0.0}"}
//! ```
//!
//! Program output and device changes are broadcast to every client as
//! `{"type": "log", ...}` and `{"type": "device_update", ...}` messages.

use super::traits::{Transport, TransportContext};
use super::{pump_changes, ChangeFeed};
use crate::command::PendingResult;
use crate::events::{DeviceNotifier, OutputSink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use robot_link_shared::{Command, CommandResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Default listen address
pub const DEFAULT_ADDR: &str = "0.0.0.0:5467";

/// Broadcast events buffered per slow client before it starts lagging
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    endpoint: String,
    #[serde(default)]
    data: Value,
}

/// How to answer one client message
#[derive(Debug)]
enum Inbound {
    /// Answered on the spot
    Reply(Value),
    /// Goes through the dispatcher queue
    Dispatch { id: Value, command: Command },
}

pub fn log_event(log_type: &str, line: &str) -> Value {
    json!({ "type": "log", "log_type": log_type, "message": line })
}

pub fn device_event(device_id: &str, state: Value) -> Value {
    let mut states = Map::new();
    states.insert(device_id.to_string(), state);
    json!({ "type": "device_update", "state": states })
}

fn response(id: Value, result: &CommandResult) -> Value {
    json!({ "id": id, "success": result.success, "response": result.response.to_text() })
}

/// WebSocket server bridging clients to the dispatcher
pub struct WebSocketTransport {
    addr: String,
    ctx: TransportContext,
    events: broadcast::Sender<String>,
    changes: ChangeFeed,
}

impl WebSocketTransport {
    pub fn new(addr: impl Into<String>, ctx: TransportContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            addr: addr.into(),
            ctx,
            events,
            changes: ChangeFeed::new(),
        }
    }

    /// Send an event to every connected client
    fn broadcast(&self, event: Value) {
        // No receivers just means no clients
        let _ = self.events.send(event.to_string());
    }

    fn classify(&self, text: &str) -> Inbound {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                return Inbound::Reply(json!({
                    "id": Value::Null,
                    "success": false,
                    "response": format!("Invalid request: {}", e),
                }))
            }
        };

        match request.endpoint.as_str() {
            "heartbeat" => {
                self.ctx.supervisor.beat();
                Inbound::Reply(json!({ "id": request.id, "type": "heartbeat", "success": true }))
            }
            "name" => Inbound::Reply(json!({
                "id": request.id,
                "type": "name",
                "success": true,
                "response": self.ctx.projects.name(),
            })),
            _ => Inbound::Dispatch {
                id: request.id,
                command: Command::from_parts(request.endpoint, request.data),
            },
        }
    }

    /// Serve clients on an already bound listener
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Some(rx) = self.changes.take() {
            let this = self.clone();
            tokio::spawn(async move {
                let devices = this.ctx.devices.clone();
                pump_changes(rx, devices, |id, state| this.broadcast(device_event(id, state))).await;
            });
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer).await {
                            warn!("[WS] Client {} error: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("[WS] Accept error: {}", e),
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .with_context(|| format!("handshake from {}", peer))?;
        info!("[WS] Client connected: {}", peer);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut events = self.events.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Value>();

        // Replies are resolved in submission order off the read loop
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<(Value, PendingResult)>();
        let resolver = tokio::spawn(async move {
            while let Some((id, pending)) = pending_rx.recv().await {
                let result = pending.wait().await;
                if reply_tx.send(response(id, &result)).is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await?,
                    Err(RecvError::Lagged(n)) => warn!("[WS] Client {} lagged by {} events", peer, n),
                    Err(RecvError::Closed) => break,
                },
                Some(reply) = reply_rx.recv() => {
                    ws_tx.send(Message::Text(reply.to_string().into())).await?;
                }
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.classify(text.as_str()) {
                        Inbound::Reply(reply) => {
                            ws_tx.send(Message::Text(reply.to_string().into())).await?;
                        }
                        // Queued in arrival order; the reply is awaited elsewhere so
                        // heartbeats keep flowing while a command runs
                        Inbound::Dispatch { id, command } => {
                            let pending = self.ctx.dispatcher.submit(command).await;
                            let _ = pending_tx.send((id, pending));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("[WS] Read error from {}: {}", peer, e);
                        break;
                    }
                    _ => {}
                }
            }
        }

        resolver.abort();
        info!("[WS] Client disconnected: {}", peer);
        Ok(())
    }
}

impl OutputSink for WebSocketTransport {
    fn on_stdout(&self, line: &str) {
        self.broadcast(log_event("stdout", line));
    }

    fn on_stderr(&self, line: &str) {
        self.broadcast(log_event("stderr", line));
    }
}

impl DeviceNotifier for WebSocketTransport {
    fn on_device_changed(&self, device_id: &str) {
        self.changes.push(device_id);
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "WebSocket"
    }

    async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        info!("[WS] Listening on {}", self.addr);
        self.serve_listener(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::transport::testing;
    use tokio_tungstenite::connect_async;

    fn transport(root: &std::path::Path) -> Arc<WebSocketTransport> {
        let hub = Arc::new(EventHub::new());
        let transport = Arc::new(WebSocketTransport::new(
            "127.0.0.1:0",
            testing::context(root, hub.clone()),
        ));
        hub.add_sink(transport.clone());
        hub.add_notifier(transport.clone());
        transport
    }

    #[tokio::test]
    async fn test_classify_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ws = transport(dir.path());

        match ws.classify(r#"{"id": 1, "endpoint": "heartbeat"}"#) {
            Inbound::Reply(reply) => {
                assert_eq!(reply, json!({"id": 1, "type": "heartbeat", "success": true}))
            }
            other => panic!("unexpected {:?}", other),
        }

        match ws.classify(r#"{"id": "n", "endpoint": "name"}"#) {
            Inbound::Reply(reply) => assert_eq!(reply["response"], "rover"),
            other => panic!("unexpected {:?}", other),
        }

        match ws.classify(r#"{"id": 2, "endpoint": "get-state", "data": {"device_id": "lamp"}}"#) {
            Inbound::Dispatch { id, command } => {
                assert_eq!(id, json!(2));
                assert_eq!(command.str_arg("device_id"), Some("lamp"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match ws.classify("not json") {
            Inbound::Reply(reply) => assert_eq!(reply["success"], false),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_shapes() {
        assert_eq!(
            device_event("lamp", json!({"active": true})),
            json!({"type": "device_update", "state": {"lamp": {"active": true}}})
        );
        assert_eq!(
            log_event("stderr", "boom\n"),
            json!({"type": "log", "log_type": "stderr", "message": "boom\n"})
        );
    }

    async fn next_json<S>(client: &mut S) -> Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = client.next().await.unwrap().unwrap() {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let ws = transport(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(ws.clone().serve_listener(listener));

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        let request = json!({"id": 1, "endpoint": "list-projects"}).to_string();
        client.send(Message::Text(request.into())).await.unwrap();
        assert_eq!(
            next_json(&mut client).await,
            json!({"id": 1, "success": true, "response": "demo"})
        );

        ws.on_stdout("hello\n");
        assert_eq!(next_json(&mut client).await, log_event("stdout", "hello\n"));

        // Loading the model broadcasts every device
        let request = json!({"id": 2, "endpoint": "tinker"}).to_string();
        client.send(Message::Text(request.into())).await.unwrap();

        let mut saw_reply = false;
        let mut saw_update = false;
        while !(saw_reply && saw_update) {
            let msg = next_json(&mut client).await;
            if msg["id"] == 2 {
                assert_eq!(msg["success"], true);
                saw_reply = true;
            } else if msg["type"] == "device_update" {
                assert_eq!(msg["state"]["lamp"], json!({"active": false}));
                saw_update = true;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commands_from_one_client_keep_their_order() {
        let dir = tempfile::tempdir().unwrap();
        let ws = transport(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(ws.clone().serve_listener(listener));

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        const COUNT: u64 = 200;
        for i in 0..COUNT {
            let request = json!({
                "id": i,
                "endpoint": "change-target",
                "data": {"target_name": format!("t{}.py", i)},
            });
            client.send(Message::Text(request.to_string().into())).await.unwrap();
        }
        let request = json!({"id": COUNT, "endpoint": "get-target"}).to_string();
        client.send(Message::Text(request.into())).await.unwrap();

        let mut ids = Vec::new();
        let mut last = Value::Null;
        while ids.len() as u64 <= COUNT {
            let msg = next_json(&mut client).await;
            if let Some(id) = msg["id"].as_u64() {
                assert_eq!(msg["success"], true, "{}", msg);
                ids.push(id);
                last = msg;
            }
        }

        assert_eq!(ids, (0..=COUNT).collect::<Vec<_>>());
        assert_eq!(last["response"], format!("t{}.py", COUNT - 1));
    }
}
