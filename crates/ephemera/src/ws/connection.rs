//! Per-connection duplex pumps.
//!
//! Each accepted WebSocket gets an opaque id and a pair of tasks: an
//! inbound pump that decodes frames and turns typing events into hub
//! requests, and an outbound pump that is the stream's exclusive writer,
//! draining the mailbox and interleaving keepalive pings. Any read or
//! write failure tears down that one connection and nothing else.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use uuid::Uuid;

use ephemera_protocol::{ClientMessage, MAX_COMPOSITION_CHARS, ServerMessage};

use super::hub::{Hub, MAILBOX_CAPACITY, Mailbox};
use crate::api::state::AppState;

/// Largest accepted inbound frame, in bytes. Exceeding it is a transport
/// error, which drops the connection.
pub const MAX_FRAME_SIZE: usize = 8192;

/// How often the outbound pump pings the peer.
const PING_PERIOD: Duration = Duration::from_secs(25);
/// How long the inbound pump waits for any traffic (pongs included)
/// before presuming the peer gone.
const PONG_WAIT: Duration = Duration::from_secs(75);
/// Deadline for a single outbound write.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// `GET /connect` — validate the origin, then upgrade and run the pumps.
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !origin_is_allowed(&headers, &state.allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

/// Exact-match check of the `Origin` header against the configured
/// allow-list. A missing or empty origin is always rejected.
pub fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    !origin.is_empty() && allowed.iter().any(|a| a == origin)
}

async fn handle_socket(socket: WebSocket, hub: Hub) {
    let id = Uuid::new_v4().to_string();
    let (mailbox, slot) = mpsc::channel::<Utf8Bytes>(MAILBOX_CAPACITY);
    let (sink, stream) = socket.split();

    hub.admit(&id, mailbox.clone()).await;

    let mut writer = tokio::spawn(write_pump(sink, slot, id.clone()));

    // Either pump stopping is fatal to the whole connection. If the
    // outbound pump hits a write failure first, the inbound pump is
    // abandoned (dropping the read half tears the stream down) and the
    // connection is unregistered just the same. Otherwise read_pump owns
    // the reply handle and drops it on return, so eviction closes the
    // mailbox and the write pump winds down.
    let writer_done = tokio::select! {
        _ = read_pump(stream, &id, &hub, mailbox) => false,
        _ = &mut writer => true,
    };

    hub.evict(&id).await;
    if !writer_done {
        let _ = writer.await;
    }
    info!("connection {id} closed");
}

/// Inbound pump: decode frames, dispatch typing events, enforce liveness.
///
/// The per-read timeout is the read deadline; any inbound frame refreshes
/// it. Exiting this loop is the only path to unregistration.
async fn read_pump(mut stream: SplitStream<WebSocket>, id: &str, hub: &Hub, replies: Mailbox) {
    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                warn!("connection {id}: no traffic within {PONG_WAIT:?}, presuming peer gone");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!("connection {id}: read error: {err}");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => dispatch(text.as_str(), id, hub, &replies).await,
            Message::Close(_) => break,
            // Pings are answered by the transport layer; pongs and binary
            // frames only count as liveness, which the timeout already saw.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }
}

/// Outbound pump: the exclusive writer to the transport stream.
///
/// Drains the mailbox and fires keepalive pings. A closed mailbox means
/// the hub evicted this connection: send a close frame and stop. A failed
/// or timed-out write means the peer is gone: just stop.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut slot: mpsc::Receiver<Utf8Bytes>,
    id: String,
) {
    let mut keepalive = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            item = slot.recv() => match item {
                Some(frame) => {
                    if send_frame(&mut sink, Message::Text(frame), &id).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = send_frame(&mut sink, Message::Close(None), &id).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if send_frame(&mut sink, Message::Ping(Bytes::new()), &id).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    id: &str,
) -> Result<(), ()> {
    match timeout(WRITE_WAIT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!("connection {id}: write failed: {err}");
            Err(())
        }
        Err(_) => {
            debug!("connection {id}: write timed out after {WRITE_WAIT:?}");
            Err(())
        }
    }
}

/// Decode one text frame. A malformed frame or unknown discriminator is
/// logged and ignored; it never aborts the connection.
async fn dispatch(raw: &str, id: &str, hub: &Hub, replies: &Mailbox) {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(msg) => handle_client_message(msg, id, hub, replies).await,
        Err(err) => warn!("connection {id}: ignoring malformed frame: {err}"),
    }
}

pub(crate) async fn handle_client_message(
    msg: ClientMessage,
    id: &str,
    hub: &Hub,
    replies: &Mailbox,
) {
    match msg {
        ClientMessage::Hello => {
            let ack = ServerMessage::HelloAck {
                user_id: id.to_string(),
            };
            match serde_json::to_string(&ack) {
                Ok(frame) => {
                    if replies.try_send(frame.into()).is_err() {
                        warn!("connection {id}: mailbox unavailable, dropping hello_ack");
                    }
                }
                Err(err) => warn!("connection {id}: failed to encode hello_ack: {err}"),
            }
        }
        ClientMessage::TypingStart { composition_id } => {
            let update = ServerMessage::TypingState {
                from_user_id: id.to_string(),
                composition_id,
                seq: 0,
                text: String::new(),
                ts: now_ms(),
            };
            hub.broadcast(&update, Some(id)).await;
        }
        ClientMessage::TypingUpdate {
            composition_id,
            seq,
            text,
        } => {
            let chars = text.chars().count();
            if chars > MAX_COMPOSITION_CHARS {
                warn!("connection {id}: typing_update too long ({chars} chars), dropping");
                return;
            }
            let update = ServerMessage::TypingState {
                from_user_id: id.to_string(),
                composition_id,
                seq,
                text,
                ts: now_ms(),
            };
            hub.broadcast(&update, Some(id)).await;
        }
        ClientMessage::TypingEnd {
            composition_id,
            final_text,
            ttl_ms,
        } => {
            let end = ServerMessage::TypingEnd {
                from_user_id: id.to_string(),
                composition_id,
                final_text,
                ts: now_ms(),
                ttl_ms,
            };
            hub.broadcast(&end, Some(id)).await;
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const RECV_WAIT: Duration = Duration::from_secs(1);
    const QUIET_WAIT: Duration = Duration::from_millis(100);

    async fn recv_json(slot: &mut mpsc::Receiver<Utf8Bytes>) -> Value {
        let frame = timeout(RECV_WAIT, slot.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("mailbox closed");
        serde_json::from_str(frame.as_str()).expect("frame is not valid JSON")
    }

    async fn assert_quiet(slot: &mut mpsc::Receiver<Utf8Bytes>) {
        assert!(
            timeout(QUIET_WAIT, slot.recv()).await.is_err(),
            "expected no frame"
        );
    }

    /// Two admitted connections with drained presence snapshots.
    async fn two_clients(
        hub: &Hub,
    ) -> (
        Mailbox,
        mpsc::Receiver<Utf8Bytes>,
        Mailbox,
        mpsc::Receiver<Utf8Bytes>,
    ) {
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.admit("alice", tx_a.clone()).await;
        hub.admit("bob", tx_b.clone()).await;
        recv_json(&mut rx_a).await;
        recv_json(&mut rx_a).await;
        recv_json(&mut rx_b).await;
        (tx_a, rx_a, tx_b, rx_b)
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["http://localhost:3000".to_string()];

        let mut headers = HeaderMap::new();
        assert!(!origin_is_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, "".parse().unwrap());
        assert!(!origin_is_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, "http://evil.example".parse().unwrap());
        assert!(!origin_is_allowed(&headers, &allowed));

        // Prefix match is not enough; the comparison is exact.
        headers.insert(
            header::ORIGIN,
            "http://localhost:3000.evil.example".parse().unwrap(),
        );
        assert!(!origin_is_allowed(&headers, &allowed));

        headers.insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        assert!(origin_is_allowed(&headers, &allowed));

        assert!(!origin_is_allowed(&headers, &[]));
    }

    #[tokio::test]
    async fn test_hello_acks_sender_only() {
        let hub = Hub::new();
        let (tx_a, mut rx_a, _tx_b, mut rx_b) = two_clients(&hub).await;

        handle_client_message(ClientMessage::Hello, "alice", &hub, &tx_a).await;

        let ack = recv_json(&mut rx_a).await;
        assert_eq!(ack["type"], "hello_ack");
        assert_eq!(ack["userId"], "alice");
        assert_quiet(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_typing_start_relays_empty_state() {
        let hub = Hub::new();
        let (tx_a, mut rx_a, _tx_b, mut rx_b) = two_clients(&hub).await;

        handle_client_message(
            ClientMessage::TypingStart {
                composition_id: "c-1".to_string(),
            },
            "alice",
            &hub,
            &tx_a,
        )
        .await;

        let state = recv_json(&mut rx_b).await;
        assert_eq!(state["type"], "typing_state");
        assert_eq!(state["fromUserId"], "alice");
        assert_eq!(state["compositionId"], "c-1");
        assert_eq!(state["seq"], 0);
        assert_eq!(state["text"], "");
        assert!(state["ts"].is_i64());
        assert_quiet(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_typing_update_relayed_to_peer_not_sender() {
        let hub = Hub::new();
        let (tx_a, mut rx_a, _tx_b, mut rx_b) = two_clients(&hub).await;

        handle_client_message(
            ClientMessage::TypingUpdate {
                composition_id: "c-1".to_string(),
                seq: 1,
                text: "g".to_string(),
            },
            "alice",
            &hub,
            &tx_a,
        )
        .await;

        let state = recv_json(&mut rx_b).await;
        assert_eq!(state["type"], "typing_state");
        assert_eq!(state["fromUserId"], "alice");
        assert_eq!(state["text"], "g");
        assert_eq!(state["seq"], 1);
        assert_quiet(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_oversized_typing_update_produces_no_broadcast() {
        let hub = Hub::new();
        let (tx_a, _rx_a, _tx_b, mut rx_b) = two_clients(&hub).await;

        handle_client_message(
            ClientMessage::TypingUpdate {
                composition_id: "c-1".to_string(),
                seq: 1,
                text: "x".repeat(MAX_COMPOSITION_CHARS + 1),
            },
            "alice",
            &hub,
            &tx_a,
        )
        .await;

        // Exactly at the ceiling is still accepted; the next frame bob sees
        // must be this one, proving the oversized update never went out.
        handle_client_message(
            ClientMessage::TypingUpdate {
                composition_id: "c-1".to_string(),
                seq: 2,
                text: "y".repeat(MAX_COMPOSITION_CHARS),
            },
            "alice",
            &hub,
            &tx_a,
        )
        .await;

        let state = recv_json(&mut rx_b).await;
        assert_eq!(state["seq"], 2);
        assert_quiet(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let hub = Hub::new();
        let (tx_a, _rx_a, _tx_b, mut rx_b) = two_clients(&hub).await;

        dispatch("{ not json", "alice", &hub, &tx_a).await;
        dispatch(r#"{"type":"shout","text":"hi"}"#, "alice", &hub, &tx_a).await;
        dispatch(
            r#"{"type":"typing_end","compositionId":"c-1"}"#,
            "alice",
            &hub,
            &tx_a,
        )
        .await;

        let end = recv_json(&mut rx_b).await;
        assert_eq!(end["type"], "typing_end");
        assert_eq!(end["fromUserId"], "alice");
        assert!(end.get("finalText").is_none());
        assert_quiet(&mut rx_b).await;
    }
}
