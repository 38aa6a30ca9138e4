//! Envelope validation and dispatch.
//!
//! One dispatcher task drains the inbound frame channel, which keeps
//! forwarding order-preserving per sender. The relay holds no negotiation
//! state of its own: offers, answers and candidates are routed by `kind`
//! and otherwise passed through verbatim.

use std::sync::Arc;

use tokio::sync::mpsc;

use relayer_core::errors::ErrorClass;
use relayer_core::protocol::decode_client;
use relayer_core::{
    ClientEnvelope, ConnectionId, Decoded, RawEnvelope, RelayError, RoomId, ServerEnvelope,
};
use relayer_telemetry::RelayMetrics;

use crate::connection::ConnectionRegistry;
use crate::rooms::RoomDirectory;

/// Shared relay state handed to every connection task. Owned by the server
/// for the process lifetime; nothing outside the relay mutates the
/// registries.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomDirectory>,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayState {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(max_send_queue)),
            rooms: Arc::new(RoomDirectory::new()),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }
}

/// Process inbound frames from all connections, in receipt order.
pub async fn process_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    relay: RelayState,
) {
    while let Some((conn_id, text)) = rx.recv().await {
        relay.metrics.messages_received.increment();
        dispatch(&relay, &conn_id, &text);
    }
    tracing::info!("message channel closed, dispatcher stopping");
}

/// Validate and route one inbound text frame.
pub fn dispatch(relay: &RelayState, sender: &ConnectionId, text: &str) {
    // Frames can still be queued behind a connection's teardown; acting on
    // them would resurrect its room membership. Drop them instead.
    match relay.registry.lookup(sender) {
        Some(conn) if conn.is_connected() => {}
        _ => {
            tracing::debug!(conn_id = %sender, "dropping frame from disconnected client");
            return;
        }
    }

    let decoded = match decode_client(text) {
        Ok(decoded) => decoded,
        Err(err) => {
            reject(relay, sender, err);
            return;
        }
    };

    match decoded {
        Decoded::Known(envelope) => match envelope {
            ClientEnvelope::Join { room } => handle_join(relay, sender, room),
            ClientEnvelope::LeaveRoom => handle_leave(relay, sender),
            ClientEnvelope::Offer { to, sdp } => {
                handle_forward(relay, sender, to, |from| ServerEnvelope::Offer { from, sdp })
            }
            ClientEnvelope::Answer { to, sdp } => {
                handle_forward(relay, sender, to, |from| ServerEnvelope::Answer { from, sdp })
            }
            ClientEnvelope::IceCandidate { to, candidate } => {
                handle_forward(relay, sender, to, |from| ServerEnvelope::IceCandidate {
                    from,
                    candidate,
                })
            }
            ClientEnvelope::Ping => {
                relay.registry.send(sender, ServerEnvelope::Pong);
            }
        },
        Decoded::Unknown(raw) => handle_unknown(relay, sender, raw),
    }
}

fn handle_join(relay: &RelayState, sender: &ConnectionId, room: Option<String>) {
    // A missing or empty room name falls back to the default room.
    let room = RoomId::new(match room {
        Some(name) if !name.is_empty() => name,
        _ => RoomId::DEFAULT.to_string(),
    });
    let outcome = relay.rooms.join(&room, sender);

    // The implicit leave: tell any prior room this peer is gone.
    for left in &outcome.left_rooms {
        broadcast_to_room(
            relay,
            left,
            Some(sender),
            ServerEnvelope::UserLeft {
                peer_id: sender.clone(),
            },
        );
    }

    if outcome.was_first_member {
        tracing::debug!(room = %room, "room created");
    }

    relay.registry.send(
        sender,
        ServerEnvelope::ExistingUsers {
            peers: outcome.existing_peers,
        },
    );
    broadcast_to_room(
        relay,
        &room,
        Some(sender),
        ServerEnvelope::NewUser {
            peer_id: sender.clone(),
        },
    );

    relay.metrics.rooms_active.set(relay.rooms.room_count() as i64);
    tracing::debug!(conn_id = %sender, room = %room, "joined room");
}

fn handle_leave(relay: &RelayState, sender: &ConnectionId) {
    let Some(room) = relay.rooms.room_of(sender) else {
        reject(relay, sender, RelayError::NotInAnyRoom);
        return;
    };

    if relay.rooms.leave(&room, sender) {
        broadcast_to_room(
            relay,
            &room,
            Some(sender),
            ServerEnvelope::UserLeft {
                peer_id: sender.clone(),
            },
        );
    }

    relay.metrics.rooms_active.set(relay.rooms.room_count() as i64);
    tracing::debug!(conn_id = %sender, room = %room, "left room");
}

fn handle_forward(
    relay: &RelayState,
    sender: &ConnectionId,
    to: Option<ConnectionId>,
    build: impl FnOnce(ConnectionId) -> ServerEnvelope,
) {
    let Some(room) = relay.rooms.room_of(sender) else {
        reject(relay, sender, RelayError::NotJoined);
        return;
    };
    let Some(to) = to else {
        reject(relay, sender, RelayError::MissingRecipient);
        return;
    };
    // Cross-room forwarding is forbidden: the recipient must share the
    // sender's room.
    if !relay.rooms.is_member(&room, &to) {
        reject(relay, sender, RelayError::RecipientNotInRoom);
        return;
    }

    let envelope = build(sender.clone());
    if !relay.registry.send(&to, envelope) {
        relay.metrics.delivery_failures.increment();
        reject(relay, sender, RelayError::RecipientNotConnected);
        return;
    }

    relay.metrics.messages_forwarded.increment();
}

fn handle_unknown(relay: &RelayState, sender: &ConnectionId, raw: RawEnvelope) {
    tracing::debug!(conn_id = %sender, kind = %raw.kind, "echoing unrecognized kind");
    let timestamp = chrono::Utc::now().timestamp_millis();
    relay
        .registry
        .send(sender, ServerEnvelope::echo(&raw, timestamp));
}

/// Surface a validation/routing failure to the sender as an `error`
/// envelope. The connection stays open.
fn reject(relay: &RelayState, sender: &ConnectionId, err: RelayError) {
    match err.class() {
        ErrorClass::Validation => {
            relay.metrics.validation_errors.increment();
            tracing::warn!(conn_id = %sender, kind = err.error_kind(), "invalid frame: {err}");
        }
        ErrorClass::Routing => {
            relay.metrics.routing_errors.increment();
            tracing::debug!(conn_id = %sender, kind = err.error_kind(), "unroutable frame: {err}");
        }
        ErrorClass::Transport | ErrorClass::Invariant => {
            tracing::error!(conn_id = %sender, kind = err.error_kind(), "{err}");
        }
    }
    if err.is_reportable() {
        relay
            .registry
            .send(sender, ServerEnvelope::error(err.to_string()));
    }
}

/// Send an envelope to every member of a room, optionally excluding one
/// connection. Returns the number of queued deliveries.
pub fn broadcast_to_room(
    relay: &RelayState,
    room: &RoomId,
    exclude: Option<&ConnectionId>,
    envelope: ServerEnvelope,
) -> usize {
    let members = relay.rooms.members(room, exclude);
    let mut delivered = 0;
    for member in &members {
        if relay.registry.send(member, envelope.clone()) {
            delivered += 1;
        } else {
            relay.metrics.delivery_failures.increment();
            tracing::warn!(room = %room, conn_id = %member, "broadcast delivery failed");
        }
    }
    relay.metrics.broadcasts_sent.increment();
    delivered
}

/// Tear down a disconnected connection: leave every room, notify the
/// remaining members, then drop the registry entry. Safe to call from
/// racing triggers; only the first caller does any work.
pub fn disconnect_cleanup(relay: &RelayState, conn_id: &ConnectionId) {
    let Some(conn) = relay.registry.lookup(conn_id) else {
        return;
    };
    if !conn.begin_close() {
        return;
    }

    let affected = relay.rooms.leave_all(conn_id);
    for room in &affected {
        broadcast_to_room(
            relay,
            room,
            Some(conn_id),
            ServerEnvelope::UserLeft {
                peer_id: conn_id.clone(),
            },
        );
    }

    relay.registry.unregister(conn_id);
    relay.metrics.connections_active.decrement();
    relay.metrics.rooms_active.set(relay.rooms.room_count() as i64);

    tracing::info!(conn_id = %conn_id, rooms_left = affected.len(), "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn conn(s: &str) -> ConnectionId {
        ConnectionId::from_raw(s)
    }

    fn setup() -> RelayState {
        RelayState::new(32)
    }

    fn add(relay: &RelayState, name: &str) -> Receiver<ServerEnvelope> {
        relay.registry.register(conn(name)).unwrap()
    }

    fn join(relay: &RelayState, name: &str, room: &str) {
        dispatch(
            relay,
            &conn(name),
            &format!(r#"{{"kind":"join","payload":{{"room":"{room}"}}}}"#),
        );
    }

    fn drain(rx: &mut Receiver<ServerEnvelope>) -> Vec<ServerEnvelope> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env);
        }
        out
    }

    #[test]
    fn join_sequence_replies_and_broadcasts() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        let mut rx_c = add(&relay, "c");

        join(&relay, "a", "r1");
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::ExistingUsers { peers: vec![] }]
        );

        join(&relay, "b", "r1");
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::ExistingUsers {
                peers: vec![conn("a")]
            }]
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::NewUser { peer_id: conn("b") }]
        );

        join(&relay, "c", "r1");
        let c_msgs = drain(&mut rx_c);
        assert_eq!(c_msgs.len(), 1);
        match &c_msgs[0] {
            ServerEnvelope::ExistingUsers { peers } => {
                let mut peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
                peers.sort_unstable();
                assert_eq!(peers, vec!["a", "b"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::NewUser { peer_id: conn("c") }]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::NewUser { peer_id: conn("c") }]
        );
    }

    #[test]
    fn join_default_room_when_name_omitted() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), r#"{"kind":"join"}"#);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::ExistingUsers { peers: vec![] }]
        );
        assert!(relay.rooms.is_member(&"default".into(), &conn("a")));
    }

    #[test]
    fn join_empty_room_name_uses_the_default() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), r#"{"kind":"join","payload":{"room":""}}"#);
        drain(&mut rx_a);
        assert!(relay.rooms.is_member(&"default".into(), &conn("a")));
    }

    #[test]
    fn joining_another_room_notifies_the_old_one() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");

        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        join(&relay, "a", "r2");
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::UserLeft { peer_id: conn("a") }]
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::ExistingUsers { peers: vec![] }]
        );
        assert!(relay.rooms.is_member(&"r2".into(), &conn("a")));
        assert!(!relay.rooms.is_member(&"r1".into(), &conn("a")));
    }

    #[test]
    fn rejoining_the_same_room_cycles_membership_notifications() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");

        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        join(&relay, "a", "r1");
        assert_eq!(
            drain(&mut rx_b),
            vec![
                ServerEnvelope::UserLeft { peer_id: conn("a") },
                ServerEnvelope::NewUser { peer_id: conn("a") },
            ]
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::ExistingUsers {
                peers: vec![conn("b")]
            }]
        );
    }

    #[test]
    fn offer_is_forwarded_verbatim_with_from_stamped() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(
            &relay,
            &conn("a"),
            r#"{"kind":"offer","payload":{"to":"b","sdp":"X"}}"#,
        );

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::Offer {
                from: conn("a"),
                sdp: serde_json::json!("X"),
            }]
        );
        // No reply to the sender on success
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(relay.metrics.messages_forwarded.get(), 1);
    }

    #[test]
    fn answer_and_candidate_are_forwarded() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(
            &relay,
            &conn("b"),
            r#"{"kind":"answer","payload":{"to":"a","sdp":{"type":"answer"}}}"#,
        );
        dispatch(
            &relay,
            &conn("b"),
            r#"{"kind":"ice-candidate","payload":{"to":"a","candidate":{"sdpMid":"0"}}}"#,
        );

        let msgs = drain(&mut rx_a);
        assert_eq!(
            msgs,
            vec![
                ServerEnvelope::Answer {
                    from: conn("b"),
                    sdp: serde_json::json!({"type": "answer"}),
                },
                ServerEnvelope::IceCandidate {
                    from: conn("b"),
                    candidate: serde_json::json!({"sdpMid": "0"}),
                },
            ]
        );
    }

    #[test]
    fn forward_before_joining_any_room() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(
            &relay,
            &conn("a"),
            r#"{"kind":"offer","payload":{"to":"b","sdp":"X"}}"#,
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Must join a room first")]
        );
    }

    #[test]
    fn forward_without_recipient() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        join(&relay, "a", "r1");
        drain(&mut rx_a);

        dispatch(&relay, &conn("a"), r#"{"kind":"offer","payload":{"sdp":"X"}}"#);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Recipient ID required for signaling")]
        );
    }

    #[test]
    fn cross_room_forwarding_is_forbidden() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r2");
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(
            &relay,
            &conn("a"),
            r#"{"kind":"offer","payload":{"to":"b","sdp":"X"}}"#,
        );

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Recipient not in same room")]
        );
        // Nothing is delivered to the recipient
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(relay.metrics.routing_errors.get(), 1);
    }

    #[test]
    fn forward_to_member_whose_transport_is_gone() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let _rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);

        // Registry entry vanished but the directory still lists the member
        relay.registry.unregister(&conn("b"));

        dispatch(
            &relay,
            &conn("a"),
            r#"{"kind":"offer","payload":{"to":"b","sdp":"X"}}"#,
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Recipient not connected")]
        );
    }

    #[test]
    fn leave_room_broadcasts_user_left() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(&relay, &conn("a"), r#"{"kind":"leave-room"}"#);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::UserLeft { peer_id: conn("a") }]
        );
        assert!(drain(&mut rx_a).is_empty());
        assert!(!relay.rooms.is_member(&"r1".into(), &conn("a")));
    }

    #[test]
    fn leave_room_without_membership() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), r#"{"kind":"leave-room"}"#);
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Not in any room")]
        );
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), r#"{"kind":"ping"}"#);
        assert_eq!(drain(&mut rx_a), vec![ServerEnvelope::Pong]);
    }

    #[test]
    fn unknown_kind_is_echoed_with_timestamp() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), r#"{"kind":"mystery","payload":{"x":1}}"#);
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerEnvelope::Echo(value) => {
                assert_eq!(value["kind"], "mystery");
                assert_eq!(value["payload"]["x"], 1);
                assert!(value["timestamp"].is_i64());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_is_rejected() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");

        dispatch(&relay, &conn("a"), "{{{nope");
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEnvelope::error("Invalid JSON message")]
        );
        assert_eq!(relay.metrics.validation_errors.get(), 1);
    }

    #[test]
    fn schema_violation_is_rejected() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        join(&relay, "a", "r1");
        drain(&mut rx_a);

        dispatch(&relay, &conn("a"), r#"{"kind":"offer","payload":{"to":"b"}}"#);
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ServerEnvelope::Error { message } => {
                assert!(message.starts_with("Validation failed:"), "got: {message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn frames_from_unknown_connections_are_dropped() {
        let relay = setup();
        dispatch(
            &relay,
            &conn("ghost"),
            r#"{"kind":"join","payload":{"room":"r1"}}"#,
        );
        assert_eq!(relay.rooms.room_count(), 0);
    }

    #[test]
    fn disconnect_broadcasts_user_left_to_remaining_member() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        disconnect_cleanup(&relay, &conn("a"));

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::UserLeft { peer_id: conn("a") }]
        );
        assert_eq!(relay.registry.count(), 1);
        assert!(relay.rooms.is_member(&"r1".into(), &conn("b")));

        // The room disappears once the last member leaves too
        dispatch(&relay, &conn("b"), r#"{"kind":"leave-room"}"#);
        assert_eq!(relay.rooms.room_count(), 0);
    }

    #[test]
    fn disconnect_cleanup_is_idempotent() {
        let relay = setup();
        let mut rx_a = add(&relay, "a");
        let mut rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.metrics.connections_active.set(2);

        // Simulate a read-error/idle-timeout race
        disconnect_cleanup(&relay, &conn("a"));
        disconnect_cleanup(&relay, &conn("a"));

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEnvelope::UserLeft { peer_id: conn("a") }]
        );
        assert_eq!(relay.metrics.connections_active.get(), 1);
    }

    #[test]
    fn broadcast_counts_only_live_deliveries() {
        let relay = setup();
        let _rx_a = add(&relay, "a");
        let rx_b = add(&relay, "b");
        join(&relay, "a", "r1");
        join(&relay, "b", "r1");

        drop(rx_b); // b's writer is gone

        let delivered = broadcast_to_room(
            &relay,
            &"r1".into(),
            None,
            ServerEnvelope::Pong,
        );
        assert_eq!(delivered, 1);
        assert_eq!(relay.metrics.delivery_failures.get(), 1);
    }
}
