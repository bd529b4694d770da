#![forbid(unsafe_code)]

// Join-path authorization: password gate, lock gate, creator bypass and the
// waiting-room hand-off.

use super::connection::{send_error, Binding};
use crate::room::{
    normalize_room_id, OutboundSender, RegistryError, RoomRegistry, WaitingParticipant,
};
use crate::signaling::protocol::{now_ms, ErrorCode};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_PARTICIPANT_NAME_LEN: usize = 64;

/// What the join gate decided for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Reject(ErrorCode),
    Wait,
    Admit { as_host: bool, as_creator: bool },
}

/// The admission rules, free of any socket or registry handle.
///
/// `creator` means the presented token validated against the room;
/// `has_token` that one was presented at all (a token holder may be racing
/// room creation, so they are not turned away for a missing room).
pub fn evaluate(
    room_exists: bool,
    password_ok: bool,
    locked: bool,
    creator: bool,
    is_host: bool,
    has_token: bool,
) -> JoinDecision {
    if !room_exists && !is_host && !has_token {
        return JoinDecision::Reject(ErrorCode::RoomNotFound);
    }
    if room_exists && !password_ok {
        return JoinDecision::Reject(ErrorCode::InvalidPassword);
    }
    if room_exists && locked && !creator {
        return JoinDecision::Wait;
    }
    JoinDecision::Admit {
        as_host: is_host,
        as_creator: creator,
    }
}

/// Runs the full join flow for one connection. On success the connection is
/// bound to the new participant (or waiting candidate); on failure an error
/// envelope is sent and the socket stays open for a retry.
#[allow(clippy::too_many_arguments)]
pub async fn handle_join(
    registry: &Arc<RoomRegistry>,
    tx: &OutboundSender,
    binding: &mut Option<Binding>,
    room_id_raw: &str,
    name: &str,
    password: Option<&str>,
    is_host: bool,
    creator_token: Option<&str>,
) {
    if room_id_raw.trim().is_empty() || room_id_raw.len() > MAX_ROOM_ID_LEN {
        send_error(tx, "Invalid room id", None);
        return;
    }
    if name.is_empty() || name.len() > MAX_PARTICIPANT_NAME_LEN {
        send_error(tx, "Invalid participant name", None);
        return;
    }

    let room_id = normalize_room_id(room_id_raw);

    // A bound connection joining again leaves its current room first.
    if let Some(prev) = binding.take() {
        registry.disconnect(&prev.room_id, &prev.participant_id).await;
    }

    let exists = registry.room_exists(&room_id);
    let password_ok = registry.validate_password(&room_id, password).await;
    let locked = registry.is_room_locked(&room_id).await;
    let creator = match creator_token {
        Some(token) => registry.validate_creator_token(&room_id, token).await,
        None => false,
    };

    match evaluate(
        exists,
        password_ok,
        locked,
        creator,
        is_host,
        creator_token.is_some(),
    ) {
        JoinDecision::Reject(ErrorCode::RoomNotFound) => {
            send_error(tx, "Room not found", Some(ErrorCode::RoomNotFound));
        }
        JoinDecision::Reject(ErrorCode::InvalidPassword) => {
            send_error(
                tx,
                "Invalid room password",
                Some(ErrorCode::InvalidPassword),
            );
        }
        JoinDecision::Wait => {
            enter_waiting_room(registry, tx, binding, &room_id, name).await;
        }
        JoinDecision::Admit { as_host, as_creator } => {
            let participant_id = Uuid::new_v4().to_string();
            // A password supplied at creation becomes the room password.
            let password_on_create = if exists {
                None
            } else {
                password.map(str::to_string)
            };

            let added = registry
                .add_participant(
                    &room_id,
                    participant_id.clone(),
                    name.to_string(),
                    tx.clone(),
                    as_host,
                    as_creator,
                    password_on_create,
                )
                .await;

            match added {
                Ok(()) => {
                    *binding = Some(Binding {
                        room_id,
                        participant_id,
                    });
                }
                // The room locked between the gate check and insertion.
                Err(RegistryError::RoomLocked) => {
                    debug!("Room {} locked during join, diverting to waiting room", room_id);
                    enter_waiting_room(registry, tx, binding, &room_id, name).await;
                }
                Err(RegistryError::RoomFull) => {
                    send_error(tx, "Room is full", None);
                }
                Err(e) => {
                    send_error(tx, e.to_string(), None);
                }
            }
        }
    }
}

async fn enter_waiting_room(
    registry: &Arc<RoomRegistry>,
    tx: &OutboundSender,
    binding: &mut Option<Binding>,
    room_id: &str,
    name: &str,
) {
    let participant_id = Uuid::new_v4().to_string();
    let candidate = WaitingParticipant {
        id: participant_id.clone(),
        name: name.to_string(),
        requested_at: now_ms(),
        sender: tx.clone(),
    };

    match registry.add_to_waiting_room(room_id, candidate).await {
        Ok(()) => {
            *binding = Some(Binding {
                room_id: room_id.to_string(),
                participant_id,
            });
        }
        Err(RegistryError::RoomFull) => {
            send_error(tx, "Room is full", None);
        }
        Err(e) => {
            send_error(tx, e.to_string(), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::room::{Outbound, RoomRegistry};
    use crate::signaling::protocol::{Envelope, MessageBody};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn decision_table() {
        use JoinDecision::*;

        // room exists? / password ok? / locked? / creator? / isHost? / token?
        assert_eq!(
            evaluate(false, true, false, false, false, false),
            Reject(ErrorCode::RoomNotFound)
        );
        assert_eq!(
            evaluate(false, true, false, false, true, false),
            Admit { as_host: true, as_creator: false }
        );
        assert_eq!(
            evaluate(true, false, false, false, false, false),
            Reject(ErrorCode::InvalidPassword)
        );
        assert_eq!(
            evaluate(true, true, false, false, false, false),
            Admit { as_host: false, as_creator: false }
        );
        assert_eq!(evaluate(true, true, true, false, false, false), Wait);
        assert_eq!(
            evaluate(true, true, true, true, false, true),
            Admit { as_host: false, as_creator: true }
        );
        // A token holder is not rejected for a missing room.
        assert_eq!(
            evaluate(false, true, false, false, false, true),
            Admit { as_host: false, as_creator: false }
        );
    }

    fn registry() -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(
            None,
            10,
            Duration::from_secs(24 * 3600),
            ServerMetrics::new(),
        ))
    }

    fn channel() -> (OutboundSender, mpsc::Receiver<Outbound>) {
        mpsc::channel(64)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Frame(json) = frame {
                out.push(serde_json::from_str(&json).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn join_unknown_room_without_host_flag_is_rejected() {
        let reg = registry();
        let (tx, mut rx) = channel();
        let mut binding = None;

        handle_join(&reg, &tx, &mut binding, "NOPE01", "Eve", None, false, None).await;

        assert!(binding.is_none());
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].body {
            MessageBody::Error { message, code } => {
                assert_eq!(message, "Room not found");
                assert_eq!(*code, Some(ErrorCode::RoomNotFound));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(!reg.room_exists("NOPE01"));
    }

    #[tokio::test]
    async fn first_host_join_creates_room_with_password() {
        let reg = registry();
        let (tx, mut rx) = channel();
        let mut binding = None;

        handle_join(
            &reg,
            &tx,
            &mut binding,
            "sec999",
            "Alice",
            Some("hunter2"),
            true,
            None,
        )
        .await;

        let bound = binding.expect("joiner should be bound");
        assert_eq!(bound.room_id, "SEC999");

        let msgs = drain(&mut rx);
        assert!(matches!(msgs[0].body, MessageBody::ParticipantJoined { .. }));

        // the first joiner's password now gates the room
        assert!(!reg.validate_password("SEC999", Some("wrong")).await);
        assert!(reg.validate_password("SEC999", Some("hunter2")).await);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_socket_survives() {
        let reg = registry();
        let (host_tx, _host_rx) = channel();
        let mut host_binding = None;
        handle_join(
            &reg,
            &host_tx,
            &mut host_binding,
            "SEC999",
            "Alice",
            Some("hunter2"),
            true,
            None,
        )
        .await;

        let (tx, mut rx) = channel();
        let mut binding = None;
        handle_join(
            &reg,
            &tx,
            &mut binding,
            "SEC999",
            "Eve",
            Some("wrong"),
            false,
            None,
        )
        .await;

        assert!(binding.is_none());
        let msgs = drain(&mut rx);
        match &msgs[0].body {
            MessageBody::Error { message, code } => {
                assert_eq!(message, "Invalid room password");
                assert_eq!(*code, Some(ErrorCode::InvalidPassword));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        // no participant was created
        assert_eq!(reg.total_participant_count().await, 1);
    }

    #[tokio::test]
    async fn locked_room_diverts_to_waiting() {
        let reg = registry();
        let (mod_tx, mut mod_rx) = channel();
        let mut mod_binding = None;
        handle_join(&reg, &mod_tx, &mut mod_binding, "LCK001", "Mod", None, true, None).await;
        let moderator = mod_binding.as_ref().unwrap();
        reg.set_locked("LCK001", &moderator.participant_id, true)
            .await
            .unwrap();
        drain(&mut mod_rx);

        let (tx, mut rx) = channel();
        let mut binding = None;
        handle_join(&reg, &tx, &mut binding, "LCK001", "Dan", None, false, None).await;

        let bound = binding.expect("candidate should be bound while waiting");
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].body {
            MessageBody::WaitingRoom { name } => assert_eq!(name, "Dan"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(msgs[0].participant_id, bound.participant_id);

        // the moderator was told too
        let to_mod = drain(&mut mod_rx);
        assert!(matches!(to_mod[0].body, MessageBody::WaitingRoom { .. }));
    }

    #[tokio::test]
    async fn creator_token_bypasses_lock_and_grants_host() {
        let reg = registry();
        let (room_id, token) = reg
            .pre_create_room(Some("PRE777".into()), None, None)
            .await
            .unwrap();

        // Lock it via an interim moderator who then leaves
        let (m_tx, _m_rx) = channel();
        let mut m_binding = None;
        handle_join(&reg, &m_tx, &mut m_binding, &room_id, "Temp", None, true, None).await;
        let m = m_binding.unwrap();
        reg.set_locked(&room_id, &m.participant_id, true).await.unwrap();

        let (tx, mut rx) = channel();
        let mut binding = None;
        handle_join(
            &reg,
            &tx,
            &mut binding,
            &room_id,
            "Host",
            None,
            false,
            Some(&token),
        )
        .await;

        assert!(binding.is_some());
        let msgs = drain(&mut rx);
        match &msgs[0].body {
            MessageBody::ParticipantJoined { is_moderator, .. } => assert!(*is_moderator),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_creator_token_on_locked_room_still_waits() {
        let reg = registry();
        let (room_id, _token) = reg
            .pre_create_room(Some("PRE888".into()), None, None)
            .await
            .unwrap();
        let (m_tx, _m_rx) = channel();
        let mut m_binding = None;
        handle_join(&reg, &m_tx, &mut m_binding, &room_id, "Temp", None, true, None).await;
        let m = m_binding.unwrap();
        reg.set_locked(&room_id, &m.participant_id, true).await.unwrap();

        let (tx, mut rx) = channel();
        let mut binding = None;
        handle_join(
            &reg,
            &tx,
            &mut binding,
            &room_id,
            "Eve",
            None,
            false,
            Some("tk-bogus"),
        )
        .await;

        assert!(binding.is_some());
        let msgs = drain(&mut rx);
        assert!(matches!(msgs[0].body, MessageBody::WaitingRoom { .. }));
    }

    #[tokio::test]
    async fn full_room_reports_capacity_error() {
        let reg = registry();
        for i in 0..crate::room::DEFAULT_MAX_PARTICIPANTS {
            let (tx, _rx) = channel();
            let mut b = None;
            handle_join(&reg, &tx, &mut b, "FULL01", &format!("p{i}"), None, i == 0, None).await;
            assert!(b.is_some());
        }

        let (tx, mut rx) = channel();
        let mut binding = None;
        handle_join(&reg, &tx, &mut binding, "FULL01", "Late", None, false, None).await;

        assert!(binding.is_none());
        let msgs = drain(&mut rx);
        match &msgs[0].body {
            MessageBody::Error { message, code } => {
                assert_eq!(message, "Room is full");
                assert!(code.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejoin_leaves_the_previous_room_first() {
        let reg = registry();
        let (a_tx, _a_rx) = channel();
        let mut a_binding = None;
        handle_join(&reg, &a_tx, &mut a_binding, "ROOM01", "Alice", None, true, None).await;

        let (b_tx, mut b_rx) = channel();
        let mut b_binding = None;
        handle_join(&reg, &b_tx, &mut b_binding, "ROOM01", "Bob", None, false, None).await;
        drain(&mut b_rx);

        // Alice hops to a different room on the same connection
        handle_join(&reg, &a_tx, &mut a_binding, "ROOM02", "Alice", None, true, None).await;

        let to_bob = drain(&mut b_rx);
        assert!(to_bob
            .iter()
            .any(|e| matches!(e.body, MessageBody::ParticipantLeft)));
        assert_eq!(a_binding.unwrap().room_id, "ROOM02");
    }

    #[tokio::test]
    async fn oversized_fields_are_refused() {
        let reg = registry();
        let (tx, mut rx) = channel();
        let mut binding = None;

        let long_name = "x".repeat(MAX_PARTICIPANT_NAME_LEN + 1);
        handle_join(&reg, &tx, &mut binding, "ROOM01", &long_name, None, true, None).await;
        assert!(binding.is_none());
        assert!(matches!(
            drain(&mut rx)[0].body,
            MessageBody::Error { .. }
        ));

        let long_room = "R".repeat(MAX_ROOM_ID_LEN + 1);
        handle_join(&reg, &tx, &mut binding, &long_room, "Alice", None, true, None).await;
        assert!(binding.is_none());
    }
}
