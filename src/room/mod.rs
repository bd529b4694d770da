#![forbid(unsafe_code)]

// Room module - room state, membership tracking and fan-out

pub mod api;
pub mod store;

use crate::metrics::ServerMetrics;
use crate::room::store::{LatentRoomRecord, LatentRoomStore};
use crate::signaling::protocol::{now_ms, Envelope, MessageBody, ModerationAction};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_PARTICIPANTS: usize = 8;

const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One frame on a connection's outbound channel. `Close` instructs the send
/// task to terminate the socket — the registry uses it for kicks and rejects.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<String>),
    Close,
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// Errors surfaced to the connection dispatcher.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),
    #[error("Room is full")]
    RoomFull,
    #[error("Room is locked")]
    RoomLocked,
    #[error("Not joined to a room")]
    NotInRoom,
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),
    #[error("Only moderators can perform this action")]
    NotModerator,
    #[error("Pre-created room limit reached")]
    LatentRoomLimit,
    #[error("Room id already exists: {0}")]
    RoomExists(String),
}

/// An admitted, live member of a room.
#[derive(Clone)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub is_moderator: bool,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_hand_raised: bool,
    /// Epoch milliseconds.
    pub joined_at: u64,
    /// Insertion order within the room; host promotion picks the lowest.
    join_seq: u64,
    pub sender: OutboundSender,
}

/// A candidate held at the door of a locked room.
#[derive(Clone)]
pub struct WaitingParticipant {
    pub id: String,
    pub name: String,
    /// Epoch milliseconds.
    pub requested_at: u64,
    pub sender: OutboundSender,
}

/// Media-state delta a participant may apply to itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticipantPatch {
    pub is_muted: Option<bool>,
    pub is_video_off: Option<bool>,
    pub is_hand_raised: Option<bool>,
}

/// Room state. Owned exclusively by the registry.
pub struct Room {
    pub id: String,
    pub participants: HashMap<String, Participant>,
    pub waiting: HashMap<String, WaitingParticipant>,
    pub password: Option<String>,
    pub is_locked: bool,
    pub host_id: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub max_participants: usize,
    pub creator_token: Option<String>,
    /// Pre-created rooms persist to disk and survive emptying.
    pub is_pre_created: bool,
    next_seq: u64,
}

impl Room {
    fn new_adhoc(id: String, password: Option<String>) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            waiting: HashMap::new(),
            password,
            is_locked: false,
            host_id: None,
            created_at: now_ms(),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            creator_token: None,
            is_pre_created: false,
            next_seq: 0,
        }
    }

    fn new_latent(
        id: String,
        password: Option<String>,
        creator_token: String,
        created_at: u64,
        max_participants: usize,
    ) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            waiting: HashMap::new(),
            password,
            is_locked: false,
            host_id: None,
            created_at,
            max_participants,
            creator_token: Some(creator_token),
            is_pre_created: true,
            next_seq: 0,
        }
    }

    /// Sends a pre-serialized frame to one participant's socket.
    fn send_frame(&self, participant: &Participant, json: Arc<String>) {
        match participant.sender.try_send(Outbound::Frame(json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for participant {} in room {}, dropping message",
                    participant.id, self.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for participant {} in room {} (disconnected)",
                    participant.id, self.id
                );
            }
        }
    }

    fn send_to(&self, participant_id: &str, message: &Envelope) {
        let Some(participant) = self.participants.get(participant_id) else {
            return;
        };
        if let Some(json) = serialize(message) {
            self.send_frame(participant, json);
        }
    }

    /// Broadcast a message to all participants except `exclude_id`.
    fn broadcast_except(&self, exclude_id: &str, message: &Envelope) {
        let Some(json) = serialize(message) else {
            return;
        };
        for (id, participant) in &self.participants {
            if id != exclude_id {
                self.send_frame(participant, json.clone());
            }
        }
    }

    /// Broadcast a message to all participants.
    fn broadcast_all(&self, message: &Envelope) {
        let Some(json) = serialize(message) else {
            return;
        };
        for participant in self.participants.values() {
            self.send_frame(participant, json.clone());
        }
    }

    /// Announces every existing participant to `to_id`, in join order, so a
    /// newcomer can enumerate the room before peer negotiation starts.
    fn announce_roster_to(&self, to_id: &str) {
        let mut peers: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.id != to_id)
            .collect();
        peers.sort_by_key(|p| p.join_seq);
        for peer in peers {
            self.send_to(to_id, &joined_envelope(&self.id, peer));
        }
    }

    /// Removes a participant, announces the departure and promotes a new
    /// host if the host left. Returns true if the participant was present.
    fn remove_and_announce(&mut self, participant_id: &str) -> bool {
        if self.participants.remove(participant_id).is_none() {
            return false;
        }

        self.broadcast_all(&Envelope::server(
            self.id.clone(),
            participant_id,
            MessageBody::ParticipantLeft,
        ));

        if self.host_id.as_deref() == Some(participant_id) {
            self.host_id = None;
            if let Some(new_host) = self.promote_host() {
                if let Some(p) = self.participants.get(&new_host) {
                    self.broadcast_all(&updated_envelope(&self.id, p));
                }
            }
        }

        true
    }

    /// Promotes the longest-present participant to host and moderator.
    fn promote_host(&mut self) -> Option<String> {
        let next = self
            .participants
            .values()
            .min_by_key(|p| p.join_seq)
            .map(|p| p.id.clone())?;
        if let Some(p) = self.participants.get_mut(&next) {
            p.is_moderator = true;
        }
        self.host_id = Some(next.clone());
        info!("Promoted {} to host of room {}", next, self.id);
        Some(next)
    }
}

fn serialize(message: &Envelope) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize broadcast message: {}", e);
            None
        }
    }
}

fn joined_envelope(room_id: &str, p: &Participant) -> Envelope {
    Envelope::server(
        room_id,
        p.id.clone(),
        MessageBody::ParticipantJoined {
            name: p.name.clone(),
            is_moderator: p.is_moderator,
            is_muted: p.is_muted,
            is_video_off: p.is_video_off,
        },
    )
}

fn updated_envelope(room_id: &str, p: &Participant) -> Envelope {
    Envelope::server(
        room_id,
        p.id.clone(),
        MessageBody::ParticipantUpdated {
            is_muted: Some(p.is_muted),
            is_video_off: Some(p.is_video_off),
            is_hand_raised: Some(p.is_hand_raised),
            is_moderator: Some(p.is_moderator),
        },
    )
}

/// Uppercases and trims a client-supplied room id.
pub fn normalize_room_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Mints a 6-character uppercase alphanumeric room code.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Owns all rooms and coordinates membership and fan-out.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock (held across mutation plus
/// fan-out so every observer of a broadcast sees post-mutation state).
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    store: Option<LatentRoomStore>,
    max_latent_rooms: usize,
    latent_room_max_age: Duration,
    /// Serializes pre-creation so the latent cap cannot be raced past.
    precreate_gate: TokioMutex<()>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(
        store: Option<LatentRoomStore>,
        max_latent_rooms: usize,
        latent_room_max_age: Duration,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            store,
            max_latent_rooms,
            latent_room_max_age,
            precreate_gate: TokioMutex::new(()),
            metrics,
        }
    }

    /// Seeds pre-created rooms loaded from disk at startup.
    pub fn restore(&self, records: Vec<LatentRoomRecord>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        for r in records {
            let id = normalize_room_id(&r.room_id);
            rooms.entry(id.clone()).or_insert_with(|| {
                Arc::new(TokioRwLock::new(Room::new_latent(
                    id,
                    r.password,
                    r.creator_token,
                    r.created_at,
                    r.max_participants,
                )))
            });
        }
    }

    /// Gets a room lock by id (brief outer read lock, no await).
    fn lookup(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Gets or creates a room. A freshly created room takes the supplied
    /// password — the first joiner defines it.
    fn get_or_create_room(
        &self,
        room_id: &str,
        password: Option<String>,
    ) -> Arc<TokioRwLock<Room>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Creating new room: {}", room_id);
                self.metrics.inc_rooms_created();
                Arc::new(TokioRwLock::new(Room::new_adhoc(
                    room_id.to_string(),
                    password,
                )))
            })
            .clone()
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.lookup(room_id).is_some()
    }

    /// True when the room has no password, the candidate matches it exactly,
    /// or the room does not exist yet (the first joiner will define one).
    pub async fn validate_password(&self, room_id: &str, candidate: Option<&str>) -> bool {
        match self.lookup(room_id) {
            None => true,
            Some(lock) => {
                let room = lock.read().await;
                match &room.password {
                    None => true,
                    Some(p) => candidate == Some(p.as_str()),
                }
            }
        }
    }

    pub async fn validate_creator_token(&self, room_id: &str, token: &str) -> bool {
        match self.lookup(room_id) {
            None => false,
            Some(lock) => {
                let room = lock.read().await;
                room.creator_token.as_deref() == Some(token)
            }
        }
    }

    pub async fn is_room_locked(&self, room_id: &str) -> bool {
        match self.lookup(room_id) {
            None => false,
            Some(lock) => lock.read().await.is_locked,
        }
    }

    /// Adds a participant, creating the room if needed.
    ///
    /// The first participant, an `is_host` joiner and a creator all become
    /// host and moderator. The lock gate is re-checked here, under the room
    /// lock, so no one slips past a lock set between admission control and
    /// insertion. All join fan-out happens before this returns:
    /// existing members learn of the newcomer, then the newcomer receives
    /// its own announcement followed by one per existing peer.
    pub async fn add_participant(
        &self,
        room_id: &str,
        id: String,
        name: String,
        sender: OutboundSender,
        is_host: bool,
        is_creator: bool,
        password_on_create: Option<String>,
    ) -> Result<(), RegistryError> {
        let room_lock = self.get_or_create_room(room_id, password_on_create);
        let mut room = room_lock.write().await;

        if room.is_locked && !is_creator {
            return Err(RegistryError::RoomLocked);
        }
        if room.participants.len() >= room.max_participants {
            return Err(RegistryError::RoomFull);
        }

        let first = room.participants.is_empty();
        let as_host = is_host || is_creator || first;
        let seq = room.next_seq;
        room.next_seq += 1;

        let participant = Participant {
            id: id.clone(),
            name: name.clone(),
            is_moderator: as_host,
            is_muted: false,
            is_video_off: false,
            is_hand_raised: false,
            joined_at: now_ms(),
            join_seq: seq,
            sender,
        };

        if as_host {
            room.host_id = Some(id.clone());
        }

        let announce = joined_envelope(&room.id, &participant);
        room.participants.insert(id.clone(), participant);
        self.metrics.participant_joined();

        info!("Participant {} ({}) joined room {}", id, name, room.id);

        room.broadcast_except(&id, &announce);
        room.send_to(&id, &announce);
        room.announce_roster_to(&id);

        Ok(())
    }

    /// Puts a candidate in the waiting room and notifies them plus every
    /// moderator. Fails when the room's participant set is already at cap.
    pub async fn add_to_waiting_room(
        &self,
        room_id: &str,
        candidate: WaitingParticipant,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut room = room_lock.write().await;

        if room.participants.len() >= room.max_participants {
            return Err(RegistryError::RoomFull);
        }

        let notice = Envelope::server(
            room.id.clone(),
            candidate.id.clone(),
            MessageBody::WaitingRoom {
                name: candidate.name.clone(),
            },
        );

        if let Some(json) = serialize(&notice) {
            let _ = candidate.sender.try_send(Outbound::Frame(json.clone()));
            for moderator in room.participants.values().filter(|p| p.is_moderator) {
                room.send_frame(moderator, json.clone());
            }
        }

        info!(
            "Participant {} ({}) waiting for room {}",
            candidate.id, candidate.name, room.id
        );
        room.waiting.insert(candidate.id.clone(), candidate);

        Ok(())
    }

    /// Moves a waiting candidate into the room in one step: removed from the
    /// waiting map and inserted into the participant set under the same room
    /// lock, then announced exactly like a fresh join.
    pub async fn admit_from_waiting_room(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut room = room_lock.write().await;

        self.require_moderator(&room, actor_id)?;

        let candidate = room
            .waiting
            .remove(target_id)
            .ok_or_else(|| RegistryError::ParticipantNotFound(target_id.to_string()))?;

        if room.participants.len() >= room.max_participants {
            // Leave the candidate where they were; the admitting moderator
            // sees the failure.
            room.waiting.insert(candidate.id.clone(), candidate);
            return Err(RegistryError::RoomFull);
        }

        let first = room.participants.is_empty();
        let seq = room.next_seq;
        room.next_seq += 1;

        let participant = Participant {
            id: candidate.id.clone(),
            name: candidate.name.clone(),
            is_moderator: first,
            is_muted: false,
            is_video_off: false,
            is_hand_raised: false,
            joined_at: now_ms(),
            join_seq: seq,
            sender: candidate.sender,
        };
        if first {
            room.host_id = Some(participant.id.clone());
        }

        let id = participant.id.clone();
        let announce = joined_envelope(&room.id, &participant);
        room.participants.insert(id.clone(), participant);
        self.metrics.participant_joined();

        info!("Admitted {} into room {} (by {})", id, room.id, actor_id);

        room.send_to(&id, &announce);
        room.announce_roster_to(&id);
        room.broadcast_except(&id, &announce);

        Ok(())
    }

    /// Removes a waiting candidate, tells them why, and closes their socket.
    pub async fn reject_from_waiting_room(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
        reason: Option<String>,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut room = room_lock.write().await;

        self.require_moderator(&room, actor_id)?;

        let candidate = room
            .waiting
            .remove(target_id)
            .ok_or_else(|| RegistryError::ParticipantNotFound(target_id.to_string()))?;

        let notice = Envelope::server(
            room.id.clone(),
            actor_id,
            MessageBody::RejectUser {
                target_id: candidate.id.clone(),
                reason,
            },
        );
        if let Some(json) = serialize(&notice) {
            let _ = candidate.sender.try_send(Outbound::Frame(json));
        }
        let _ = candidate.sender.try_send(Outbound::Close);

        info!("Rejected {} from room {} (by {})", target_id, room.id, actor_id);

        Ok(())
    }

    /// Removes an active participant: departure fan-out, host promotion,
    /// ad-hoc room teardown. Idempotent.
    pub async fn remove_participant(&self, room_id: &str, participant_id: &str) -> bool {
        let Some(room_lock) = self.lookup(room_id) else {
            return false;
        };

        let (removed, became_empty) = {
            let mut room = room_lock.write().await;
            let removed = room.remove_and_announce(participant_id);
            if removed {
                self.metrics.participant_left();
                info!("Participant {} left room {}", participant_id, room_id);
            }
            (removed, room.participants.is_empty() && !room.is_pre_created)
        };

        if became_empty {
            self.reap_if_empty(room_id);
        }
        removed
    }

    /// Clears whatever this connection was bound to — an active participant
    /// or a waiting candidate.
    pub async fn disconnect(&self, room_id: &str, participant_id: &str) {
        if self.remove_participant(room_id, participant_id).await {
            return;
        }
        if let Some(room_lock) = self.lookup(room_id) {
            let mut room = room_lock.write().await;
            if room.waiting.remove(participant_id).is_some() {
                debug!(
                    "Waiting participant {} left room {}",
                    participant_id, room_id
                );
            }
        }
    }

    /// Merges a self-applied state delta and broadcasts the merged state to
    /// the other participants (no echo).
    pub async fn update_participant(
        &self,
        room_id: &str,
        participant_id: &str,
        patch: ParticipantPatch,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut guard = room_lock.write().await;
        let room = &mut *guard;

        let participant = room
            .participants
            .get_mut(participant_id)
            .ok_or(RegistryError::NotInRoom)?;

        if let Some(v) = patch.is_muted {
            participant.is_muted = v;
        }
        if let Some(v) = patch.is_video_off {
            participant.is_video_off = v;
        }
        if let Some(v) = patch.is_hand_raised {
            participant.is_hand_raised = v;
        }

        let update = updated_envelope(&room.id, participant);
        room.broadcast_except(participant_id, &update);
        Ok(())
    }

    /// Applies a moderator command. The actor must be a moderator in the room.
    pub async fn moderate(
        &self,
        room_id: &str,
        actor_id: &str,
        target_id: &str,
        action: ModerationAction,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;

        let became_empty = {
            let mut room = room_lock.write().await;
            self.require_moderator(&room, actor_id)?;

            if !room.participants.contains_key(target_id) {
                return Err(RegistryError::ParticipantNotFound(target_id.to_string()));
            }

            match action {
                ModerationAction::Mute | ModerationAction::Unmute => {
                    let muted = action == ModerationAction::Mute;
                    if let Some(target) = room.participants.get_mut(target_id) {
                        target.is_muted = muted;
                    }
                    if let Some(target) = room.participants.get(target_id) {
                        let update = updated_envelope(&room.id, target);
                        room.broadcast_all(&update);
                    }
                    false
                }
                ModerationAction::MakeModerator => {
                    // Grants the moderator bit only; the host stays the host.
                    if let Some(target) = room.participants.get_mut(target_id) {
                        target.is_moderator = true;
                    }
                    if let Some(target) = room.participants.get(target_id) {
                        let update = updated_envelope(&room.id, target);
                        room.broadcast_all(&update);
                    }
                    false
                }
                ModerationAction::Kick => {
                    let notice = Envelope::server(
                        room.id.clone(),
                        actor_id,
                        MessageBody::ModeratorAction {
                            target_id: target_id.to_string(),
                            action: ModerationAction::Kick,
                        },
                    );
                    if let Some(target) = room.participants.get(target_id) {
                        if let Some(json) = serialize(&notice) {
                            room.send_frame(target, json);
                        }
                        let _ = target.sender.try_send(Outbound::Close);
                    }

                    room.remove_and_announce(target_id);
                    self.metrics.participant_left();
                    self.metrics.inc_kicks();
                    info!("Kicked {} from room {} (by {})", target_id, room.id, actor_id);

                    room.participants.is_empty() && !room.is_pre_created
                }
            }
        };

        if became_empty {
            self.reap_if_empty(room_id);
        }
        Ok(())
    }

    /// Locks or unlocks a room (moderator only) and tells everyone.
    pub async fn set_locked(
        &self,
        room_id: &str,
        actor_id: &str,
        locked: bool,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let mut room = room_lock.write().await;

        self.require_moderator(&room, actor_id)?;

        room.is_locked = locked;
        let body = if locked {
            MessageBody::RoomLocked {
                locked_by: actor_id.to_string(),
            }
        } else {
            MessageBody::RoomUnlocked {
                unlocked_by: actor_id.to_string(),
            }
        };
        info!(
            "Room {} {} by {}",
            room.id,
            if locked { "locked" } else { "unlocked" },
            actor_id
        );
        let notice = Envelope::server(room.id.clone(), actor_id, body);
        room.broadcast_all(&notice);
        Ok(())
    }

    /// Forwards a point-to-point message to its target within the same room.
    /// The sender's id is stamped on the envelope; a vanished target is
    /// dropped silently.
    pub async fn relay(
        &self,
        room_id: &str,
        sender_id: &str,
        mut envelope: Envelope,
    ) -> Result<(), RegistryError> {
        let Some(target_id) = envelope.body.relay_target().map(str::to_string) else {
            return Ok(());
        };

        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let room = room_lock.read().await;

        if !room.participants.contains_key(sender_id) {
            return Err(RegistryError::NotInRoom);
        }

        envelope.participant_id = sender_id.to_string();
        envelope.room_id = room.id.clone();

        match room.participants.get(&target_id) {
            Some(target) => {
                if let Some(json) = serialize(&envelope) {
                    room.send_frame(target, json);
                }
            }
            None => debug!("Relay target {} not in room {}", target_id, room_id),
        }
        Ok(())
    }

    /// Broadcasts a chat message to the whole room, sender included — the
    /// echo gives clients an ordering-consistent copy of their own message.
    pub async fn broadcast_chat(
        &self,
        room_id: &str,
        sender_id: &str,
        mut envelope: Envelope,
    ) -> Result<(), RegistryError> {
        let room_lock = self
            .lookup(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        let room = room_lock.read().await;

        if !room.participants.contains_key(sender_id) {
            return Err(RegistryError::NotInRoom);
        }

        envelope.participant_id = sender_id.to_string();
        envelope.room_id = room.id.clone();
        room.broadcast_all(&envelope);
        Ok(())
    }

    /// Creates an empty persisted room and mints its creator token.
    pub async fn pre_create_room(
        &self,
        requested_id: Option<String>,
        password: Option<String>,
        max_participants: Option<usize>,
    ) -> Result<(String, String), RegistryError> {
        let _gate = self.precreate_gate.lock().await;

        if self.latent_room_count().await >= self.max_latent_rooms {
            return Err(RegistryError::LatentRoomLimit);
        }

        let room_id = match requested_id {
            Some(raw) => {
                let id = normalize_room_id(&raw);
                if self.room_exists(&id) {
                    return Err(RegistryError::RoomExists(id));
                }
                id
            }
            None => loop {
                let id = generate_room_code();
                if !self.room_exists(&id) {
                    break id;
                }
            },
        };

        let creator_token = Uuid::new_v4().to_string();
        let room = Room::new_latent(
            room_id.clone(),
            password,
            creator_token.clone(),
            now_ms(),
            max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS),
        );

        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.insert(room_id.clone(), Arc::new(TokioRwLock::new(room)));
        }
        self.metrics.inc_rooms_created();
        info!("Pre-created room {}", room_id);

        self.persist_latent().await;

        Ok((room_id, creator_token))
    }

    /// Deletes empty rooms past their age cap: ad-hoc rooms against
    /// `max_age`, pre-created rooms against the latent age. Returns how many
    /// rooms were removed; the store is rewritten when a pre-created room
    /// was among them.
    pub async fn cleanup_abandoned_rooms(&self, max_age: Duration) -> usize {
        let snapshot: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let now = now_ms();
        let mut expired: Vec<(String, bool)> = Vec::new();
        for (id, lock) in snapshot {
            let room = lock.read().await;
            if !room.participants.is_empty() {
                continue;
            }
            let limit = if room.is_pre_created {
                self.latent_room_max_age
            } else {
                max_age
            };
            if now.saturating_sub(room.created_at) > limit.as_millis() as u64 {
                expired.push((id, room.is_pre_created));
            }
        }

        let mut removed = 0;
        let mut latent_removed = false;
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            for (id, latent) in &expired {
                if let Some(lock) = rooms.get(id) {
                    // Re-check under write lock using try_write to avoid blocking
                    if lock
                        .try_write()
                        .map_or(false, |room| room.participants.is_empty())
                    {
                        rooms.remove(id);
                        removed += 1;
                        latent_removed |= *latent;
                        info!("Evicted abandoned room {}", id);
                    }
                }
            }
        }

        if latent_removed {
            self.persist_latent().await;
        }
        removed
    }

    /// Rewrites the on-disk latent-room list. The set is snapshotted under
    /// the room locks; the disk write happens with no lock held.
    pub async fn persist_latent(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let snapshot: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut records = Vec::new();
        for lock in snapshot {
            let room = lock.read().await;
            if room.is_pre_created {
                records.push(LatentRoomRecord {
                    room_id: room.id.clone(),
                    password: room.password.clone(),
                    creator_token: room.creator_token.clone().unwrap_or_default(),
                    created_at: room.created_at,
                    max_participants: room.max_participants,
                });
            }
        }

        if let Err(e) = store.rewrite(&records).await {
            warn!("Failed to persist pre-created rooms: {}", e);
        }
    }

    /// Gets current room count.
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms.
    pub async fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.participants.len();
            }
        }
        total
    }

    fn require_moderator(&self, room: &Room, actor_id: &str) -> Result<(), RegistryError> {
        match room.participants.get(actor_id) {
            Some(p) if p.is_moderator => Ok(()),
            Some(_) => Err(RegistryError::NotModerator),
            None => Err(RegistryError::NotInRoom),
        }
    }

    async fn latent_room_count(&self) -> usize {
        let snapshot: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut count = 0;
        for lock in snapshot {
            let room = lock.read().await;
            if room.is_pre_created && room.participants.is_empty() {
                count += 1;
            }
        }
        count
    }

    /// Drops an ad-hoc room that emptied out. Re-checks emptiness under the
    /// outer write lock so a concurrent join wins the race.
    fn reap_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(room_lock) = rooms.get(room_id) {
            let gone = room_lock
                .try_write()
                .map_or(false, |room| room.participants.is_empty() && !room.is_pre_created);
            if gone {
                rooms.remove(room_id);
                info!("Room {} is empty, cleaning up", room_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ErrorCode;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(None, 10, Duration::from_secs(24 * 3600), ServerMetrics::new())
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

    fn drain_raw(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    async fn join(
        reg: &RoomRegistry,
        room: &str,
        id: &str,
        name: &str,
        is_host: bool,
    ) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = channel();
        reg.add_participant(room, id.into(), name.into(), tx, is_host, false, None)
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn first_joiner_becomes_host() {
        let reg = registry();
        let mut rx = join(&reg, "ABC123", "P1", "Alice", true).await;

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].participant_id, "P1");
        match &msgs[0].body {
            MessageBody::ParticipantJoined {
                name, is_moderator, ..
            } => {
                assert_eq!(name, "Alice");
                assert!(*is_moderator);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        assert_eq!(reg.room_count(), 1);
        assert_eq!(reg.total_participant_count().await, 1);
    }

    #[tokio::test]
    async fn second_joiner_sees_self_then_roster() {
        let reg = registry();
        let mut alice_rx = join(&reg, "ABC123", "P1", "Alice", true).await;
        drain(&mut alice_rx);

        let mut bob_rx = join(&reg, "ABC123", "P2", "Bob", false).await;

        // Alice learns about Bob
        let to_alice = drain(&mut alice_rx);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].participant_id, "P2");

        // Bob: self announcement first, then Alice
        let to_bob = drain(&mut bob_rx);
        assert_eq!(to_bob.len(), 2);
        assert_eq!(to_bob[0].participant_id, "P2");
        assert_eq!(to_bob[1].participant_id, "P1");
        match &to_bob[1].body {
            MessageBody::ParticipantJoined { is_moderator, .. } => assert!(*is_moderator),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let reg = registry();
        for i in 0..DEFAULT_MAX_PARTICIPANTS {
            join(&reg, "FULL01", &format!("P{i}"), "p", false).await;
        }
        let (tx, _rx) = channel();
        let err = reg
            .add_participant("FULL01", "PX".into(), "late".into(), tx, false, false, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomFull);
        assert_eq!(reg.total_participant_count().await, DEFAULT_MAX_PARTICIPANTS);
    }

    #[tokio::test]
    async fn host_leaving_promotes_next_in_join_order() {
        let reg = registry();
        let _a = join(&reg, "R00M01", "P1", "Alice", true).await;
        let mut b = join(&reg, "R00M01", "P2", "Bob", false).await;
        let mut c = join(&reg, "R00M01", "P3", "Cara", false).await;
        drain(&mut b);
        drain(&mut c);

        assert!(reg.remove_participant("R00M01", "P1").await);

        // Bob was next in join order: left notice, then his promotion
        let to_b = drain(&mut b);
        assert_eq!(to_b.len(), 2);
        assert!(matches!(to_b[0].body, MessageBody::ParticipantLeft));
        assert_eq!(to_b[0].participant_id, "P1");
        assert_eq!(to_b[1].participant_id, "P2");
        match &to_b[1].body {
            MessageBody::ParticipantUpdated { is_moderator, .. } => {
                assert_eq!(*is_moderator, Some(true))
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let room_lock = reg.lookup("R00M01").unwrap();
        let room = room_lock.read().await;
        assert_eq!(room.host_id.as_deref(), Some("P2"));
        assert!(room.participants["P2"].is_moderator);
    }

    #[tokio::test]
    async fn adhoc_room_vanishes_when_emptied() {
        let reg = registry();
        let _rx = join(&reg, "GONE01", "P1", "Alice", false).await;
        assert_eq!(reg.room_count(), 1);

        reg.remove_participant("GONE01", "P1").await;
        assert_eq!(reg.room_count(), 0);
    }

    #[tokio::test]
    async fn precreated_room_survives_emptying() {
        let reg = registry();
        let (id, token) = reg.pre_create_room(None, None, None).await.unwrap();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let (tx, _rx) = channel();
        reg.add_participant(&id, "P1".into(), "Host".into(), tx, false, true, None)
            .await
            .unwrap();
        reg.remove_participant(&id, "P1").await;

        assert_eq!(reg.room_count(), 1);
        assert!(reg.validate_creator_token(&id, &token).await);
    }

    #[tokio::test]
    async fn leave_then_disconnect_is_idempotent() {
        let reg = registry();
        let _a = join(&reg, "ONCE01", "P1", "Alice", true).await;
        let mut b = join(&reg, "ONCE01", "P2", "Bob", false).await;
        drain(&mut b);

        assert!(reg.remove_participant("ONCE01", "P1").await);
        reg.disconnect("ONCE01", "P1").await;

        let left: Vec<Envelope> = drain(&mut b)
            .into_iter()
            .filter(|e| matches!(e.body, MessageBody::ParticipantLeft))
            .collect();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn waiting_room_flow_notifies_candidate_and_moderators() {
        let reg = registry();
        let mut m = join(&reg, "LCK001", "M1", "Mod", true).await;
        drain(&mut m);
        reg.set_locked("LCK001", "M1", true).await.unwrap();
        drain(&mut m);

        let (tx, mut dan_rx) = channel();
        reg.add_to_waiting_room(
            "LCK001",
            WaitingParticipant {
                id: "P7".into(),
                name: "Dan".into(),
                requested_at: now_ms(),
                sender: tx,
            },
        )
        .await
        .unwrap();

        let to_dan = drain(&mut dan_rx);
        assert_eq!(to_dan.len(), 1);
        assert_eq!(to_dan[0].participant_id, "P7");
        assert!(matches!(to_dan[0].body, MessageBody::WaitingRoom { .. }));

        let to_mod = drain(&mut m);
        assert_eq!(to_mod.len(), 1);
        assert!(matches!(to_mod[0].body, MessageBody::WaitingRoom { .. }));

        // Admission moves them atomically and announces like a join
        reg.admit_from_waiting_room("LCK001", "M1", "P7").await.unwrap();

        let to_dan = drain(&mut dan_rx);
        assert_eq!(to_dan[0].participant_id, "P7");
        assert!(matches!(to_dan[0].body, MessageBody::ParticipantJoined { .. }));
        assert_eq!(to_dan[1].participant_id, "M1");

        let to_mod = drain(&mut m);
        assert_eq!(to_mod.len(), 1);
        assert_eq!(to_mod[0].participant_id, "P7");

        let room_lock = reg.lookup("LCK001").unwrap();
        let room = room_lock.read().await;
        assert!(room.waiting.is_empty());
        assert!(room.participants.contains_key("P7"));
    }

    #[tokio::test]
    async fn reject_closes_the_candidate_socket() {
        let reg = registry();
        let mut m = join(&reg, "LCK002", "M1", "Mod", true).await;
        drain(&mut m);

        let (tx, mut rx) = channel();
        reg.add_to_waiting_room(
            "LCK002",
            WaitingParticipant {
                id: "W1".into(),
                name: "Eve".into(),
                requested_at: now_ms(),
                sender: tx,
            },
        )
        .await
        .unwrap();
        drain_raw(&mut rx);

        reg.reject_from_waiting_room("LCK002", "M1", "W1", Some("not invited".into()))
            .await
            .unwrap();

        let frames = drain_raw(&mut rx);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Outbound::Frame(json) => {
                let env: Envelope = serde_json::from_str(json).unwrap();
                match env.body {
                    MessageBody::RejectUser { reason, .. } => {
                        assert_eq!(reason.as_deref(), Some("not invited"))
                    }
                    other => panic!("unexpected message: {other:?}"),
                }
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(frames[1], Outbound::Close));
    }

    #[tokio::test]
    async fn non_moderator_cannot_admit() {
        let reg = registry();
        let _m = join(&reg, "LCK003", "M1", "Mod", true).await;
        let _u = join(&reg, "LCK003", "U1", "User", false).await;

        let (tx, _rx) = channel();
        reg.add_to_waiting_room(
            "LCK003",
            WaitingParticipant {
                id: "W1".into(),
                name: "Dan".into(),
                requested_at: now_ms(),
                sender: tx,
            },
        )
        .await
        .unwrap();

        let err = reg
            .admit_from_waiting_room("LCK003", "U1", "W1")
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NotModerator);
    }

    #[tokio::test]
    async fn admitting_into_full_room_keeps_candidate_waiting() {
        let reg = registry();
        for i in 0..DEFAULT_MAX_PARTICIPANTS {
            join(&reg, "FULL02", &format!("P{i}"), "p", i == 0).await;
        }

        let room_lock = reg.lookup("FULL02").unwrap();
        {
            // Waiting entry inserted directly; add_to_waiting_room would
            // refuse a full room at the door.
            let (tx, _rx) = channel();
            let mut room = room_lock.write().await;
            room.waiting.insert(
                "W1".into(),
                WaitingParticipant {
                    id: "W1".into(),
                    name: "Dan".into(),
                    requested_at: now_ms(),
                    sender: tx,
                },
            );
        }

        let err = reg
            .admit_from_waiting_room("FULL02", "P0", "W1")
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomFull);

        let room = room_lock.read().await;
        assert!(room.waiting.contains_key("W1"));
    }

    #[tokio::test]
    async fn kick_notifies_target_then_closes() {
        let reg = registry();
        let mut m = join(&reg, "KICK01", "M1", "Mod", true).await;
        let mut x = join(&reg, "KICK01", "X1", "Victim", false).await;
        let mut other = join(&reg, "KICK01", "O1", "Other", false).await;
        drain(&mut m);
        drain_raw(&mut x);
        drain(&mut other);

        reg.moderate("KICK01", "M1", "X1", ModerationAction::Kick)
            .await
            .unwrap();

        let to_x = drain_raw(&mut x);
        assert_eq!(to_x.len(), 2);
        match &to_x[0] {
            Outbound::Frame(json) => {
                let env: Envelope = serde_json::from_str(json).unwrap();
                match env.body {
                    MessageBody::ModeratorAction { target_id, action } => {
                        assert_eq!(target_id, "X1");
                        assert_eq!(action, ModerationAction::Kick);
                    }
                    other => panic!("unexpected message: {other:?}"),
                }
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(to_x[1], Outbound::Close));

        let to_other: Vec<Envelope> = drain(&mut other);
        assert_eq!(to_other.len(), 1);
        assert!(matches!(to_other[0].body, MessageBody::ParticipantLeft));
        assert_eq!(to_other[0].participant_id, "X1");
    }

    #[tokio::test]
    async fn non_moderator_actions_are_refused_without_state_change() {
        let reg = registry();
        let _m = join(&reg, "AUTH01", "M1", "Mod", true).await;
        let _u = join(&reg, "AUTH01", "U1", "User", false).await;

        let err = reg
            .moderate("AUTH01", "U1", "M1", ModerationAction::Mute)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NotModerator);

        let room_lock = reg.lookup("AUTH01").unwrap();
        let room = room_lock.read().await;
        assert!(!room.participants["M1"].is_muted);
    }

    #[tokio::test]
    async fn make_moderator_grants_bit_but_keeps_host() {
        let reg = registry();
        let _m = join(&reg, "PROMO1", "M1", "Mod", true).await;
        let _u = join(&reg, "PROMO1", "U1", "User", false).await;

        reg.moderate("PROMO1", "M1", "U1", ModerationAction::MakeModerator)
            .await
            .unwrap();

        let room_lock = reg.lookup("PROMO1").unwrap();
        let room = room_lock.read().await;
        assert!(room.participants["U1"].is_moderator);
        assert_eq!(room.host_id.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn relay_reaches_only_the_target() {
        let reg = registry();
        let _a = join(&reg, "RELAY1", "P1", "Alice", true).await;
        let mut b = join(&reg, "RELAY1", "P2", "Bob", false).await;
        let mut c = join(&reg, "RELAY1", "P3", "Cara", false).await;
        drain(&mut b);
        drain(&mut c);

        let env = Envelope {
            body: MessageBody::Offer {
                target_id: "P2".into(),
                sdp: "v=0".into(),
            },
            room_id: "RELAY1".into(),
            participant_id: "spoofed".into(),
            timestamp: 1,
        };
        reg.relay("RELAY1", "P1", env).await.unwrap();

        let to_b = drain(&mut b);
        assert_eq!(to_b.len(), 1);
        // client-supplied sender id was replaced with the server-known one
        assert_eq!(to_b[0].participant_id, "P1");
        assert!(matches!(to_b[0].body, MessageBody::Offer { .. }));

        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn chat_echoes_to_sender_and_everyone_else_once() {
        let reg = registry();
        let mut a = join(&reg, "CHAT01", "P1", "Alice", true).await;
        let mut b = join(&reg, "CHAT01", "P2", "Bob", false).await;
        drain(&mut a);
        drain(&mut b);

        let env = Envelope {
            body: MessageBody::Chat {
                text: "hello".into(),
                reply_to: None,
            },
            room_id: "CHAT01".into(),
            participant_id: String::new(),
            timestamp: 1,
        };
        reg.broadcast_chat("CHAT01", "P1", env).await.unwrap();

        let to_a = drain(&mut a);
        let to_b = drain(&mut b);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_a[0].participant_id, "P1");
    }

    #[tokio::test]
    async fn update_merges_and_broadcasts_without_echo() {
        let reg = registry();
        let mut a = join(&reg, "UPD001", "P1", "Alice", true).await;
        let mut b = join(&reg, "UPD001", "P2", "Bob", false).await;
        drain(&mut a);
        drain(&mut b);

        reg.update_participant(
            "UPD001",
            "P1",
            ParticipantPatch {
                is_hand_raised: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(drain(&mut a).is_empty());
        let to_b = drain(&mut b);
        assert_eq!(to_b.len(), 1);
        match &to_b[0].body {
            MessageBody::ParticipantUpdated {
                is_hand_raised,
                is_muted,
                ..
            } => {
                assert_eq!(*is_hand_raised, Some(true));
                assert_eq!(*is_muted, Some(false));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_room_passes_password_gate() {
        let reg = registry();
        assert!(reg.validate_password("NOPE99", Some("whatever")).await);
        assert!(reg.validate_password("NOPE99", None).await);
    }

    #[tokio::test]
    async fn password_gate_is_exact_equality() {
        let reg = registry();
        let (tx, _rx) = channel();
        reg.add_participant(
            "SEC999",
            "P1".into(),
            "Alice".into(),
            tx,
            true,
            false,
            Some("hunter2".into()),
        )
        .await
        .unwrap();

        assert!(reg.validate_password("SEC999", Some("hunter2")).await);
        assert!(!reg.validate_password("SEC999", Some("wrong")).await);
        assert!(!reg.validate_password("SEC999", Some("Hunter2")).await);
        assert!(!reg.validate_password("SEC999", None).await);
    }

    #[tokio::test]
    async fn locked_room_refuses_non_creator_even_on_race() {
        let reg = registry();
        let mut m = join(&reg, "PRE777", "M1", "Mod", true).await;
        drain(&mut m);
        reg.set_locked("PRE777", "M1", true).await.unwrap();

        let (tx, _rx) = channel();
        let err = reg
            .add_participant("PRE777", "P9".into(), "Late".into(), tx, false, false, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomLocked);

        // A validated creator bypasses the lock and lands as host-grade
        let (tx, mut rx) = channel();
        reg.add_participant("PRE777", "H1".into(), "Host".into(), tx, false, true, None)
            .await
            .unwrap();
        let msgs = drain(&mut rx);
        match &msgs[0].body {
            MessageBody::ParticipantJoined { is_moderator, .. } => assert!(*is_moderator),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn precreate_honors_cap_and_collisions() {
        let metrics = ServerMetrics::new();
        let reg = RoomRegistry::new(None, 2, Duration::from_secs(3600), metrics);

        let (id1, _) = reg.pre_create_room(Some("aaa111".into()), None, None).await.unwrap();
        assert_eq!(id1, "AAA111"); // case-normalized

        let err = reg
            .pre_create_room(Some("AAA111".into()), None, None)
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::RoomExists("AAA111".into()));

        reg.pre_create_room(None, None, None).await.unwrap();
        let err = reg.pre_create_room(None, None, None).await.unwrap_err();
        assert_eq!(err, RegistryError::LatentRoomLimit);
    }

    #[tokio::test]
    async fn cleanup_evicts_by_the_right_age_limit() {
        let metrics = ServerMetrics::new();
        // Latent rooms expire instantly for this test; ad-hoc limit passed per call.
        let reg = RoomRegistry::new(None, 10, Duration::ZERO, metrics);

        reg.pre_create_room(Some("LATENT".into()), None, None).await.unwrap();
        // Empty ad-hoc room only exists transiently; fabricate one directly.
        reg.get_or_create_room("ADHOC1", None);

        tokio::time::sleep(Duration::from_millis(10)).await;

        // Generous ad-hoc age: only the latent room goes.
        let removed = reg.cleanup_abandoned_rooms(Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        assert!(!reg.room_exists("LATENT"));
        assert!(reg.room_exists("ADHOC1"));

        // Zero ad-hoc age: the empty ad-hoc room goes too.
        let removed = reg.cleanup_abandoned_rooms(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert_eq!(reg.room_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_spares_occupied_rooms() {
        let reg = registry();
        let _rx = join(&reg, "BUSY01", "P1", "Alice", true).await;
        let removed = reg.cleanup_abandoned_rooms(Duration::ZERO).await;
        assert_eq!(removed, 0);
        assert!(reg.room_exists("BUSY01"));
    }

    #[test]
    fn room_ids_are_case_normalized() {
        assert_eq!(normalize_room_id(" abc123 "), "ABC123");
    }

    #[test]
    fn room_codes_are_six_uppercase_alphanumerics() {
        for _ in 0..32 {
            let code = generate_room_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn error_codes_exist_for_auth_failures() {
        // The dispatcher pairs these registry outcomes with stable codes.
        assert_eq!(
            serde_json::to_value(ErrorCode::RoomNotFound).unwrap(),
            "ROOM_NOT_FOUND"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::InvalidPassword).unwrap(),
            "INVALID_PASSWORD"
        );
    }
}
