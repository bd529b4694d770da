#![forbid(unsafe_code)]

// REST endpoint for pre-creating rooms ahead of the first join.

use crate::room::RegistryError;
use crate::signaling::SignalingServer;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_id: Option<String>,
    pub password: Option<String>,
    pub max_participants: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub creator_token: String,
}

#[derive(Debug)]
pub enum RoomApiError {
    InvalidRoomId,
    InvalidMaxParticipants,
    RoomExists,
    LimitReached,
}

impl IntoResponse for RoomApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            RoomApiError::InvalidRoomId => (StatusCode::BAD_REQUEST, "Invalid room id"),
            RoomApiError::InvalidMaxParticipants => {
                (StatusCode::BAD_REQUEST, "Invalid max participants")
            }
            RoomApiError::RoomExists => (StatusCode::CONFLICT, "Room id already exists"),
            RoomApiError::LimitReached => {
                (StatusCode::TOO_MANY_REQUESTS, "Pre-created room limit reached")
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// POST /api/rooms — body is optional; an empty request gets a generated
/// code and defaults. Responds 201 with the room id and creator token.
pub async fn create_room(
    State(server): State<SignalingServer>,
    body: Option<Json<CreateRoomRequest>>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), RoomApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(id) = req.room_id.as_deref() {
        if id.trim().is_empty() || id.len() > 128 {
            return Err(RoomApiError::InvalidRoomId);
        }
    }
    if req.max_participants == Some(0) {
        return Err(RoomApiError::InvalidMaxParticipants);
    }

    let (room_id, creator_token) = server
        .registry()
        .pre_create_room(req.room_id, req.password, req.max_participants)
        .await
        .map_err(|e| match e {
            RegistryError::RoomExists(_) => RoomApiError::RoomExists,
            RegistryError::LatentRoomLimit => RoomApiError::LimitReached,
            _ => RoomApiError::InvalidRoomId,
        })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id,
            creator_token,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_is_fully_optional() {
        let req: CreateRoomRequest = serde_json::from_str("{}").unwrap();
        assert!(req.room_id.is_none());
        assert!(req.password.is_none());
        assert!(req.max_participants.is_none());
    }

    #[test]
    fn response_uses_camel_case() {
        let resp = CreateRoomResponse {
            room_id: "PRE777".into(),
            creator_token: "tk-abc".into(),
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["roomId"], "PRE777");
        assert_eq!(value["creatorToken"], "tk-abc");
    }
}
