use crate::api::AppState;
use crate::api::dto::message::{EditMessageRequest, MessageDto};
use crate::api::middleware::AuthUser;
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

/// Replaces the content of one of the caller's own messages.
///
/// # Errors
/// Returns `AppError::Forbidden` if the caller did not send it, `AppError::NotFound` if it is gone,
/// `AppError::Validation` for blank or oversized content.
pub async fn edit_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<EditMessageRequest>,
) -> Result<impl IntoResponse> {
    let message = state.messaging.edit_message(auth_user.user_id, message_id, &payload.content).await?;
    Ok(Json(MessageDto::from(&message)))
}

/// # Errors
/// Returns `AppError::Forbidden` if the caller did not send it, `AppError::NotFound` if it is gone.
pub async fn delete_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let message = state.messaging.delete_message(auth_user.user_id, message_id).await?;
    Ok(Json(MessageDto::from(&message)))
}
