use crate::api::AppState;
use crate::api::dto::conversation::{ConversationDto, CreateConversationRequest, UpdateConversationRequest};
use crate::api::dto::message::{MessageDto, PageDto, PageQuery, ReadReceiptDto, SendMessageRequest};
use crate::api::middleware::AuthUser;
use crate::domain::conversation::ConversationStatus;
use crate::domain::message::{Draft, MessageCursor, MessageKind};
use crate::error::Result;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

/// Returns the conversation for `(buyer, seller, listing)`, creating it on first contact.
///
/// # Errors
/// Returns `AppError::Validation` when buyer and seller are the same user and
/// `AppError::AuthError` when the caller is neither of them.
pub async fn get_or_create(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .resolver
        .get_or_create(auth_user.user_id, payload.buyer_id, payload.seller_id, payload.listing_id)
        .await?;
    Ok(Json(ConversationDto::for_user(&conversation, auth_user.user_id)))
}

/// # Errors
/// Returns the storage error.
pub async fn list(auth_user: AuthUser, State(state): State<AppState>) -> Result<impl IntoResponse> {
    let conversations = state.messaging.list_conversations(auth_user.user_id).await?;
    let body: Vec<ConversationDto> =
        conversations.iter().map(|c| ConversationDto::for_user(c, auth_user.user_id)).collect();
    Ok(Json(body))
}

/// # Errors
/// Returns `AppError::NotFound` or `AppError::Forbidden` for conversations the caller cannot see.
pub async fn get(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let conversation = state.messaging.conversation(auth_user.user_id, conversation_id).await?;
    Ok(Json(ConversationDto::for_user(&conversation, auth_user.user_id)))
}

/// # Errors
/// Returns `AppError::Validation` for an unknown status.
pub async fn update(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<UpdateConversationRequest>,
) -> Result<impl IntoResponse> {
    let status: ConversationStatus = payload.status.parse()?;
    let conversation = state.messaging.set_status(auth_user.user_id, conversation_id, status).await?;
    Ok(Json(ConversationDto::for_user(&conversation, auth_user.user_id)))
}

/// One page of history, oldest first. `before` takes the `nextCursor` of the previous page.
///
/// # Errors
/// Returns `AppError::Validation` for a malformed cursor.
pub async fn list_messages(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let before = query.before.as_deref().map(str::parse::<MessageCursor>).transpose()?;
    let page = state.messaging.load_messages(auth_user.user_id, conversation_id, before, query.limit).await?;
    Ok(Json(PageDto::from(&page)))
}

/// # Errors
/// Returns `AppError::Validation` for blank, oversized or malformed messages and for blocked conversations.
pub async fn send_message(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    let kind = MessageKind::from_parts(&payload.message_type, payload.metadata)?;
    let mut draft = Draft::new(&payload.content, kind, state.config.messaging.max_content_length)?;
    if let Some(client_id) = payload.client_message_id {
        draft = draft.with_client_id(client_id);
    }

    let sent = state.messaging.send_message(auth_user.user_id, conversation_id, draft).await?;
    Ok((StatusCode::CREATED, Json(MessageDto::from(&sent.message))))
}

/// # Errors
/// Returns `AppError::NotFound` or `AppError::Forbidden` for conversations the caller cannot see.
pub async fn mark_read(
    auth_user: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let receipt = state.tracker.mark_read(conversation_id, auth_user.user_id).await?;
    Ok(Json(ReadReceiptDto::from(&receipt)))
}
