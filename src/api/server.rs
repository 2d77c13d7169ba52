use super::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    AppState,
};
use crate::{
    attachment::Upload,
    chat::MessageWithAuthor,
    entity::{Chatroom, User},
    queue::Submission,
    store::Gateway,
};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let storage = ServeDir::new(&state.storage_dir);

    Router::new()
        .route("/api/user", get(current_user))
        .route("/api/chatrooms", get(list_chatrooms).post(create_chatroom))
        .route("/api/chatrooms/my", get(my_chatrooms))
        .route("/api/chatrooms/:chatroom/enter", post(enter_chatroom))
        .route("/api/chatrooms/:chatroom/leave", post(leave_chatroom))
        .route(
            "/api/chatrooms/:chatroom/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/chatrooms/:chatroom/events", get(chatroom_events))
        .nest_service("/storage", storage)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn current_user(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

async fn list_chatrooms(State(state): State<AppState>) -> ApiResult<Json<Vec<Chatroom>>> {
    Ok(Json(state.store.list_chatrooms().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateChatroom {
    pub name: String,
    pub max_members: i64,
}

impl CreateChatroom {
    fn validate(&self) -> ApiResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ApiError::Unprocessable("The name field is required.".into()));
        }
        if name.chars().count() > Chatroom::MAX_NAME_LEN {
            return Err(ApiError::Unprocessable(format!(
                "The name field must not be greater than {} characters.",
                Chatroom::MAX_NAME_LEN
            )));
        }
        if self.max_members < 1 {
            return Err(ApiError::Unprocessable(
                "The max_members field must be at least 1.".into(),
            ));
        }
        Ok(())
    }
}

#[axum::debug_handler]
async fn create_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    request: Result<Json<CreateChatroom>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Chatroom>)> {
    let Json(request) = request?;
    request.validate()?;

    let chatroom = Chatroom::new(request.name.trim(), request.max_members);
    state.store.create_chatroom(&chatroom).await?;

    info!(chatroom_id = %chatroom.id, created_by = %user.id, "chatroom created");
    Ok((StatusCode::CREATED, Json(chatroom)))
}

async fn my_chatrooms(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<Chatroom>>> {
    Ok(Json(state.store.chatrooms_for_user(&user.id).await?))
}

async fn enter_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let membership = state.admissions.join(&chatroom_id, &user.id).await?;
    Ok(Json(json!({
        "message": "Joined chatroom",
        "membership": membership,
    })))
}

async fn leave_chatroom(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.admissions.leave(&chatroom_id, &user.id).await?;
    Ok(Json(json!({ "message": "Left chatroom" })))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
    Path(chatroom_id): Path<String>,
) -> ApiResult<Json<Vec<MessageWithAuthor>>> {
    if state.store.get_chatroom(&chatroom_id).await?.is_none() {
        return Err(ApiError::NotFound("Chatroom not found".into()));
    }
    Ok(Json(state.store.list_messages(&chatroom_id).await?))
}

fn bad_multipart(e: MultipartError) -> ApiError {
    ApiError::BadRequest(e.body_text())
}

/// Accepts `message` and/or `attachment` as multipart form fields.
#[axum::debug_handler]
async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut multipart = multipart?;
    let mut text = None;
    let mut attachment = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" => text = Some(field.text().await.map_err(bad_multipart)?),
            "attachment" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                // Browsers send an empty part when no file was picked
                if !bytes.is_empty() {
                    attachment = Some(Upload {
                        file_name,
                        content_type,
                        bytes: bytes.to_vec(),
                    });
                }
            }
            other => warn!(field = other, "ignoring unknown form field"),
        }
    }

    let ticket = state
        .queue
        .submit(Submission {
            chatroom_id,
            author_id: user.id,
            text,
            attachment,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Message queued for processing",
            "status": "pending",
            "ticket": ticket,
        })),
    ))
}

/// Server-sent events for one chatroom channel, members only. The
/// subscription ends when the client disconnects.
async fn chatroom_events(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(chatroom_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::BoxError>>>> {
    let chatroom = state
        .store
        .get_chatroom(&chatroom_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Chatroom not found".into()))?;
    if !state.store.has_membership(&user.id, &chatroom.id).await? {
        return Err(ApiError::Forbidden("Not a member of this chatroom".into()));
    }

    let mut subscription = state.bus.subscribe(chatroom.channel());
    info!(channel = %subscription.channel(), user_id = %user.id, "SSE subscription established");

    let stream = async_stream::stream! {
        let subscribed = Event::default()
            .event("subscribed")
            .data(subscription.channel().to_string());
        yield Ok::<_, axum::BoxError>(subscribed);

        while let Some(notification) = subscription.recv().await {
            match serde_json::to_string(&notification.event) {
                Ok(data) => yield Ok(Event::default().event(notification.event.name()).data(data)),
                Err(e) => warn!(error = %e, "failed to encode event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
