use crate::auth::{self, Claims};
use crate::config::Config;
use crate::conversations;
use crate::error::ChatError;
use crate::fanout::{self, Event};
use crate::messages::{self, HistoryPage, ReadReceipt};
use crate::model::{
    Conversation, ConversationSummary, ConversationType, Message, MessageStatus, MessageType,
    OnlineStatus, Role, UserPresence, UserRecord,
};
use crate::permissions::DbFamilyPolicy;
use crate::presence::PresenceTracker;
use crate::registry::Registry;
use crate::store::{self, Store};
use crate::typing::TypingTracker;
use crate::ws;
use anyhow::Result;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingTracker>,
    pub events: mpsc::Sender<Event>,
    pub config: Config,
    pub jwt_secret: Vec<u8>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = Arc::new(Store::open(config.data_dir.join("chat.db"))?);
        let jwt_secret =
            auth::load_or_generate_secret(config.jwt_secret.as_deref(), &config.data_dir)?;
        let registry = Arc::new(Registry::new(
            config.device_limit,
            config.send_queue_capacity,
        ));
        let presence = Arc::new(PresenceTracker::new());
        let typing = Arc::new(TypingTracker::new(config.typing_debounce()));
        let (events, rx) = mpsc::channel(256);
        fanout::spawn_dispatcher(registry.clone(), store.clone(), rx);
        ws::spawn_heartbeat_reaper(registry.clone(), config.heartbeat_interval(), config.heartbeat_deadline());
        Ok(Self {
            store,
            registry,
            presence,
            typing,
            events,
            config,
            jwt_secret,
        })
    }

    pub(crate) async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("event dispatcher is gone, dropping event");
        }
    }

    /// Vet, persist and fan out one message. Used by both the socket
    /// handler and the REST surface.
    pub async fn accept_message(
        &self,
        sender: &UserRecord,
        conversation_id: Uuid,
        content: String,
        message_type: MessageType,
        reply_to: Option<Uuid>,
        client_key: Option<String>,
    ) -> Result<Message, ChatError> {
        let sender_id = sender.id.clone();
        let participants = self
            .store
            .read(move |conn| {
                let policy = DbFamilyPolicy { conn };
                conversations::vet_send(conn, &conversation_id, &sender_id, &policy)
            })
            .await?;
        let sender = sender.clone();
        let message = self
            .store
            .write(move |conn| {
                messages::send_message(
                    conn,
                    &conversation_id,
                    &sender,
                    &content,
                    message_type,
                    reply_to.as_ref(),
                    client_key.as_deref(),
                )
            })
            .await?;
        self.emit(Event::Message {
            message: message.clone(),
            participants,
        })
        .await;
        Ok(message)
    }

    pub async fn accept_mark_read(
        &self,
        user_id: &str,
        conversation_id: Uuid,
        up_to: Option<Uuid>,
    ) -> Result<ReadReceipt, ChatError> {
        let uid = user_id.to_string();
        let receipt = self
            .store
            .write(move |conn| messages::mark_read(conn, &conversation_id, &uid, up_to.as_ref()))
            .await?;
        self.emit(Event::Read {
            conversation_id,
            message_id: receipt.up_to,
            user_id: receipt.user_id.clone(),
            read_at: receipt.read_at,
            participants: receipt.participants.clone(),
        })
        .await;
        Ok(receipt)
    }

    pub async fn accept_typing(
        &self,
        user_id: &str,
        conversation_id: Uuid,
    ) -> Result<(), ChatError> {
        let uid = user_id.to_string();
        let participants = self
            .store
            .read(move |conn| {
                let policy = DbFamilyPolicy { conn };
                conversations::vet_send(conn, &conversation_id, &uid, &policy)
            })
            .await?;
        if self.typing.typing(user_id, conversation_id) {
            self.emit(Event::Typing {
                conversation_id,
                user_id: user_id.to_string(),
                participants,
            })
            .await;
        }
        Ok(())
    }

    pub async fn accept_status(&self, user_id: &str, status: OnlineStatus) {
        if let Some(applied) = self.presence.set_status(user_id, status) {
            let (_, last_seen) = self.presence.status_of(user_id);
            self.emit(Event::Presence {
                user_id: user_id.to_string(),
                status: applied,
                last_seen,
            })
            .await;
        }
    }

    pub async fn create_conversation(
        &self,
        creator: &UserRecord,
        participant_ids: Vec<String>,
        kind: ConversationType,
    ) -> Result<Conversation, ChatError> {
        let mut ids = participant_ids;
        ids.push(creator.id.clone());
        ids.sort();
        ids.dedup();
        let vet_ids = ids.clone();
        self.store
            .read(move |conn| {
                let policy = DbFamilyPolicy { conn };
                conversations::vet_participants(conn, &vet_ids, kind, &policy).map(|_| ())
            })
            .await?;
        let creator_id = creator.id.clone();
        self.store
            .write(move |conn| conversations::create_conversation(conn, &creator_id, &ids, kind))
            .await
    }

    pub async fn edit_message(
        &self,
        editor: &str,
        message_id: Uuid,
        content: String,
    ) -> Result<Message, ChatError> {
        let editor = editor.to_string();
        let grace = self.config.edit_grace_secs;
        let message = self
            .store
            .write(move |conn| messages::edit_message(conn, &message_id, &editor, &content, grace))
            .await?;
        let conversation_id = message.conversation_id;
        let participants = self
            .store
            .read(move |conn| conversations::participants(conn, &conversation_id))
            .await?;
        self.emit(Event::MessageUpdated {
            message: message.clone(),
            participants,
        })
        .await;
        Ok(message)
    }

    pub async fn delete_message(
        &self,
        requester: &str,
        message_id: Uuid,
    ) -> Result<Message, ChatError> {
        let uid = requester.to_string();
        let message = self
            .store
            .write(move |conn| messages::delete_message(conn, &message_id, &uid))
            .await?;
        let conversation_id = message.conversation_id;
        let participants = self
            .store
            .read(move |conn| conversations::participants(conn, &conversation_id))
            .await?;
        self.emit(Event::MessageDeleted {
            conversation_id,
            message_id,
            participants,
        })
        .await;
        Ok(message)
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/messages/send", post(send_message))
        .route("/messages/history/:conversation_id", get(history))
        .route("/messages/mark-read/:message_id", post(mark_read))
        .route(
            "/messages/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/messages/conversations/:id/mute", post(set_muted))
        .route("/messages/conversations/:id/archive", post(set_archived))
        .route(
            "/messages/:message_id",
            patch(edit_message).delete(delete_message),
        )
        .route("/messages/online-users", get(online_users))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/ws/conversation/:id", get(ws::ws_conversation_handler));
    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .merge(ws_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if let Ok(claims) = auth::verify_jwt(&state.jwt_secret, token) {
                    let user = claims.to_user();
                    let upserted = state
                        .store
                        .write(move |conn| store::upsert_user(conn, &user))
                        .await;
                    if upserted.is_ok() {
                        req.extensions_mut().insert(claims);
                        return Ok(next.run(req).await);
                    }
                }
            }
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Serialize, ToSchema)]
struct ErrorResp {
    error: String,
}

fn err(e: ChatError) -> (StatusCode, Json<ErrorResp>) {
    (
        e.status(),
        Json(ErrorResp {
            error: e.code().into(),
        }),
    )
}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize, ToSchema)]
pub struct SendMessageReq {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub client_key: Option<String>,
}

#[utoipa::path(post, path = "/messages/send", request_body = SendMessageReq,
    responses((status = 200, body = Message), (status = 403, body = ErrorResp)))]
async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let user = claims.to_user();
    let message = state
        .accept_message(
            &user,
            req.conversation_id,
            req.content,
            req.message_type,
            req.reply_to,
            req.client_key,
        )
        .await
        .map_err(err)?;
    Ok((StatusCode::OK, Json(message)))
}

#[derive(Deserialize, IntoParams)]
pub struct HistoryQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[utoipa::path(get, path = "/messages/history/{conversation_id}", params(HistoryQuery),
    responses((status = 200, body = HistoryPage), (status = 403, body = ErrorResp)))]
async fn history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let grace = state.config.edit_grace_secs;
    let page = state
        .store
        .read(move |conn| {
            messages::history(
                conn,
                &conversation_id,
                &claims.sub,
                query.cursor.as_deref(),
                query.limit.unwrap_or(50),
                grace,
            )
        })
        .await
        .map_err(err)?;
    Ok(Json(page))
}

#[utoipa::path(post, path = "/messages/mark-read/{message_id}",
    responses((status = 200, body = ReadReceipt), (status = 404, body = ErrorResp)))]
async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let message = state
        .store
        .read(move |conn| messages::get_message(conn, &message_id))
        .await
        .map_err(err)?
        .ok_or_else(|| err(ChatError::NotFound))?;
    let receipt = state
        .accept_mark_read(&claims.sub, message.conversation_id, Some(message_id))
        .await
        .map_err(err)?;
    Ok(Json(receipt))
}

#[utoipa::path(get, path = "/messages/conversations",
    responses((status = 200, body = [ConversationSummary])))]
async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let summaries = state
        .store
        .read(move |conn| conversations::list_for_user(conn, &claims.sub))
        .await
        .map_err(err)?;
    Ok(Json(summaries))
}

fn default_conversation_type() -> ConversationType {
    ConversationType::Direct
}

#[derive(Deserialize, ToSchema)]
pub struct CreateConversationReq {
    pub participants: Vec<String>,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
}

#[utoipa::path(post, path = "/messages/conversations", request_body = CreateConversationReq,
    responses((status = 200, body = Conversation), (status = 400, body = ErrorResp)))]
async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let user = claims.to_user();
    let conversation = state
        .create_conversation(&user, req.participants, req.conversation_type)
        .await
        .map_err(err)?;
    Ok(Json(conversation))
}

#[derive(Deserialize, ToSchema)]
pub struct MuteReq {
    pub muted: bool,
}

#[utoipa::path(post, path = "/messages/conversations/{id}/mute", request_body = MuteReq,
    responses((status = 200, description = "Flag updated"), (status = 403, body = ErrorResp)))]
async fn set_muted(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<MuteReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    state
        .store
        .write(move |conn| conversations::set_muted(conn, &id, &claims.sub, req.muted))
        .await
        .map_err(err)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize, ToSchema)]
pub struct ArchiveReq {
    pub archived: bool,
}

#[utoipa::path(post, path = "/messages/conversations/{id}/archive", request_body = ArchiveReq,
    responses((status = 200, description = "Flag updated"), (status = 403, body = ErrorResp)))]
async fn set_archived(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<ArchiveReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    state
        .store
        .write(move |conn| conversations::set_archived(conn, &id, &claims.sub, req.archived))
        .await
        .map_err(err)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize, ToSchema)]
pub struct EditMessageReq {
    pub content: String,
}

#[utoipa::path(patch, path = "/messages/{message_id}", request_body = EditMessageReq,
    responses((status = 200, body = Message), (status = 403, body = ErrorResp)))]
async fn edit_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageReq>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let message = state
        .edit_message(&claims.sub, message_id, req.content)
        .await
        .map_err(err)?;
    Ok(Json(message))
}

#[utoipa::path(delete, path = "/messages/{message_id}",
    responses((status = 200, body = Message), (status = 403, body = ErrorResp)))]
async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let message = state
        .delete_message(&claims.sub, message_id)
        .await
        .map_err(err)?;
    Ok(Json(message))
}

#[utoipa::path(get, path = "/messages/online-users",
    responses((status = 200, body = [UserPresence])))]
async fn online_users(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResp>)> {
    let snapshot = state.presence.online_snapshot();
    let users = state
        .store
        .read(move |conn| {
            let mut out = Vec::new();
            for (id, status, last_seen) in &snapshot {
                if let Some(user) = store::get_user(conn, id)? {
                    out.push(UserPresence {
                        user_id: user.id,
                        username: user.username,
                        display_name: user.display_name,
                        role: user.role,
                        online_status: *status,
                        last_seen: *last_seen,
                    });
                }
            }
            Ok(out)
        })
        .await
        .map_err(err)?;
    Ok(Json(users))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        send_message,
        history,
        mark_read,
        list_conversations,
        create_conversation,
        set_muted,
        set_archived,
        edit_message,
        delete_message,
        online_users
    ),
    components(schemas(
        SendMessageReq,
        CreateConversationReq,
        MuteReq,
        ArchiveReq,
        EditMessageReq,
        ErrorResp,
        Message,
        Conversation,
        ConversationSummary,
        UserPresence,
        UserRecord,
        Role,
        MessageType,
        MessageStatus,
        OnlineStatus,
        ConversationType,
        HistoryPage,
        ReadReceipt
    ))
)]
struct ApiDoc;

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    tracing::info!(%addr, "messaging service listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
