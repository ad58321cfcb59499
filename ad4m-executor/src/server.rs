use std::sync::Arc;

use ad4m_core::{
    Ad4mCore, AgentImport, CapabilityRequest, ContentLanguage, CoreError, LanguageInfo, Link, LinkInput, LinkQuery,
    LocalNeighbourhood, NeighbourhoodHub, Subscription, Topic,
};
use ad4m_types::Address;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{ApiError, Credential},
    config::{ExecutorConfig, LanguageConfig},
};

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Ad4mCore>,
}

pub async fn serve(config: ExecutorConfig) -> Result<()> {
    let core = Arc::new(Ad4mCore::open(config.core.clone()).await?);
    install_languages(&core, &config.languages).await?;

    let app = router(AppState { core: core.clone() });

    info!(addr = %config.listen_addr, "ad4m-executor listening");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    core.shutdown();
    Ok(())
}

/// Install the languages named in the config.
pub async fn install_languages(core: &Ad4mCore, languages: &[LanguageConfig]) -> Result<()> {
    for language in languages {
        match language {
            LanguageConfig::Content { id, scheme } => {
                core.install_language(Arc::new(ContentLanguage::new(id.clone(), *scheme)))
                    .await?;
            }
            LanguageConfig::Neighbourhood { id } => {
                core.install_language(Arc::new(LocalNeighbourhood::join(id.clone(), NeighbourhoodHub::new())))
                    .await?;
            }
        }
        debug!(language = %language.id(), "configured language installed");
    }
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Public endpoints (no auth required)
        .route("/healthz", get(healthz))
        .route("/api/capabilities/request", post(request_capability))
        .route("/api/capabilities/redeem", post(redeem_capability))
        // Authenticated endpoints
        .route("/api/capabilities/apps", get(apps))
        .route("/api/capabilities/{id}/permit", post(permit_capability))
        .route("/api/agent", get(get_agent))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/initialize", post(initialize_agent))
        .route("/api/agent/lock", post(lock_agent))
        .route("/api/agent/unlock", post(unlock_agent))
        .route("/api/agent/profile", post(update_agent_profile))
        .route("/api/agent/keystore", get(export_keystore))
        .route("/api/agents/{did}", get(agent_by_did))
        .route("/api/languages", get(list_languages))
        .route("/api/languages/{id}", get(get_language))
        .route("/api/languages/{id}/settings", axum::routing::put(write_language_settings))
        .route("/api/expressions", post(create_expression))
        .route("/api/expressions/{*address}", get(get_expression))
        .route("/api/perspectives", get(list_perspectives).post(create_perspective))
        .route(
            "/api/perspectives/{uuid}",
            get(get_perspective).patch(update_perspective).delete(remove_perspective),
        )
        .route("/api/perspectives/{uuid}/snapshot", get(perspective_snapshot))
        .route(
            "/api/perspectives/{uuid}/links",
            post(add_link).put(update_link).delete(remove_link),
        )
        .route("/api/perspectives/{uuid}/links/query", post(query_links))
        .route("/api/perspectives/{uuid}/publish", post(publish_perspective))
        .route("/api/neighbourhoods/join", post(join_neighbourhood))
        .route("/ws/subscribe/{topic}", get(ws_subscribe))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    Address::parse(raw).map_err(|e| ApiError::Core(e.into()))
}

// Capabilities

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestIdResponse {
    request_id: String,
}

async fn request_capability(
    State(state): State<AppState>,
    Json(request): Json<CapabilityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state.core.request_capability(request).await?;
    Ok((StatusCode::CREATED, Json(RequestIdResponse { request_id })))
}

async fn permit_capability(
    Path(request_id): Path<String>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    let code = state.core.permit_capability(&credential, &request_id).await?;
    Ok(Json(json!({ "code": code })))
}

#[derive(Deserialize)]
struct RedeemRequest {
    code: String,
}

async fn redeem_capability(
    State(state): State<AppState>,
    Json(payload): Json<RedeemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.generate_jwt(&payload.code).await?))
}

async fn apps(State(state): State<AppState>, Credential(credential): Credential) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.apps(&credential)?))
}

// Agent

async fn get_agent(
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.get_agent(&credential)?))
}

async fn agent_status(
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.get_agent_status(&credential)?))
}

#[derive(Deserialize)]
struct InitializeRequest {
    passphrase: String,
    #[serde(default)]
    did: Option<String>,
    #[serde(default)]
    keystore: Option<String>,
}

async fn initialize_agent(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<InitializeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let import = match (payload.did, payload.keystore) {
        (Some(did), Some(keystore)) => Some(AgentImport { did, keystore }),
        (None, None) => None,
        _ => return Err(ApiError::BadRequest("did and keystore go together".into())),
    };
    let status = state
        .core
        .initialize_agent(&credential, &payload.passphrase, import)
        .await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct PassphraseRequest {
    passphrase: String,
}

async fn lock_agent(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<PassphraseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.lock_agent(&credential, &payload.passphrase).await?))
}

async fn unlock_agent(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<PassphraseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.unlock_agent(&credential, &payload.passphrase).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest {
    #[serde(default)]
    perspective: Option<Address>,
    #[serde(default)]
    direct_message_language: Option<Address>,
}

async fn update_agent_profile(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<ProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.perspective.is_none() && payload.direct_message_language.is_none() {
        return Err(ApiError::BadRequest("nothing to update".into()));
    }
    let mut agent = None;
    if let Some(perspective) = payload.perspective {
        agent = Some(state.core.update_agent_public_perspective(&credential, perspective).await?);
    }
    if let Some(language) = payload.direct_message_language {
        agent = Some(
            state
                .core
                .update_agent_direct_message_language(&credential, language)
                .await?,
        );
    }
    Ok(Json(agent))
}

async fn export_keystore(
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({ "keystore": state.core.export_keystore(&credential)? })))
}

async fn agent_by_did(
    Path(did): Path<String>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    match state.core.agent_by_did(&credential, &did).await? {
        Some(agent) => Ok(Json(agent)),
        None => Err(CoreError::NotFound(format!("agent {did}")).into()),
    }
}

// Languages

#[derive(Deserialize)]
struct LanguageFilter {
    interface: Option<String>,
}

async fn list_languages(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Query(filter): Query<LanguageFilter>,
) -> Result<Json<Vec<LanguageInfo>>, ApiError> {
    Ok(Json(state.core.languages(&credential, filter.interface.as_deref())?))
}

async fn get_language(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<Json<LanguageInfo>, ApiError> {
    Ok(Json(state.core.language(&credential, &id)?))
}

async fn write_language_settings(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(settings): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    state.core.write_language_settings(&credential, &id, settings).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Expressions

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateExpressionRequest {
    language_id: String,
    data: Value,
}

async fn create_expression(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<CreateExpressionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let address = state
        .core
        .create_expression(&credential, &payload.language_id, payload.data)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "address": address }))))
}

async fn get_expression(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    let address = parse_address(&raw)?;
    match state.core.get_expression(&credential, &address).await? {
        Some(expression) => Ok(Json(expression)),
        None => Err(CoreError::NotFound(format!("expression {address}")).into()),
    }
}

// Perspectives

async fn list_perspectives(
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.list_perspectives(&credential)?))
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

async fn create_perspective(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.core.create_perspective(&credential, &payload.name).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

async fn get_perspective(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.get_perspective(&credential, uuid)?))
}

async fn perspective_snapshot(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.perspective_snapshot(&credential, uuid)?))
}

async fn update_perspective(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.update_perspective(&credential, uuid, &payload.name).await?))
}

async fn remove_perspective(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
) -> Result<impl IntoResponse, ApiError> {
    state.core.remove_perspective(&credential, uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_link(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(link): Json<LinkInput>,
) -> Result<impl IntoResponse, ApiError> {
    let link = state.core.add_link(&credential, uuid, link).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLinkRequest {
    old_link: Link,
    new_link: LinkInput,
}

async fn update_link(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<UpdateLinkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .core
            .update_link(&credential, uuid, &payload.old_link, payload.new_link)
            .await?,
    ))
}

async fn remove_link(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(link): Json<Link>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.core.remove_link(&credential, uuid, &link).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn query_links(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(query): Json<LinkQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.query_links(&credential, uuid, &query)?))
}

// Neighbourhoods

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    link_language: String,
    #[serde(default)]
    meta: Vec<Link>,
}

async fn publish_perspective(
    Path(uuid): Path<Uuid>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = state
        .core
        .publish_perspective(&credential, uuid, &payload.link_language, payload.meta)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "url": url }))))
}

#[derive(Deserialize)]
struct JoinRequest {
    url: Address,
}

async fn join_neighbourhood(
    State(state): State<AppState>,
    Credential(credential): Credential,
    Json(payload): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.core.join_neighbourhood_from_url(&credential, &payload.url).await?))
}

// Subscriptions

#[derive(Deserialize)]
struct SubscribeParams {
    perspective: Option<Uuid>,
}

async fn ws_subscribe(
    Path(topic): Path<String>,
    Query(params): Query<SubscribeParams>,
    State(state): State<AppState>,
    Credential(credential): Credential,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let topic: Topic = topic.parse().map_err(ApiError::BadRequest)?;
    let subscription = state.core.subscribe(&credential, topic, params.perspective)?;

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = forward_events(socket, subscription).await {
            warn!(?err, "subscription socket ended with error");
        }
    }))
}

/// Push bus events to the socket until either side goes away.
async fn forward_events(mut socket: WebSocket, mut subscription: Subscription) -> Result<()> {
    let id = subscription.id();
    debug!(%id, topic = %subscription.topic(), "subscription socket open");

    loop {
        tokio::select! {
            event = subscription.next() => {
                match event {
                    Some(Ok(event)) => {
                        let text = serde_json::to_string(&event)?;
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let text = json!({ "type": "overflow", "error": err.to_string() }).to_string();
                        socket.send(WsMessage::Text(text.into())).await.ok();
                        break;
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    subscription.unsubscribe();
    socket.send(WsMessage::Close(None)).await.ok();
    debug!(%id, "subscription socket closed");
    Ok(())
}
