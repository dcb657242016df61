use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::events::GroupSummary;
use crate::engine::store::{DEFAULT_HISTORY_LIMIT, DEFAULT_SEARCH_LIMIT, StoreError, clamp_limit};
use crate::engine::validation::{validate_group_name, validate_password, validate_username};

use super::app_state::AppState;

const MAX_SEARCH_LIMIT: i64 = 100;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Reply body for the account and group mutation endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReply {
    pub ok: bool,
    pub message: String,
}

fn reply(status: StatusCode, ok: bool, message: impl Into<String>) -> Response {
    (
        status,
        Json(StatusReply {
            ok,
            message: message.into(),
        }),
    )
        .into_response()
}

fn rejected(message: impl Into<String>) -> Response {
    reply(StatusCode::BAD_REQUEST, false, message)
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::NotFound(what) => reply(StatusCode::NOT_FOUND, false, format!("{} not found", what)),
        StoreError::AlreadyExists(what) => {
            reply(StatusCode::CONFLICT, false, format!("{} already exists", what))
        }
        StoreError::InvalidCredentials => {
            reply(StatusCode::UNAUTHORIZED, false, "Invalid username or password")
        }
        other => {
            error!(error = %other, "store request failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, false, "Database error")
        }
    }
}

// ── Accounts ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// POST /api/register: create an account.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> Response {
    if let Err(e) = validate_username(&body.username) {
        return rejected(e);
    }
    if let Err(e) = validate_password(&body.password) {
        return rejected(e);
    }

    match state.store.create_user(&body.username, &body.password).await {
        Ok(()) => {
            info!(username = %body.username, "account registered");
            reply(StatusCode::CREATED, true, "Registration successful")
        }
        Err(e) => store_error(e),
    }
}

/// POST /api/login: check credentials before opening the duplex channel.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Credentials>,
) -> Response {
    match state.store.authenticate(&body.username, &body.password).await {
        Ok(()) => reply(StatusCode::OK, true, "Login successful"),
        Err(StoreError::InvalidCredentials) => {
            warn!(username = %body.username, "failed login");
            store_error(StoreError::InvalidCredentials)
        }
        Err(e) => store_error(e),
    }
}

// ── Groups ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub group_name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// POST /api/groups: create a group with its initial members.
pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupRequest>,
) -> Response {
    if let Err(e) = validate_group_name(&body.group_name) {
        return rejected(e);
    }
    for member in &body.members {
        match state.store.user_exists(member).await {
            Ok(true) => {}
            Ok(false) => return store_error(StoreError::NotFound(format!("user {}", member))),
            Err(e) => return store_error(e),
        }
    }

    if let Err(e) = state.store.create_group(&body.group_name, &body.members).await {
        return store_error(e);
    }

    info!(group = %body.group_name, members = body.members.len(), "group created");
    reply(
        StatusCode::CREATED,
        true,
        format!("Group {} created", body.group_name),
    )
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub username: String,
}

/// POST /api/groups/{name}/members: join a user to an existing group.
pub async fn add_group_member(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Response {
    match state.store.user_exists(&body.username).await {
        Ok(true) => {}
        Ok(false) => return store_error(StoreError::NotFound(format!("user {}", body.username))),
        Err(e) => return store_error(e),
    }

    match state.store.add_member(&group, &body.username).await {
        Ok(()) => reply(
            StatusCode::OK,
            true,
            format!("{} joined {}", body.username, group),
        ),
        Err(e) => store_error(e),
    }
}

/// GET /api/groups/{name}/members
pub async fn get_group_members(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Response {
    match state.store.group_members(&group).await {
        Ok(members) => Json(GroupSummary {
            name: group,
            members,
        })
        .into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

/// GET /api/groups/{name}/messages: newest first.
pub async fn get_group_history(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = clamp_limit(params.limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT);
    match state.store.group_exists(&group).await {
        Ok(true) => {}
        Ok(false) => return store_error(StoreError::NotFound(format!("group {}", group))),
        Err(e) => return store_error(e),
    }
    match state.store.group_history(&group, limit).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Users ───────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub users: Vec<String>,
    pub count: usize,
}

/// GET /api/users/online: answered from the live session registry.
pub async fn get_online_users(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.registry.list_online();
    Json(OnlineUsers {
        count: users.len(),
        users,
    })
}

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<i64>,
}

/// GET /api/users/search?q=&limit=
pub async fn search_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let limit = clamp_limit(params.limit, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT);
    match state.store.search_users(params.q.trim(), limit).await {
        Ok(users) => Json(users).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/users/{name}/groups
pub async fn get_user_groups(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Response {
    match state.store.user_groups(&username).await {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Private history ─────────────────────────────────────

#[derive(Deserialize)]
pub struct PrivateHistoryParams {
    pub user: String,
    pub peer: String,
    pub limit: Option<i64>,
}

/// GET /api/messages/private?user=&peer=&limit=: newest first.
pub async fn get_private_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PrivateHistoryParams>,
) -> Response {
    let limit = clamp_limit(params.limit, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT);
    match state
        .store
        .private_history(&params.user, &params.peer, limit)
        .await
    {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error(e),
    }
}
