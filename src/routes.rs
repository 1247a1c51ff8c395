//! HTTP boundary: routing, the JSON envelope and request validation
//!
//! Success responses use the envelope `{"code": 200, "msg": "ok"}` with
//! optional `data` and `pagination`; failures come from
//! [`AppError::into_response`](crate::error::AppError).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{AppError, Result};
use crate::models::{
    CreateDelegationRequest, DelegationPreview, DelegationState, LoginRequest,
    QuestionnaireRecord, RegisterRequest, User,
};
use crate::session::{self, Identity, SESSION_COOKIE};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users", post(register))
        .route("/users/session", post(login))
        .route("/users/session", delete(logout))
        .route("/users/me", get(me))
        .route("/users/delegations", get(user_delegations))
        .route("/delegations", get(list_delegations))
        .route("/delegations", post(create_delegation))
        .route("/delegations/:id", get(get_delegation))
        .route("/delegations/:id/receive", post(receive_delegation))
        .route("/delegations/:id/cancel", post(cancel_delegation))
        .route("/delegations/:id/finish", post(finish_delegation))
        .route("/delegations/:id/questionnaire", get(questionnaire_preview))
        .route("/delegations/:id/questionnaire", post(fill_questionnaire))
        .route(
            "/delegations/:id/questionnaire/full",
            get(full_questionnaire),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// Envelope helpers

fn ok() -> Json<Value> {
    Json(json!({ "code": 200, "msg": "ok" }))
}

fn ok_data(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({ "code": 200, "msg": "ok", "data": data }))
}

fn ok_page(data: Vec<DelegationPreview>, page: i64, limit: i64, total: i64) -> Json<Value> {
    Json(json!({
        "code": 200,
        "msg": "ok",
        "data": data,
        "pagination": { "page": page, "limit": limit, "total": total },
    }))
}

fn user_info(user: &User) -> Value {
    json!({
        "name": user.name,
        "student_number": user.student_number,
        "credit": user.credit,
    })
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: i64,
    limit: i64,
    state: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserDelegationsQuery {
    page: i64,
    limit: i64,
    query_type: i64,
}

fn validate_page(page: i64, limit: i64) -> Result<()> {
    if page < 1 || limit < 1 {
        return Err(AppError::BadRequest("invalid_params".to_string()));
    }
    Ok(())
}

// Handlers

async fn health() -> &'static str {
    "ok"
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    let wx = state.wx.code_to_session(&body.code).await?;

    if state.store.get_user(&wx.openid).await?.is_some() {
        return Err(AppError::Auth("duplicated_user".to_string()));
    }
    if state
        .store
        .get_user_by_student_number(&body.student_number)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict("duplicated_student_num".to_string()));
    }

    state
        .store
        .create_user(&User {
            open_id: wx.openid,
            name: body.name,
            student_number: body.student_number,
            credit: 0,
        })
        .await?;

    Ok(ok())
}

async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    if let Some(token) = session::token_from_headers(&headers) {
        if state.sessions.resolve(&token).await.is_some() {
            return Err(AppError::Auth("already_login".to_string()));
        }
    }

    let wx = state.wx.code_to_session(&body.code).await?;
    let user = state
        .store
        .get_user(&wx.openid)
        .await?
        .ok_or_else(|| AppError::Auth("unregistered_user".to_string()))?;

    let token = state.sessions.open(&user.open_id).await;
    let cookie = format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token);

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        ok_data(user_info(&user)),
    ))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<Value>> {
    state.sessions.close(&identity.token).await;
    Ok(ok())
}

async fn me(State(state): State<Arc<AppState>>, identity: Identity) -> Result<Json<Value>> {
    let user = state
        .store
        .get_user(&identity.open_id)
        .await?
        .ok_or_else(|| AppError::NotFound("no_such_user".to_string()))?;
    Ok(ok_data(user_info(&user)))
}

async fn user_delegations(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<UserDelegationsQuery>,
) -> Result<Json<Value>> {
    validate_page(query.page, query.limit)?;
    let (previews, total) = match query.query_type {
        0 => {
            state
                .store
                .list_by_publisher(&identity.open_id, query.page, query.limit)
                .await?
        }
        1 => {
            state
                .store
                .list_by_receiver(&identity.open_id, query.page, query.limit)
                .await?
        }
        _ => return Err(AppError::BadRequest("invalid_query_type".to_string())),
    };
    Ok(ok_page(previews, query.page, query.limit, total))
}

async fn list_delegations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>> {
    validate_page(query.page, query.limit)?;
    let (previews, total) = match query.state {
        Some(code) => {
            let state_filter = DelegationState::from_code(code)
                .map_err(|_| AppError::BadRequest("invalid_params".to_string()))?;
            state
                .store
                .list_by_state(state_filter, query.page, query.limit)
                .await?
        }
        None => {
            state
                .store
                .list_open(query.page, query.limit, Utc::now().timestamp())
                .await?
        }
    };
    Ok(ok_page(previews, query.page, query.limit, total))
}

async fn get_delegation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let delegation = state.store.get_delegation(&id).await?;
    Ok(ok_data(delegation))
}

async fn create_delegation(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(body): Json<CreateDelegationRequest>,
) -> Result<Json<Value>> {
    let delegation = state.engine.create(&identity.open_id, &body).await?;
    Ok(ok_data(delegation))
}

async fn receive_delegation(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let delegation = state.engine.receive(&identity.open_id, &id).await?;
    Ok(ok_data(delegation))
}

async fn cancel_delegation(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let delegation = state.engine.cancel(&identity.open_id, &id).await?;
    Ok(ok_data(delegation))
}

async fn finish_delegation(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let delegation = state.engine.finish(&identity.open_id, &id).await?;
    Ok(ok_data(delegation))
}

async fn questionnaire_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let preview = state.engine.questionnaire_for_filling(&id).await?;
    Ok(ok_data(preview))
}

async fn full_questionnaire(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let questionnaire = state.engine.full_questionnaire(&identity.open_id, &id).await?;
    Ok(ok_data(questionnaire))
}

async fn fill_questionnaire(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<String>,
    Json(body): Json<QuestionnaireRecord>,
) -> Result<Json<Value>> {
    state
        .engine
        .fill_questionnaire(&identity.open_id, &id, &body)
        .await?;
    Ok(ok())
}
