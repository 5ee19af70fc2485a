//! JSON API for journey management, tracking and the timeline.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`;
//! the token is resolved through the identity verifier, never trusted as a
//! user id.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use convoy_core::{
    ConvoyError, Coordinates, GroupJourney, JourneyInstance, LocationReport, MemberIdentity,
    MemberSnapshot, MemberState, NewEvent, NewJourney, Page, PublishOutcome, RideEvent,
};

use crate::handlers::{parse_id, AppState};
use crate::metrics;

type ApiResult<T> = Result<T, ApiError>;

/// Error body returned by every route: `{kind, code, message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    code: u16,
    message: String,
}

impl ApiError {
    fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthenticated",
            code: 1401,
            message: "missing or invalid bearer token".into(),
        }
    }
}

impl From<ConvoyError> for ApiError {
    fn from(error: ConvoyError) -> Self {
        let kind = error.kind();
        let status = match kind {
            convoy_core::ErrorKind::Validation => StatusCode::BAD_REQUEST,
            convoy_core::ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            convoy_core::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            convoy_core::ErrorKind::Conflict => StatusCode::CONFLICT,
            convoy_core::ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            convoy_core::ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };
        Self {
            status,
            kind: kind.as_str(),
            code: kind.code(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.kind);
        let body = Json(json!({
            "kind": self.kind,
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// The authenticated caller.
pub struct Caller(pub MemberIdentity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(ApiError::unauthenticated)?;

        state
            .verify_token(token)
            .await?
            .map(Caller)
            .ok_or_else(ApiError::unauthenticated)
    }
}

/// API routes, to be merged into the server router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/journeys", post(create_journey))
        .route("/journeys/:id", get(get_journey))
        .route("/journeys/:id/end", post(end_journey))
        .route("/journeys/:id/cancel", post(cancel_journey))
        .route("/groups/:id/journeys", get(group_journeys))
        .route("/journeys/:id/instances", post(start_instance))
        .route("/instances/:id/location", post(update_location))
        .route("/instances/:id/pause", post(pause_instance))
        .route("/instances/:id/resume", post(resume_instance))
        .route("/instances/:id/complete", post(complete_instance))
        .route("/journeys/:id/snapshot", get(snapshot))
        .route("/journeys/:id/members/:user", get(member_state))
        .route("/journeys/:id/events", post(append_event).get(list_events))
}

async fn create_journey(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Json(request): Json<NewJourney>,
) -> ApiResult<(StatusCode, Json<GroupJourney>)> {
    let journey = state
        .convoy
        .start_group_journey(&caller.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(journey)))
}

async fn get_journey(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<GroupJourney>> {
    let journey_id = parse_id(&id, "journey")?;
    Ok(Json(state.convoy.journey(journey_id, &caller.user_id).await?))
}

async fn end_journey(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<GroupJourney>> {
    let journey_id = parse_id(&id, "journey")?;
    Ok(Json(
        state
            .convoy
            .admin_end_journey(journey_id, &caller.user_id)
            .await?,
    ))
}

async fn cancel_journey(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<GroupJourney>> {
    let journey_id = parse_id(&id, "journey")?;
    Ok(Json(
        state
            .convoy
            .cancel_journey(journey_id, &caller.user_id)
            .await?,
    ))
}

async fn group_journeys(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(group_id): Path<String>,
) -> ApiResult<Json<Vec<GroupJourney>>> {
    Ok(Json(
        state
            .convoy
            .journeys_for_group(&group_id, &caller.user_id)
            .await?,
    ))
}

async fn start_instance(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(start): Json<Coordinates>,
) -> ApiResult<(StatusCode, Json<JourneyInstance>)> {
    let journey_id = parse_id(&id, "journey")?;
    let instance = state
        .convoy
        .start_member_instance(journey_id, &caller.user_id, start)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(report): Json<LocationReport>,
) -> ApiResult<Response> {
    let instance_id = parse_id(&id, "instance")?;
    let outcome = state
        .convoy
        .update_location(instance_id, &caller.user_id, report)
        .await
        .map_err(|e| {
            metrics::record_location_rejected();
            ApiError::from(e)
        })?;
    metrics::record_location_update(&outcome);

    let response = match outcome {
        PublishOutcome::Accepted { patch, recipients } => Json(json!({
            "outcome": "accepted",
            "patch": patch,
            "recipients": recipients,
        }))
        .into_response(),
        PublishOutcome::Filtered => Json(json!({ "outcome": "filtered" })).into_response(),
        PublishOutcome::Throttled { retry_after } => {
            let retry_after_ms = retry_after.as_millis() as u64;
            debug!(instance = %instance_id, retry_after_ms, "Location update throttled");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "outcome": "throttled",
                    "retry_after_ms": retry_after_ms,
                })),
            )
                .into_response();
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
            response
        }
    };
    Ok(response)
}

async fn pause_instance(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<JourneyInstance>> {
    let instance_id = parse_id(&id, "instance")?;
    Ok(Json(
        state
            .convoy
            .pause_instance(instance_id, &caller.user_id)
            .await?,
    ))
}

async fn resume_instance(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<JourneyInstance>> {
    let instance_id = parse_id(&id, "instance")?;
    Ok(Json(
        state
            .convoy
            .resume_instance(instance_id, &caller.user_id)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    end: Option<Coordinates>,
}

async fn complete_instance(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: Option<Json<CompleteRequest>>,
) -> ApiResult<Json<JourneyInstance>> {
    let instance_id = parse_id(&id, "instance")?;
    let Json(request) = body.unwrap_or_default();
    Ok(Json(
        state
            .convoy
            .complete_instance(instance_id, &caller.user_id, request.end)
            .await?,
    ))
}

async fn snapshot(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<MemberSnapshot>> {
    let journey_id = parse_id(&id, "journey")?;
    metrics::record_snapshot_request();
    Ok(Json(state.convoy.snapshot(journey_id, &caller.user_id).await?))
}

async fn member_state(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<MemberState>> {
    let journey_id = parse_id(&id, "journey")?;
    state
        .convoy
        .member_state(journey_id, &caller.user_id, &user_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ConvoyError::NotFound(format!("{user_id} has no instance in journey {journey_id}"))
                .into()
        })
}

async fn append_event(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(event): Json<NewEvent>,
) -> ApiResult<(StatusCode, Json<RideEvent>)> {
    let journey_id = parse_id(&id, "journey")?;
    let event = state
        .convoy
        .append_event(journey_id, &caller.user_id, event)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<RideEvent>>> {
    let journey_id = parse_id(&id, "journey")?;
    let page = Page::new(
        query.offset.unwrap_or(0),
        query.limit.unwrap_or(Page::DEFAULT_LIMIT),
    );
    Ok(Json(
        state
            .convoy
            .list_events(journey_id, &caller.user_id, page)
            .await?,
    ))
}
