use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use diesel::SqliteConnection;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::accounts::{
    admin_login, create_profile, issue_session, register_device, resolve_session, revoke_token,
    set_availability, set_push_token, SessionContext,
};
use crate::announcements::{create_announcement, list_announcements};
use crate::error::Error;
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::lifecycle::{
    cancel_request, claim_request, create_request, expire_request, get_request, list_fulfilled,
    list_pending, list_requests_by_requester, resolve_request,
};
use crate::model::{
    Announcement, CreateRequestBody, DeviceToken, Division, Field, GameView, NewProfile, Player,
    Pool, Profile, Request, RequestKind, RequestPayload, Round, Score, ScoreUpdate, StaffRole,
    Team,
};
use crate::notify::{
    all_recipients, dispatch_announcement, dispatch_request, recipients_for_kind, FanOutReport,
    PushTransport,
};
use crate::schedule::{
    get_field, get_game, get_roster, list_divisions, list_fields, list_pools, list_rounds,
    list_schedule, list_teams, upsert_score, ScheduleFilter,
};
use crate::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub admin_password: Arc<str>,
    pub transport: Arc<dyn PushTransport>,
    pub feed: ChangeFeed,
}

impl AppState {
    pub fn new(pool: DbPool, admin_password: &str, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            pool,
            admin_password: Arc::from(admin_password),
            transport,
            feed: ChangeFeed::default(),
        }
    }
}

/// Runs blocking diesel work on a pooled connection off the async runtime.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, Error>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

impl FromRequestParts<AppState> for SessionContext {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Ok(SessionContext::anonymous());
        };
        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(Error::Unauthorized)?
            .to_string();

        with_conn(&state.pool, move |conn| resolve_session(conn, &token)).await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/profiles", post(new_profile))
        .route("/admin/profiles/{id}/session", post(new_session))
        .route("/admin/games/{id}/score", put(enter_score))
        .route("/admin/announcements", post(announce))
        .route("/admin/requests/{kind}/{id}/notify", post(renotify))
        .route("/me", get(me))
        .route("/me/availability", put(update_availability))
        .route("/me/push-token", put(update_push_token))
        .route("/devices", post(new_device))
        .route("/announcements", get(announcements))
        .route("/divisions", get(divisions))
        .route("/pools", get(pools))
        .route("/rounds", get(rounds))
        .route("/fields", get(fields))
        .route("/teams", get(teams))
        .route("/teams/{id}/roster", get(roster))
        .route("/schedule", get(schedule))
        .route("/games/{id}", get(game))
        .route("/requests/mine", get(my_requests))
        .route("/requests/{kind}", post(new_request))
        .route("/requests/{kind}/pending", get(pending_requests))
        .route("/requests/{kind}/fulfilled", get(fulfilled_requests))
        .route("/requests/{kind}/{id}", get(request_detail))
        .route("/requests/{kind}/{id}/claim", post(claim))
        .route("/requests/{kind}/{id}/resolve", post(resolve))
        .route("/requests/{kind}/{id}/expire", post(expire))
        .route("/requests/{kind}/{id}/cancel", post(cancel))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = state
        .feed
        .stream()
        .map(|change| Event::default().event(change.table).json_data(&change));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// Admin

#[derive(Deserialize)]
pub struct LoginBody {
    pub password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, Error> {
    let expected = state.admin_password.clone();
    let token =
        with_conn(&state.pool, move |conn| admin_login(conn, &body.password, &expected)).await?;
    Ok(Json(json!({ "token": token })))
}

async fn logout(State(state): State<AppState>, ctx: SessionContext) -> Result<StatusCode, Error> {
    let token = ctx.token.ok_or(Error::Unauthorized)?;
    with_conn(&state.pool, move |conn| revoke_token(conn, &token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn new_profile(
    State(state): State<AppState>,
    ctx: SessionContext,
    Json(body): Json<NewProfile>,
) -> Result<(StatusCode, Json<Profile>), Error> {
    ctx.require_admin()?;
    let profile = with_conn(&state.pool, move |conn| create_profile(conn, &body)).await?;
    state.feed.publish(ChangeEvent::new("profiles", profile.id));
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn new_session(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(profile_id): Path<i32>,
) -> Result<Json<Value>, Error> {
    ctx.require_admin()?;
    let token = with_conn(&state.pool, move |conn| issue_session(conn, profile_id)).await?;
    Ok(Json(json!({ "profile_id": profile_id, "token": token })))
}

async fn enter_score(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path(game_id): Path<i32>,
    Json(update): Json<ScoreUpdate>,
) -> Result<Json<Score>, Error> {
    ctx.require_admin()?;
    let score = with_conn(&state.pool, move |conn| upsert_score(conn, game_id, &update)).await?;
    state.feed.publish(ChangeEvent::new("scores", score.id));
    Ok(Json(score))
}

#[derive(Deserialize)]
pub struct AnnouncementBody {
    pub title: String,
    pub body: String,
}

fn report_response(result: Result<FanOutReport, Error>) -> Response {
    match result {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            warn!(error = %e, "fan-out aborted");
            (e.status(), Json(FanOutReport::failed(&e))).into_response()
        }
    }
}

async fn announce(
    State(state): State<AppState>,
    ctx: SessionContext,
    Json(body): Json<AnnouncementBody>,
) -> Response {
    let result = async {
        ctx.require_admin()?;
        let (announcement, tokens) = with_conn(&state.pool, move |conn| {
            let announcement = create_announcement(conn, &body.title, &body.body)?;
            let tokens = all_recipients(conn)?;
            Ok((announcement, tokens))
        })
        .await?;
        state
            .feed
            .publish(ChangeEvent::new("announcements", announcement.id));
        Ok::<_, Error>(dispatch_announcement(state.transport.as_ref(), &announcement, &tokens).await)
    }
    .await;
    report_response(result)
}

/// Loads everything a request fan-out needs in one trip to the pool.
async fn fan_out_inputs(
    pool: &DbPool,
    kind: RequestKind,
    request_id: i32,
) -> Result<(Request, Field, Vec<String>), Error> {
    with_conn(pool, move |conn| {
        let request = get_request(conn, kind, request_id)?;
        let field = get_field(conn, request.field_id)?;
        let tokens = recipients_for_kind(conn, kind)?;
        Ok((request, field, tokens))
    })
    .await
}

async fn renotify(
    State(state): State<AppState>,
    ctx: SessionContext,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
) -> Response {
    let result = async {
        ctx.require_admin()?;
        let (request, field, tokens) = fan_out_inputs(&state.pool, kind, request_id).await?;
        Ok::<_, Error>(dispatch_request(state.transport.as_ref(), &request, &field, &tokens).await)
    }
    .await;
    report_response(result)
}

/// Notifies responders about a new request in the background. Failures never reach the
/// requester.
fn spawn_fan_out(state: &AppState, request: &Request) {
    let state = state.clone();
    let kind = request.kind();
    let request_id = request.id;
    tokio::spawn(async move {
        match fan_out_inputs(&state.pool, kind, request_id).await {
            Ok((request, field, tokens)) => {
                dispatch_request(state.transport.as_ref(), &request, &field, &tokens).await;
            }
            Err(e) => warn!(request_id, %kind, error = %e, "could not start fan-out"),
        }
    });
}

// Profiles and devices

async fn me(ctx: SessionContext) -> Result<Json<Profile>, Error> {
    Ok(Json(ctx.require_profile()?.clone()))
}

#[derive(Deserialize)]
pub struct AvailabilityBody {
    pub is_available: bool,
}

async fn update_availability(
    State(state): State<AppState>,
    ctx: SessionContext,
    Json(body): Json<AvailabilityBody>,
) -> Result<Json<Profile>, Error> {
    let profile_id = ctx.require_profile()?.id;
    let profile = with_conn(&state.pool, move |conn| {
        set_availability(conn, profile_id, body.is_available)
    })
    .await?;
    state.feed.publish(ChangeEvent::new("profiles", profile.id));
    Ok(Json(profile))
}

#[derive(Deserialize)]
pub struct PushTokenBody {
    pub push_token: Option<String>,
}

async fn update_push_token(
    State(state): State<AppState>,
    ctx: SessionContext,
    Json(body): Json<PushTokenBody>,
) -> Result<Json<Profile>, Error> {
    let profile_id = ctx.require_profile()?.id;
    let profile = with_conn(&state.pool, move |conn| {
        set_push_token(conn, profile_id, body.push_token.as_deref())
    })
    .await?;
    Ok(Json(profile))
}

#[derive(Deserialize)]
pub struct DeviceBody {
    pub token: String,
    pub role: Option<StaffRole>,
}

async fn new_device(
    State(state): State<AppState>,
    Json(body): Json<DeviceBody>,
) -> Result<(StatusCode, Json<DeviceToken>), Error> {
    let device =
        with_conn(&state.pool, move |conn| register_device(conn, &body.token, body.role)).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

// Tournament data

async fn announcements(State(state): State<AppState>) -> Result<Json<Vec<Announcement>>, Error> {
    Ok(Json(with_conn(&state.pool, list_announcements).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DivisionQuery {
    pub division_id: Option<i32>,
}

async fn divisions(State(state): State<AppState>) -> Result<Json<Vec<Division>>, Error> {
    Ok(Json(with_conn(&state.pool, list_divisions).await?))
}

async fn pools(
    State(state): State<AppState>,
    Query(query): Query<DivisionQuery>,
) -> Result<Json<Vec<Pool>>, Error> {
    Ok(Json(
        with_conn(&state.pool, move |conn| list_pools(conn, query.division_id)).await?,
    ))
}

async fn rounds(State(state): State<AppState>) -> Result<Json<Vec<Round>>, Error> {
    Ok(Json(with_conn(&state.pool, list_rounds).await?))
}

async fn fields(State(state): State<AppState>) -> Result<Json<Vec<Field>>, Error> {
    Ok(Json(with_conn(&state.pool, list_fields).await?))
}

async fn teams(
    State(state): State<AppState>,
    Query(query): Query<DivisionQuery>,
) -> Result<Json<Vec<Team>>, Error> {
    Ok(Json(
        with_conn(&state.pool, move |conn| list_teams(conn, query.division_id)).await?,
    ))
}

#[derive(Serialize)]
pub struct Roster {
    pub team: Team,
    pub players: Vec<Player>,
}

async fn roster(
    State(state): State<AppState>,
    Path(team_id): Path<i32>,
) -> Result<Json<Roster>, Error> {
    let (team, players) = with_conn(&state.pool, move |conn| get_roster(conn, team_id)).await?;
    Ok(Json(Roster { team, players }))
}

async fn schedule(
    State(state): State<AppState>,
    Query(filter): Query<ScheduleFilter>,
) -> Result<Json<Vec<GameView>>, Error> {
    Ok(Json(
        with_conn(&state.pool, move |conn| list_schedule(conn, &filter)).await?,
    ))
}

async fn game(
    State(state): State<AppState>,
    Path(game_id): Path<i32>,
) -> Result<Json<GameView>, Error> {
    Ok(Json(
        with_conn(&state.pool, move |conn| get_game(conn, game_id)).await?,
    ))
}

// Requests

async fn new_request(
    State(state): State<AppState>,
    Path(kind): Path<RequestKind>,
    ctx: SessionContext,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<Request>), Error> {
    let payload = RequestPayload::from_body(kind, &body)?;
    let requester_id = ctx.profile_id();
    let field_id = body.field_id;

    let request = with_conn(&state.pool, move |conn| {
        create_request(conn, requester_id, field_id, &payload)
    })
    .await?;

    state
        .feed
        .publish(ChangeEvent::request(request.id, request.status));
    spawn_fan_out(&state, &request);
    Ok((StatusCode::CREATED, Json(request)))
}

async fn pending_requests(
    State(state): State<AppState>,
    Path(kind): Path<RequestKind>,
    ctx: SessionContext,
) -> Result<Json<Vec<Request>>, Error> {
    if !ctx.is_admin {
        ctx.require_role(kind.staff_role())?;
    }
    Ok(Json(
        with_conn(&state.pool, move |conn| list_pending(conn, kind)).await?,
    ))
}

async fn fulfilled_requests(
    State(state): State<AppState>,
    Path(kind): Path<RequestKind>,
    ctx: SessionContext,
) -> Result<Json<Vec<Request>>, Error> {
    let responder_id = if ctx.is_admin {
        None
    } else {
        Some(ctx.require_role(kind.staff_role())?.id)
    };
    Ok(Json(
        with_conn(&state.pool, move |conn| list_fulfilled(conn, kind, responder_id)).await?,
    ))
}

async fn my_requests(
    State(state): State<AppState>,
    ctx: SessionContext,
) -> Result<Json<Vec<Request>>, Error> {
    let requester_id = ctx.require_profile()?.id;
    Ok(Json(
        with_conn(&state.pool, move |conn| {
            list_requests_by_requester(conn, requester_id)
        })
        .await?,
    ))
}

async fn request_detail(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
) -> Result<Json<Request>, Error> {
    Ok(Json(
        with_conn(&state.pool, move |conn| get_request(conn, kind, request_id)).await?,
    ))
}

/// Runs one lifecycle operation and announces the new status on the change feed.
async fn transition<F>(
    state: AppState,
    ctx: SessionContext,
    kind: RequestKind,
    request_id: i32,
    op: F,
) -> Result<Json<Request>, Error>
where
    F: FnOnce(&mut SqliteConnection, RequestKind, i32, &SessionContext) -> Result<Request, Error>
        + Send
        + 'static,
{
    let request = with_conn(&state.pool, move |conn| op(conn, kind, request_id, &ctx)).await?;
    state
        .feed
        .publish(ChangeEvent::request(request.id, request.status));
    Ok(Json(request))
}

async fn claim(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
    ctx: SessionContext,
) -> Result<Json<Request>, Error> {
    transition(state, ctx, kind, request_id, claim_request).await
}

async fn resolve(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
    ctx: SessionContext,
) -> Result<Json<Request>, Error> {
    transition(state, ctx, kind, request_id, resolve_request).await
}

async fn expire(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
    ctx: SessionContext,
) -> Result<Json<Request>, Error> {
    transition(state, ctx, kind, request_id, expire_request).await
}

async fn cancel(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(RequestKind, i32)>,
    ctx: SessionContext,
) -> Result<Json<Request>, Error> {
    transition(state, ctx, kind, request_id, cancel_request).await
}
