//! Request claim lifecycle.
//!
//! ```text
//! pending ──claim──▶ confirmed ──resolve──▶ resolved
//!    │ (water: resolve) ─────────────────────▲
//!    └─cancel─▶ expired ◀─expire── confirmed / resolved
//! ```
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = <expected>`. SQLite
//! serialises writers, so when two responders race for the same pending request exactly one
//! update matches a row and the other gets an empty result set back. Nothing here holds a lock
//! across statements.

use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;
use tracing::{debug, info};

use crate::accounts::SessionContext;
use crate::error::Error;
use crate::model::{DbRequest, NewRequest, Request, RequestKind, RequestPayload, RequestStatus};
use crate::schema::{fields, requests};

impl RequestStatus {
    /// Whether a request of `kind` may move from `self` to `to`. Nothing ever moves back to
    /// pending.
    pub fn can_transition(self, kind: RequestKind, to: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, to) {
            (Pending, Confirmed) => kind.is_claimable(),
            (Pending, Resolved) => !kind.is_claimable(),
            (Confirmed, Resolved) => kind.is_claimable(),
            (Pending, Expired) | (Confirmed, Expired) | (Resolved, Expired) => true,
            _ => false,
        }
    }

    /// Statuses shown on the fulfilled list.
    pub fn is_fulfilled(self) -> bool {
        matches!(self, RequestStatus::Confirmed | RequestStatus::Resolved)
    }
}

fn decode(rows: Vec<DbRequest>) -> Result<Vec<Request>, Error> {
    rows.into_iter().map(Request::try_from).collect()
}

/// Inserts a new pending request. `field_id` must name an existing field.
pub fn create_request(
    conn: &mut SqliteConnection,
    requester_id: Option<i32>,
    field_id: i32,
    payload: &RequestPayload,
) -> Result<Request, Error> {
    let field_exists: i64 = fields::table
        .filter(fields::id.eq(field_id))
        .count()
        .get_result(conn)?;
    if field_exists == 0 {
        return Err(Error::Validation(format!("unknown field {field_id}")));
    }

    let now = Utc::now().naive_utc();
    let row: DbRequest = diesel::insert_into(requests::table)
        .values(&NewRequest::pending(payload, field_id, requester_id, now))
        .returning(DbRequest::as_returning())
        .get_result(conn)?;

    info!(id = row.id, kind = %payload.kind(), field_id, "request created");
    row.try_into()
}

/// Fetches a request of the given kind. A request of another kind is reported as not found.
pub fn get_request(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
) -> Result<Request, Error> {
    let row: Option<DbRequest> = requests::table
        .filter(requests::id.eq(request_id))
        .filter(requests::kind.eq(kind.as_str()))
        .select(DbRequest::as_select())
        .first(conn)
        .optional()?;
    row.ok_or(Error::NotFound)?.try_into()
}

/// Conditional update from `from` to `to`. Returns `None` if the row was no longer in `from`.
/// When `responder_id` is given it is written along with the status.
fn compare_and_set(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    from: RequestStatus,
    to: RequestStatus,
    responder_id: Option<i32>,
) -> Result<Option<Request>, Error> {
    let now = Utc::now().naive_utc();
    let target = requests::table
        .filter(requests::id.eq(request_id))
        .filter(requests::kind.eq(kind.as_str()))
        .filter(requests::status.eq(from.as_str()));

    let row: Option<DbRequest> = match responder_id {
        Some(responder_id) => diesel::update(target)
            .set((
                requests::status.eq(to.as_str()),
                requests::responder_id.eq(Some(responder_id)),
                requests::updated_at.eq(now),
            ))
            .returning(DbRequest::as_returning())
            .get_result(conn)
            .optional()?,
        None => diesel::update(target)
            .set((
                requests::status.eq(to.as_str()),
                requests::updated_at.eq(now),
            ))
            .returning(DbRequest::as_returning())
            .get_result(conn)
            .optional()?,
    };

    row.map(Request::try_from).transpose()
}

/// Moves `current` to `to` if the state machine allows it and nobody changed it in between.
fn advance(
    conn: &mut SqliteConnection,
    current: &Request,
    to: RequestStatus,
) -> Result<Request, Error> {
    let kind = current.kind();
    if !current.status.can_transition(kind, to) {
        return Err(Error::InvalidTransition {
            from: current.status.to_string(),
            to: to.to_string(),
        });
    }

    match compare_and_set(conn, kind, current.id, current.status, to, None)? {
        Some(updated) => {
            info!(id = updated.id, %kind, from = %current.status, %to, "request transitioned");
            Ok(updated)
        }
        None => {
            let now = get_request(conn, kind, current.id)?;
            Err(Error::InvalidTransition {
                from: now.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// The contested transition. Only one caller can take a pending request; everyone else gets
/// [`Error::RequestUnavailable`].
fn take_pending(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    to: RequestStatus,
    responder_id: Option<i32>,
) -> Result<Request, Error> {
    match compare_and_set(conn, kind, request_id, RequestStatus::Pending, to, responder_id)? {
        Some(taken) => {
            info!(id = request_id, %kind, ?responder_id, %to, "request taken");
            Ok(taken)
        }
        None => {
            // Distinguish a missing row from one somebody else already moved on.
            let existing = get_request(conn, kind, request_id)?;
            debug!(id = request_id, %kind, status = %existing.status, "request already taken");
            Err(Error::RequestUnavailable)
        }
    }
}

/// Claims a pending medical or cart request for the calling staff member, who must be on duty.
pub fn claim_request(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    ctx: &SessionContext,
) -> Result<Request, Error> {
    if !kind.is_claimable() {
        return Err(Error::InvalidTransition {
            from: RequestStatus::Pending.to_string(),
            to: RequestStatus::Confirmed.to_string(),
        });
    }
    let responder = ctx.require_on_duty(kind.staff_role())?;
    take_pending(conn, kind, request_id, RequestStatus::Confirmed, Some(responder.id))
}

/// Marks a request resolved.
///
/// Water requests go straight from pending to resolved and are contested the same way a claim
/// is. Medical and cart requests must be confirmed, and only their claimant (or an admin) may
/// resolve them.
pub fn resolve_request(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    ctx: &SessionContext,
) -> Result<Request, Error> {
    if !kind.is_claimable() {
        let responder_id = if ctx.is_admin {
            ctx.profile_id()
        } else {
            Some(ctx.require_on_duty(kind.staff_role())?.id)
        };
        return take_pending(conn, kind, request_id, RequestStatus::Resolved, responder_id);
    }

    let current = get_request(conn, kind, request_id)?;
    ensure_responder_or_admin(&current, ctx)?;
    advance(conn, &current, RequestStatus::Resolved)
}

/// Removes a confirmed or resolved request from the fulfilled list.
pub fn expire_request(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    ctx: &SessionContext,
) -> Result<Request, Error> {
    let current = get_request(conn, kind, request_id)?;
    ensure_responder_or_admin(&current, ctx)?;
    if current.status == RequestStatus::Pending {
        // Pending requests are withdrawn with cancel.
        return Err(Error::InvalidTransition {
            from: current.status.to_string(),
            to: RequestStatus::Expired.to_string(),
        });
    }
    advance(conn, &current, RequestStatus::Expired)
}

/// Withdraws a request that nobody has taken yet.
pub fn cancel_request(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    request_id: i32,
    ctx: &SessionContext,
) -> Result<Request, Error> {
    let current = get_request(conn, kind, request_id)?;
    let is_requester = current.requester_id.is_some() && current.requester_id == ctx.profile_id();
    if !(is_requester || ctx.is_admin) {
        return Err(Error::Forbidden);
    }
    if current.status != RequestStatus::Pending {
        return Err(Error::InvalidTransition {
            from: current.status.to_string(),
            to: RequestStatus::Expired.to_string(),
        });
    }
    advance(conn, &current, RequestStatus::Expired)
}

fn ensure_responder_or_admin(request: &Request, ctx: &SessionContext) -> Result<(), Error> {
    if ctx.is_admin {
        return Ok(());
    }
    let caller = ctx.require_profile()?;
    if request.responder_id == Some(caller.id) {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

/// Pending requests of one kind, oldest first.
pub fn list_pending(conn: &mut SqliteConnection, kind: RequestKind) -> Result<Vec<Request>, Error> {
    let rows = requests::table
        .filter(requests::kind.eq(kind.as_str()))
        .filter(requests::status.eq(RequestStatus::Pending.as_str()))
        .order((requests::created_at.asc(), requests::id.asc()))
        .select(DbRequest::as_select())
        .load(conn)?;
    decode(rows)
}

/// Confirmed and resolved requests of one kind, most recently updated first. With a responder
/// only that responder's requests are returned.
pub fn list_fulfilled(
    conn: &mut SqliteConnection,
    kind: RequestKind,
    responder_id: Option<i32>,
) -> Result<Vec<Request>, Error> {
    let mut query = requests::table
        .filter(requests::kind.eq(kind.as_str()))
        .filter(requests::status.eq_any(vec![
            RequestStatus::Confirmed.as_str(),
            RequestStatus::Resolved.as_str(),
        ]))
        .select(DbRequest::as_select())
        .into_boxed();
    if let Some(responder_id) = responder_id {
        query = query.filter(requests::responder_id.eq(responder_id));
    }
    let rows = query
        .order((requests::updated_at.desc(), requests::id.desc()))
        .load(conn)?;
    decode(rows)
}

/// Every live request raised by one profile, newest first.
pub fn list_requests_by_requester(
    conn: &mut SqliteConnection,
    requester_id: i32,
) -> Result<Vec<Request>, Error> {
    let rows = requests::table
        .filter(requests::requester_id.eq(requester_id))
        .filter(requests::status.ne(RequestStatus::Expired.as_str()))
        .order((requests::created_at.desc(), requests::id.desc()))
        .select(DbRequest::as_select())
        .load(conn)?;
    decode(rows)
}
