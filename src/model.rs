use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The three kinds of on-site logistics request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Medical,
    Water,
    Cart,
}

impl RequestKind {
    pub const ALL: [RequestKind; 3] = [RequestKind::Medical, RequestKind::Water, RequestKind::Cart];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Medical => "medical",
            RequestKind::Water => "water",
            RequestKind::Cart => "cart",
        }
    }

    /// The staff role that responds to this kind of request.
    pub fn staff_role(self) -> StaffRole {
        match self {
            RequestKind::Medical => StaffRole::MedicalStaff,
            RequestKind::Water => StaffRole::Volunteer,
            RequestKind::Cart => StaffRole::Driver,
        }
    }

    /// Water requests are resolved straight from pending; the others are claimed first.
    pub fn is_claimable(self) -> bool {
        !matches!(self, RequestKind::Water)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical" => Ok(RequestKind::Medical),
            "water" => Ok(RequestKind::Water),
            "cart" => Ok(RequestKind::Cart),
            other => Err(Error::Validation(format!("unknown request kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Confirmed,
    Resolved,
    Expired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Confirmed => "confirmed",
            RequestStatus::Resolved => "resolved",
            RequestStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "confirmed" => Ok(RequestStatus::Confirmed),
            "resolved" => Ok(RequestStatus::Resolved),
            "expired" => Ok(RequestStatus::Expired),
            other => Err(Error::Validation(format!("unknown request status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    MedicalStaff,
    Volunteer,
    Driver,
}

impl StaffRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StaffRole::MedicalStaff => "medical_staff",
            StaffRole::Volunteer => "volunteer",
            StaffRole::Driver => "driver",
        }
    }
}

impl FromStr for StaffRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical_staff" => Ok(StaffRole::MedicalStaff),
            "volunteer" => Ok(StaffRole::Volunteer),
            "driver" => Ok(StaffRole::Driver),
            other => Err(Error::Validation(format!("unknown staff role '{other}'"))),
        }
    }
}

pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_PASSENGERS: i32 = 8;

/// Kind-specific request data. Serialized with a `kind` tag so it can be flattened into
/// [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestPayload {
    Medical {
        priority: Priority,
        description: String,
    },
    Water,
    Cart {
        passenger_count: i32,
        from_location: String,
        to_location: String,
        note: Option<String>,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::Medical { .. } => RequestKind::Medical,
            RequestPayload::Water => RequestKind::Water,
            RequestPayload::Cart { .. } => RequestKind::Cart,
        }
    }

    /// Builds and validates the payload for `kind` from a flat request body.
    pub fn from_body(kind: RequestKind, body: &CreateRequestBody) -> Result<Self, Error> {
        match kind {
            RequestKind::Medical => {
                let priority = body
                    .priority
                    .ok_or_else(|| Error::Validation("priority is required".to_string()))?;
                let description = required_text("description", body.description.as_deref())?;
                if description.chars().count() > MAX_DESCRIPTION_LEN {
                    return Err(Error::Validation(format!(
                        "description must be at most {MAX_DESCRIPTION_LEN} characters"
                    )));
                }
                Ok(RequestPayload::Medical {
                    priority,
                    description,
                })
            }
            RequestKind::Water => Ok(RequestPayload::Water),
            RequestKind::Cart => {
                let passenger_count = body.passenger_count.unwrap_or(1);
                if !(1..=MAX_PASSENGERS).contains(&passenger_count) {
                    return Err(Error::Validation(format!(
                        "passenger_count must be between 1 and {MAX_PASSENGERS}"
                    )));
                }
                Ok(RequestPayload::Cart {
                    passenger_count,
                    from_location: required_text("from_location", body.from_location.as_deref())?,
                    to_location: required_text("to_location", body.to_location.as_deref())?,
                    note: body
                        .note
                        .as_deref()
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(str::to_string),
                })
            }
        }
    }
}

fn required_text(name: &str, value: Option<&str>) -> Result<String, Error> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Error::Validation(format!("{name} is required"))),
    }
}

/// Flat body accepted by the create endpoint. Which fields are required depends on the kind in
/// the path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRequestBody {
    pub field_id: i32,
    pub priority: Option<Priority>,
    pub description: Option<String>,
    pub passenger_count: Option<i32>,
    pub from_location: Option<String>,
    pub to_location: Option<String>,
    pub note: Option<String>,
}

/// Raw row of the `requests` table.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::requests)]
#[diesel(check_for_backend(Sqlite))]
pub struct DbRequest {
    pub id: i32,
    pub kind: String,
    pub status: String,
    pub field_id: i32,
    pub requester_id: Option<i32>,
    pub responder_id: Option<i32>,
    pub priority: Option<String>,
    pub description: Option<String>,
    pub passenger_count: Option<i32>,
    pub from_location: Option<String>,
    pub to_location: Option<String>,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::requests)]
pub struct NewRequest<'a> {
    pub kind: &'a str,
    pub status: &'a str,
    pub field_id: i32,
    pub requester_id: Option<i32>,
    pub priority: Option<&'a str>,
    pub description: Option<&'a str>,
    pub passenger_count: Option<i32>,
    pub from_location: Option<&'a str>,
    pub to_location: Option<&'a str>,
    pub note: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl<'a> NewRequest<'a> {
    pub fn pending(
        payload: &'a RequestPayload,
        field_id: i32,
        requester_id: Option<i32>,
        now: NaiveDateTime,
    ) -> Self {
        let mut row = NewRequest {
            kind: payload.kind().as_str(),
            status: RequestStatus::Pending.as_str(),
            field_id,
            requester_id,
            priority: None,
            description: None,
            passenger_count: None,
            from_location: None,
            to_location: None,
            note: None,
            created_at: now,
            updated_at: now,
        };
        match payload {
            RequestPayload::Medical {
                priority,
                description,
            } => {
                row.priority = Some(priority.as_str());
                row.description = Some(description.as_str());
            }
            RequestPayload::Water => {}
            RequestPayload::Cart {
                passenger_count,
                from_location,
                to_location,
                note,
            } => {
                row.passenger_count = Some(*passenger_count);
                row.from_location = Some(from_location.as_str());
                row.to_location = Some(to_location.as_str());
                row.note = note.as_deref();
            }
        }
        row
    }
}

/// A logistics request with its status and payload decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: i32,
    pub status: RequestStatus,
    pub field_id: i32,
    pub requester_id: Option<i32>,
    pub responder_id: Option<i32>,
    #[serde(flatten)]
    pub payload: RequestPayload,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

impl TryFrom<DbRequest> for Request {
    type Error = Error;

    fn try_from(row: DbRequest) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| Error::Corrupt(format!("request {}: {what}", row.id));
        let kind: RequestKind = row.kind.parse().map_err(|_| corrupt("bad kind"))?;
        let status: RequestStatus = row.status.parse().map_err(|_| corrupt("bad status"))?;
        let payload = match kind {
            RequestKind::Medical => RequestPayload::Medical {
                priority: row
                    .priority
                    .as_deref()
                    .ok_or_else(|| corrupt("missing priority"))?
                    .parse()
                    .map_err(|_| corrupt("bad priority"))?,
                description: row
                    .description
                    .clone()
                    .ok_or_else(|| corrupt("missing description"))?,
            },
            RequestKind::Water => RequestPayload::Water,
            RequestKind::Cart => RequestPayload::Cart {
                passenger_count: row
                    .passenger_count
                    .ok_or_else(|| corrupt("missing passenger_count"))?,
                from_location: row
                    .from_location
                    .clone()
                    .ok_or_else(|| corrupt("missing from_location"))?,
                to_location: row
                    .to_location
                    .clone()
                    .ok_or_else(|| corrupt("missing to_location"))?,
                note: row.note.clone(),
            },
        };
        Ok(Request {
            id: row.id,
            status,
            field_id: row.field_id,
            requester_id: row.requester_id,
            responder_id: row.responder_id,
            payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::profiles)]
#[diesel(check_for_backend(Sqlite))]
pub struct Profile {
    pub id: i32,
    pub username: String,
    pub full_name: String,
    pub is_admin: bool,
    pub is_driver: bool,
    pub is_medical_staff: bool,
    pub is_volunteer: bool,
    pub is_available: bool,
    pub push_token: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Profile {
    pub fn has_role(&self, role: StaffRole) -> bool {
        match role {
            StaffRole::MedicalStaff => self.is_medical_staff,
            StaffRole::Volunteer => self.is_volunteer,
            StaffRole::Driver => self.is_driver,
        }
    }
}

#[derive(Insertable, Debug, Clone, Default, Deserialize)]
#[diesel(table_name = crate::schema::profiles)]
pub struct NewProfile {
    pub username: String,
    pub full_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_driver: bool,
    #[serde(default)]
    pub is_medical_staff: bool,
    #[serde(default)]
    pub is_volunteer: bool,
    #[serde(default)]
    pub is_available: bool,
    // push_token and created_at use defaults
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::sessions)]
pub struct NewSession {
    pub profile_id: i32,
    pub token: String,
    // created_at uses default
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::admin_sessions)]
pub struct NewAdminSession {
    pub token: String,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::device_tokens)]
#[diesel(check_for_backend(Sqlite))]
pub struct DeviceToken {
    pub id: i32,
    pub token: String,
    pub role: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::device_tokens)]
pub struct NewDeviceToken<'a> {
    pub token: &'a str,
    pub role: Option<&'a str>,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::divisions)]
#[diesel(check_for_backend(Sqlite))]
pub struct Division {
    pub id: i32,
    pub name: String,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::pools)]
#[diesel(check_for_backend(Sqlite))]
pub struct Pool {
    pub id: i32,
    pub division_id: i32,
    pub name: String,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::rounds)]
#[diesel(check_for_backend(Sqlite))]
pub struct Round {
    pub id: i32,
    pub name: String,
    pub starts_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = crate::schema::fields)]
#[diesel(check_for_backend(Sqlite))]
pub struct Field {
    pub id: i32,
    pub name: String,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::teams)]
#[diesel(check_for_backend(Sqlite))]
pub struct Team {
    pub id: i32,
    pub name: String,
    pub division_id: i32,
    pub pool_id: Option<i32>,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::players)]
#[diesel(check_for_backend(Sqlite))]
pub struct Player {
    pub id: i32,
    pub team_id: i32,
    pub name: String,
    pub jersey_number: Option<i32>,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::games)]
#[diesel(check_for_backend(Sqlite))]
pub struct Game {
    pub id: i32,
    pub division_id: i32,
    pub pool_id: Option<i32>,
    pub round_id: Option<i32>,
    pub field_id: i32,
    pub team1_id: i32,
    pub team2_id: i32,
    pub starts_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = crate::schema::scores)]
#[diesel(check_for_backend(Sqlite))]
pub struct Score {
    pub id: i32,
    pub game_id: i32,
    pub team1_score: i32,
    pub team2_score: i32,
    pub is_finished: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::scores)]
pub struct NewScore {
    pub game_id: i32,
    pub team1_score: i32,
    pub team2_score: i32,
    pub is_finished: bool,
    pub updated_at: NaiveDateTime,
}

/// Admin score entry. `reopen` must be set to change a score that is already final.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScoreUpdate {
    pub team1_score: i32,
    pub team2_score: i32,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(default)]
    pub reopen: bool,
}

/// A game joined with everything the schedule screen shows.
#[derive(Debug, Clone, Serialize)]
pub struct GameView {
    #[serde(flatten)]
    pub game: Game,
    pub team1_name: String,
    pub team2_name: String,
    pub field_name: String,
    pub score: Option<Score>,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = crate::schema::announcements)]
#[diesel(check_for_backend(Sqlite))]
pub struct Announcement {
    pub id: i32,
    pub title: String,
    pub body: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::announcements)]
pub struct NewAnnouncement<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub created_at: NaiveDateTime,
}
