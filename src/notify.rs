//! Push notification fan-out.
//!
//! Recipients are looked up from the database, messages are built per recipient, and delivery is
//! best effort: every failure is logged and recorded in the returned report, nothing is retried,
//! and nothing ever fails the operation that triggered the notification.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::SqliteConnection;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::Error;
use crate::model::{Announcement, Field, Request, RequestKind, RequestPayload, StaffRole};
use crate::schema::{device_tokens, profiles};

/// Largest number of messages the push endpoint accepts in one call.
pub const BATCH_SIZE: usize = 100;

/// Accepts `ExponentPushToken[...]` and `ExpoPushToken[...]`.
pub fn is_valid_push_token(token: &str) -> bool {
    let inner = token
        .strip_prefix("ExponentPushToken[")
        .or_else(|| token.strip_prefix("ExpoPushToken["))
        .and_then(|rest| rest.strip_suffix(']'));

    match inner {
        Some(inner) => {
            !inner.is_empty()
                && inner
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub sound: &'static str,
    pub data: Value,
}

impl PushMessage {
    pub fn new(to: impl Into<String>, title: &str, body: &str, data: Value) -> Self {
        Self {
            to: to.into(),
            title: title.to_string(),
            body: body.to_string(),
            sound: "default",
            data,
        }
    }
}

/// What happened to one push call.
#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    pub recipients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The `{message | error, results}` body returned by the notify endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct FanOutReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<PushOutcome>,
}

impl FanOutReport {
    pub fn sent(message: String, results: Vec<PushOutcome>) -> Self {
        Self {
            message: Some(message),
            error: None,
            results,
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            message: None,
            error: Some(error.to_string()),
            results: Vec::new(),
        }
    }

    pub fn delivered(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| r.recipients)
            .sum()
    }
}

/// Where push messages go. One call to [`PushTransport::send`] is one outbound request.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, messages: &[PushMessage]) -> Result<Value, Error>;
}

/// Posts messages as a JSON array to an Expo-compatible push endpoint.
pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, messages: &[PushMessage]) -> Result<Value, Error> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(messages)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

async fn deliver(transport: &dyn PushTransport, chunk: &[PushMessage]) -> PushOutcome {
    match transport.send(chunk).await {
        Ok(response) => PushOutcome {
            recipients: chunk.len(),
            response: Some(response),
            error: None,
        },
        Err(e) => {
            warn!(recipients = chunk.len(), error = %e, "push delivery failed");
            PushOutcome {
                recipients: chunk.len(),
                response: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// One call per message, all in flight at once.
pub async fn fan_out_individual(
    transport: &dyn PushTransport,
    messages: &[PushMessage],
) -> Vec<PushOutcome> {
    join_all(
        messages
            .iter()
            .map(|m| deliver(transport, std::slice::from_ref(m))),
    )
    .await
}

/// One call per chunk of `batch_size` messages, in order.
pub async fn fan_out_batched(
    transport: &dyn PushTransport,
    messages: &[PushMessage],
    batch_size: usize,
) -> Vec<PushOutcome> {
    let mut results = Vec::with_capacity(messages.len().div_ceil(batch_size.max(1)));
    for chunk in messages.chunks(batch_size.max(1)) {
        results.push(deliver(transport, chunk).await);
    }
    results
}

fn dedupe_valid(tokens: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens
        .into_iter()
        .filter(|t| is_valid_push_token(t))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Push tokens of everyone who should hear about a new request of `kind`: available profiles
/// with the matching role, plus anonymous devices registered for that role.
pub fn recipients_for_kind(
    conn: &mut SqliteConnection,
    kind: RequestKind,
) -> Result<Vec<String>, Error> {
    let role = kind.staff_role();
    let mut query = profiles::table
        .filter(profiles::is_available.eq(true))
        .filter(profiles::push_token.is_not_null())
        .select(profiles::push_token)
        .into_boxed();
    query = match role {
        StaffRole::MedicalStaff => query.filter(profiles::is_medical_staff.eq(true)),
        StaffRole::Volunteer => query.filter(profiles::is_volunteer.eq(true)),
        StaffRole::Driver => query.filter(profiles::is_driver.eq(true)),
    };
    let staff: Vec<Option<String>> = query.order(profiles::id.asc()).load(conn)?;

    let devices: Vec<String> = device_tokens::table
        .filter(device_tokens::role.eq(role.as_str()))
        .order(device_tokens::id.asc())
        .select(device_tokens::token)
        .load(conn)?;

    Ok(dedupe_valid(staff.into_iter().flatten().chain(devices)))
}

/// Every known push token, for announcements.
pub fn all_recipients(conn: &mut SqliteConnection) -> Result<Vec<String>, Error> {
    let staff: Vec<Option<String>> = profiles::table
        .filter(profiles::push_token.is_not_null())
        .order(profiles::id.asc())
        .select(profiles::push_token)
        .load(conn)?;
    let devices: Vec<String> = device_tokens::table
        .order(device_tokens::id.asc())
        .select(device_tokens::token)
        .load(conn)?;

    Ok(dedupe_valid(staff.into_iter().flatten().chain(devices)))
}

/// Title and body for a new request, as staff see it on their lock screen.
pub fn request_text(request: &Request, field: &Field) -> (String, String) {
    match &request.payload {
        RequestPayload::Medical {
            priority,
            description,
        } => (
            "Trainer Needed".to_string(),
            format!(
                "{} priority at {}: {}",
                capitalize(priority.as_str()),
                field.name,
                description
            ),
        ),
        RequestPayload::Water => (
            "Water Refill Requested".to_string(),
            format!("Water needed at {}", field.name),
        ),
        RequestPayload::Cart {
            passenger_count,
            from_location,
            to_location,
            ..
        } => (
            "Cart Requested".to_string(),
            format!(
                "{} passenger{} from {} to {}",
                passenger_count,
                if *passenger_count == 1 { "" } else { "s" },
                from_location,
                to_location
            ),
        ),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn request_messages(request: &Request, field: &Field, tokens: &[String]) -> Vec<PushMessage> {
    let (title, body) = request_text(request, field);
    let data = json!({ "request_id": request.id, "kind": request.kind() });
    tokens
        .iter()
        .map(|t| PushMessage::new(t.as_str(), &title, &body, data.clone()))
        .collect()
}

pub fn announcement_messages(announcement: &Announcement, tokens: &[String]) -> Vec<PushMessage> {
    let data = json!({ "announcement_id": announcement.id });
    tokens
        .iter()
        .map(|t| {
            PushMessage::new(
                t.as_str(),
                &announcement.title,
                &announcement.body,
                data.clone(),
            )
        })
        .collect()
}

/// Sends one push per staff recipient for a new request.
pub async fn dispatch_request(
    transport: &dyn PushTransport,
    request: &Request,
    field: &Field,
    tokens: &[String],
) -> FanOutReport {
    let messages = request_messages(request, field, tokens);
    let results = fan_out_individual(transport, &messages).await;
    let report = FanOutReport::sent(
        format!(
            "Notified {} of {} {} responders",
            results.iter().filter(|r| r.is_ok()).count(),
            results.len(),
            request.kind()
        ),
        results,
    );
    info!(request_id = request.id, kind = %request.kind(), delivered = report.delivered(), "request fan-out done");
    report
}

/// Sends an announcement to every token in batches of [`BATCH_SIZE`].
pub async fn dispatch_announcement(
    transport: &dyn PushTransport,
    announcement: &Announcement,
    tokens: &[String],
) -> FanOutReport {
    let messages = announcement_messages(announcement, tokens);
    let results = fan_out_batched(transport, &messages, BATCH_SIZE).await;
    let report = FanOutReport::sent(
        format!(
            "Announcement sent to {} devices in {} batches",
            messages.len(),
            results.len()
        ),
        results,
    );
    info!(announcement_id = announcement.id, delivered = report.delivered(), "announcement fan-out done");
    report
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;
    use crate::model::Priority;
    use crate::test_support::*;

    fn token(i: usize) -> String {
        format!("ExponentPushToken[tok{i}]")
    }

    fn messages(n: usize) -> Vec<PushMessage> {
        (0..n)
            .map(|i| PushMessage::new(token(i), "t", "b", Value::Null))
            .collect()
    }

    #[test]
    fn test_push_token_syntax() {
        assert!(is_valid_push_token("ExponentPushToken[xxxxxxxxxxxxxxxxxxxxxx]"));
        assert!(is_valid_push_token("ExpoPushToken[abc_DEF-123]"));
        assert!(!is_valid_push_token("ExponentPushToken[]"));
        assert!(!is_valid_push_token("ExponentPushToken[abc"));
        assert!(!is_valid_push_token("ExponentPushToken[a b]"));
        assert!(!is_valid_push_token("fcm:abcdef"));
        assert!(!is_valid_push_token(""));
    }

    #[tokio::test]
    async fn test_batched_fan_out_makes_ceil_n_over_100_calls() {
        for (n, expected) in [(0, 0), (1, 1), (100, 1), (101, 2), (250, 3)] {
            let transport = RecordingTransport::default();
            let results = fan_out_batched(&transport, &messages(n), BATCH_SIZE).await;
            assert_eq!(results.len(), expected, "n = {n}");
            assert_eq!(transport.call_sizes().len(), expected, "n = {n}");
            assert_eq!(transport.call_sizes().iter().sum::<usize>(), n);
        }
    }

    #[tokio::test]
    async fn test_individual_fan_out_survives_failures() {
        let failing = token(1);
        let transport = RecordingTransport::failing_for(&[failing.as_str()]);
        let results = fan_out_individual(&transport, &messages(5)).await;

        assert_eq!(transport.call_sizes(), vec![1; 5]);
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| !r.is_ok()).count(), 1);
        assert!(results[1].error.as_deref().unwrap().contains("DeviceNotRegistered"));
    }

    #[tokio::test]
    async fn test_batch_failure_is_recorded_not_raised() {
        let first = token(0);
        let transport = RecordingTransport::failing_for(&[first.as_str()]);
        let results = fan_out_batched(&transport, &messages(150), BATCH_SIZE).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].is_ok());
        assert!(results[1].is_ok());

        let report = FanOutReport::sent("done".to_string(), results);
        assert_eq!(report.delivered(), 50);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["message"], "done");
        assert!(json.get("error").is_none());
        assert_eq!(json["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_report_shape() {
        let report = FanOutReport::failed(&Error::NotFound);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"], "Not found");
        assert!(json.get("message").is_none());
        assert_eq!(json["results"], json!([]));
    }

    #[test]
    fn test_recipients_for_kind() {
        run_test_in_transaction(|conn| {
            let good = insert_profile(conn, "t1", &["medical"], true, Some("ExponentPushToken[t1]"));
            // Unavailable, wrong role, missing token and malformed token are all skipped.
            insert_profile(conn, "t2", &["medical"], false, Some("ExponentPushToken[t2]"));
            insert_profile(conn, "d1", &["driver"], true, Some("ExponentPushToken[d1]"));
            insert_profile(conn, "t3", &["medical"], true, None);
            insert_profile(conn, "t4", &["medical"], true, Some("not-a-token"));
            // Same device registered under two profiles only counts once.
            insert_profile(conn, "t5", &["medical"], true, Some("ExponentPushToken[t1]"));

            crate::accounts::register_device(
                conn,
                "ExpoPushToken[dev-medic]",
                Some(StaffRole::MedicalStaff),
            )?;
            crate::accounts::register_device(conn, "ExpoPushToken[dev-anon]", None)?;

            let tokens = recipients_for_kind(conn, RequestKind::Medical)?;
            assert_eq!(
                tokens,
                vec![
                    good.push_token.clone().unwrap(),
                    "ExpoPushToken[dev-medic]".to_string()
                ]
            );

            let drivers = recipients_for_kind(conn, RequestKind::Cart)?;
            assert_eq!(drivers, vec!["ExponentPushToken[d1]".to_string()]);
            assert!(recipients_for_kind(conn, RequestKind::Water)?.is_empty());

            let everyone = all_recipients(conn)?;
            assert_eq!(everyone.len(), 5);
            Ok(())
        });
    }

    #[test]
    fn test_request_text() {
        let now = now();
        let field = Field {
            id: 3,
            name: "Field 3".to_string(),
        };
        let mut request = Request {
            id: 1,
            status: crate::model::RequestStatus::Pending,
            field_id: 3,
            requester_id: None,
            responder_id: None,
            payload: RequestPayload::Medical {
                priority: Priority::High,
                description: "Concussion check".to_string(),
            },
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            request_text(&request, &field),
            (
                "Trainer Needed".to_string(),
                "High priority at Field 3: Concussion check".to_string()
            )
        );

        request.payload = RequestPayload::Cart {
            passenger_count: 1,
            from_location: "Field 3".to_string(),
            to_location: "Lot A".to_string(),
            note: None,
        };
        assert_eq!(request_text(&request, &field).1, "1 passenger from Field 3 to Lot A");

        let messages = request_messages(&request, &field, &[token(0), token(1)]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data["kind"], "cart");
        assert_eq!(messages[1].to, token(1));
    }
}
