use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::model::RequestStatus;

/// A row changed. Clients use this only as a hint to re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub table: &'static str,
    pub id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
}

impl ChangeEvent {
    pub fn new(table: &'static str, id: i32) -> Self {
        Self {
            table,
            id,
            status: None,
        }
    }

    pub fn request(id: i32, status: RequestStatus) -> Self {
        Self {
            table: "requests",
            id,
            status: Some(status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine.
        if self.sender.send(event).is_err() {
            debug!("change published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Subscribes and yields events until the feed is dropped. A subscriber that falls behind
    /// skips what it missed.
    pub fn stream(&self) -> impl Stream<Item = ChangeEvent> + Send + 'static {
        stream::unfold(self.subscribe(), |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribers_see_published_events() {
        let feed = ChangeFeed::new(8);
        let mut events = Box::pin(feed.stream());

        feed.publish(ChangeEvent::request(42, RequestStatus::Confirmed));
        feed.publish(ChangeEvent::new("scores", 7));

        assert_eq!(
            events.next().await,
            Some(ChangeEvent::request(42, RequestStatus::Confirmed))
        );
        assert_eq!(events.next().await, Some(ChangeEvent::new("scores", 7)));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let feed = ChangeFeed::new(2);
        let mut events = Box::pin(feed.stream());
        for id in 0..5 {
            feed.publish(ChangeEvent::new("requests", id));
        }
        // Only the newest events fit in the buffer.
        assert_eq!(events.next().await.map(|e| e.id), Some(3));
        assert_eq!(events.next().await.map(|e| e.id), Some(4));
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let feed = ChangeFeed::default();
        feed.publish(ChangeEvent::new("announcements", 1));
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(ChangeEvent::request(1, RequestStatus::Expired)).unwrap();
        assert_eq!(json["table"], "requests");
        assert_eq!(json["status"], "expired");
        let json = serde_json::to_value(ChangeEvent::new("scores", 2)).unwrap();
        assert!(json.get("status").is_none());
    }
}
