// Outbound event sinks.
//
// `HttpEventPublisher` posts each event as JSON to a downstream notification
// service. `BroadcastEventPublisher` fans events out in-process; it backs the
// service when no sink URL is configured and is what tests subscribe to.

use anyhow::Context;
use tokio::sync::broadcast;
use url::Url;

use callsync_common::events::CallEvent;

use super::{EventPublisher, PublishError};

#[derive(Clone)]
pub struct HttpEventPublisher {
    http: reqwest::Client,
    url: Url,
}

impl HttpEventPublisher {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid event sink url '{url}'"))?;
        Ok(Self { http: reqwest::Client::new(), url })
    }
}

impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: CallEvent) -> Result<(), PublishError> {
        let body =
            serde_json::to_vec(&event).map_err(|error| PublishError::Encode(error.to_string()))?;
        let response = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|error| PublishError::Transport(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PublishError::Rejected(status.as_u16()))
        }
    }
}

const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<CallEvent>,
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: CallEvent) -> Result<(), PublishError> {
        // No subscribers is not a failure: nobody is listening yet.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// The sink the service publishes to, chosen at startup.
#[derive(Clone)]
pub enum EventSink {
    Http(HttpEventPublisher),
    Broadcast(BroadcastEventPublisher),
}

impl EventPublisher for EventSink {
    async fn publish(&self, event: CallEvent) -> Result<(), PublishError> {
        match self {
            Self::Http(publisher) => publisher.publish(event).await,
            Self::Broadcast(publisher) => publisher.publish(event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_without_subscribers_succeeds() {
        let publisher = BroadcastEventPublisher::default();
        publisher.publish(CallEvent::in_video(1, true)).await.expect("publish");
    }

    #[tokio::test]
    async fn broadcast_delivers_to_every_subscriber() {
        let publisher = BroadcastEventPublisher::new(8);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(CallEvent::in_video(4, false)).await.expect("publish");

        assert_eq!(first.recv().await.expect("first"), CallEvent::in_video(4, false));
        assert_eq!(second.recv().await.expect("second"), CallEvent::in_video(4, false));
    }

    #[tokio::test]
    async fn sink_dispatches_to_broadcast() {
        let broadcast = BroadcastEventPublisher::new(4);
        let mut receiver = broadcast.subscribe();
        let sink = EventSink::Broadcast(broadcast);

        sink.publish(CallEvent::in_video(2, true)).await.expect("publish");
        assert_eq!(receiver.recv().await.expect("event"), CallEvent::in_video(2, true));
    }

    #[test]
    fn http_publisher_rejects_invalid_url() {
        assert!(HttpEventPublisher::new("::nope").is_err());
        assert!(HttpEventPublisher::new("http://notifier:8080/events").is_ok());
    }
}
