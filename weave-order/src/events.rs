use serde::Serialize;
use tracing::{error, info};
use weave_core::events::EventPublisher;

/// Publishes after a commit. Failures are logged; the committed state stands.
pub(crate) async fn publish<E: Serialize>(publisher: &dyn EventPublisher, topic: &str, key: &str, event: &E) {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            error!(topic, key, "Failed to encode event: {}", e);
            return;
        }
    };

    match publisher.publish(topic, key, &payload).await {
        Ok(()) => info!(topic, key, "Event published"),
        Err(e) => error!(topic, key, "Failed to publish event: {}", e),
    }
}
