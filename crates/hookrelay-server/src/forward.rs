//! `POST /api/forward?topic=...`

use crate::error::{encode_failure, AppError};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use hookrelay_broker::{validate_topic, QoS};
use hookrelay_core::{Decision, InboundEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Every forwarded message is retained so late subscribers see current state.
const PUBLISH_RETAIN: bool = true;
const PUBLISH_QOS: QoS = QoS::AtLeastOnce;

/// What gets published for an accepted request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Run the filter pipeline and publish the reduced message.
    #[default]
    Filtered,
    /// Publish any valid JSON body unchanged.
    Passthrough,
}

impl fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filtered => write!(f, "filtered"),
            Self::Passthrough => write!(f, "passthrough"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForwardQuery {
    #[serde(default)]
    topic: Option<String>,
}

/// Body of a successful forward request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ForwardResponse {
    Filtered {
        reason: String,
    },
    Forwarded {
        #[serde(rename = "workItemId")]
        work_item_id: Option<i64>,
    },
}

pub(crate) async fn forward(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForwardQuery>,
    body: Bytes,
) -> Result<Json<ForwardResponse>, AppError> {
    let topic = query
        .topic
        .filter(|topic| !topic.is_empty())
        .ok_or_else(|| AppError::bad_request("no topic specified"))?;
    validate_topic(&topic)?;

    let text = std::str::from_utf8(&body)
        .map_err(|_| AppError::bad_request("body is not valid UTF-8"))?;
    if text.trim().is_empty() {
        return Err(AppError::bad_request("no body in request"));
    }
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| AppError::BadRequest(format!("malformed JSON: {e}")))?;

    let (payload, work_item_id) = match state.mode {
        ForwardMode::Passthrough => {
            let work_item_id = doc.pointer("/resource/workItemId").and_then(Value::as_i64);
            (doc.to_string().into_bytes(), work_item_id)
        }
        ForwardMode::Filtered => {
            let event = InboundEvent::from_value(doc)?;
            debug!(
                event_type = %event.event_type,
                work_item_id = ?event.work_item_id(),
                "Received work item event"
            );
            match state.pipeline.decide(&event) {
                Decision::Skip(reason) => {
                    info!(
                        %reason,
                        event_type = %event.event_type,
                        work_item_id = ?event.work_item_id(),
                        "Event filtered out"
                    );
                    return Ok(Json(ForwardResponse::Filtered {
                        reason: reason.to_string(),
                    }));
                }
                Decision::Forward(message) => {
                    let payload = message.to_payload().map_err(|e| encode_failure(&e))?;
                    (payload, message.work_item_id)
                }
            }
        }
    };

    // Cancelled if the client goes away and this future is dropped.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    info!(%topic, ?work_item_id, bytes = payload.len(), "Forwarding message to broker");
    state
        .publisher
        .publish(&topic, payload, PUBLISH_QOS, PUBLISH_RETAIN, &cancel)
        .await?;

    Ok(Json(ForwardResponse::Forwarded { work_item_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingPublisher, StalledPublisher};
    use crate::{router, ErrorResponse};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hookrelay_core::{AllowList, OutboundMessage, Pipeline};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    const ADAM: &str = "adam.dixon <adam.dixon@cnhind.com>";

    fn event(assignee: &str) -> Value {
        json!({
            "eventType": "workitem.updated",
            "resource": {
                "workItemId": 42,
                "fields": { "System.AssignedTo": { "newValue": assignee } },
                "revision": {
                    "fields": {
                        "System.WorkItemType": "Bug",
                        "Microsoft.Common.Severity": "2 - High"
                    },
                    "url": "https://x/42"
                }
            }
        })
    }

    fn state(mode: ForwardMode, publisher: Arc<RecordingPublisher>) -> AppState {
        AppState::new(Pipeline::standard(AllowList::new([ADAM])), mode, publisher)
    }

    async fn post(state: AppState, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_filtered(uri: &str, body: impl Into<Body>) -> (StatusCode, Value, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::connected());
        let (status, json) = post(state(ForwardMode::Filtered, publisher.clone()), uri, body).await;
        (status, json, publisher)
    }

    fn error_of(body: Value) -> String {
        serde_json::from_value::<ErrorResponse>(body).unwrap().error
    }

    #[tokio::test]
    async fn test_missing_topic_is_rejected() {
        let (status, body, publisher) =
            post_filtered("/api/forward", event(ADAM).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_of(body), "no topic specified");
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let (status, _, publisher) =
            post_filtered("/api/forward?topic=", event(ADAM).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_topic_is_rejected() {
        let (status, _, publisher) =
            post_filtered("/api/forward?topic=alerts%2F%23", event(ADAM).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_is_rejected() {
        for body in ["", "   \n\t"] {
            let (status, body, publisher) = post_filtered("/api/forward?topic=alerts", body).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(error_of(body), "no body in request");
            assert!(publisher.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_accepted_event_is_published() {
        let (status, body, publisher) =
            post_filtered("/api/forward?topic=alerts", event(ADAM).to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "forwarded", "workItemId": 42 }));

        let calls = publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].topic, "alerts");
        assert_eq!(calls[0].qos, QoS::AtLeastOnce);
        assert!(calls[0].retain);

        let message = OutboundMessage::from_payload(&calls[0].payload).unwrap();
        assert_eq!(message.work_item_id, Some(42));
        assert_eq!(message.work_item_type.as_deref(), Some("Bug"));
        assert_eq!(message.severity.as_deref(), Some("2 - High"));
        assert_eq!(message.url.as_deref(), Some("https://x/42"));
    }

    #[tokio::test]
    async fn test_unlisted_assignee_is_filtered() {
        let (status, body, publisher) = post_filtered(
            "/api/forward?topic=alerts",
            event("someone.else@example.com").to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "filtered");
        assert!(body["reason"].as_str().unwrap().contains("someone.else@example.com"));
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_other_event_type_is_filtered() {
        let mut doc = event(ADAM);
        doc["eventType"] = json!("workitem.created");
        let (status, body, publisher) =
            post_filtered("/api/forward?topic=alerts", doc.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "filtered");
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let (status, body, publisher) =
            post_filtered("/api/forward?topic=alerts", "{\"eventType\": ").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(error_of(body).starts_with("malformed JSON"));
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event_type_is_rejected() {
        for doc in [json!({ "resource": {} }), json!({ "eventType": 7 })] {
            let (status, _, publisher) =
                post_filtered("/api/forward?topic=alerts", doc.to_string()).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(publisher.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unreadable_shape_is_rejected() {
        let mut doc = event(ADAM);
        doc["resource"]["workItemId"] = json!("forty-two");
        let (status, _, publisher) =
            post_filtered("/api/forward?topic=alerts", doc.to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_server_error() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let (status, body) = post(
            state(ForwardMode::Filtered, publisher),
            "/api/forward?topic=alerts",
            event(ADAM).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error_of(body).starts_with("publish failed"));
    }

    #[tokio::test]
    async fn test_dropped_request_cancels_publish() {
        let publisher = Arc::new(StalledPublisher::default());
        let state = AppState::new(
            Pipeline::standard(AllowList::new([ADAM])),
            ForwardMode::Filtered,
            publisher.clone(),
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/forward?topic=alerts")
            .header("content-type", "application/json")
            .body(Body::from(event(ADAM).to_string()))
            .unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(200), router(state).oneshot(request)).await;
        assert!(result.is_err(), "publish should still be pending");

        let token = publisher.token().expect("publish was started");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_passthrough_publishes_body_unfiltered() {
        let publisher = Arc::new(RecordingPublisher::connected());
        let doc = event("someone.else@example.com");
        let (status, body) = post(
            state(ForwardMode::Passthrough, publisher.clone()),
            "/api/forward?topic=raw",
            doc.to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "forwarded", "workItemId": 42 }));

        let calls = publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].topic, "raw");
        let published: Value = serde_json::from_slice(&calls[0].payload).unwrap();
        assert_eq!(published, doc);
    }

    #[tokio::test]
    async fn test_passthrough_still_requires_json() {
        let publisher = Arc::new(RecordingPublisher::connected());
        let (status, _) = post(
            state(ForwardMode::Passthrough, publisher.clone()),
            "/api/forward?topic=raw",
            "not json",
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(publisher.calls().is_empty());
    }

    #[test]
    fn test_forward_mode_names() {
        assert_eq!(serde_json::to_value(ForwardMode::Passthrough).unwrap(), json!("passthrough"));
        assert_eq!(ForwardMode::default(), ForwardMode::Filtered);
        assert_eq!(ForwardMode::Filtered.to_string(), "filtered");
    }
}
