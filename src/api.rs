//! Order server request client.
//!
//! Provides the bulk order load and the per-command mutation calls issued
//! while draining the command queue. Every call carries the operator's bearer
//! credential.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::credentials::CredentialSource;
use crate::error::ApiError;
use crate::model::{Command, CommandPayload, Order, OrderStatus};

const ORDERS_PATH: &str = "/api/fuel-orders";

/// Request seam between the engine and the server of record.
#[async_trait]
pub trait OrderApi: Send + Sync + 'static {
    /// Full order collection for `InitialLoad` and reconnect refreshes.
    async fn fetch_orders(&self) -> Result<Vec<Order>, ApiError>;

    /// Issue the call for one queued command. Returns the server's copy of
    /// the order when the response carries one.
    async fn execute(&self, command: &Command) -> Result<Option<Order>, ApiError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the server base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Method, path and JSON body for one command.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

pub fn request_for(command: &Command) -> RequestSpec {
    let order_id = command.order_id();
    match &command.payload {
        CommandPayload::ClaimOrder { .. } => RequestSpec {
            method: Method::PATCH,
            path: format!("{ORDERS_PATH}/{order_id}/status"),
            body: serde_json::json!({ "status": OrderStatus::Acknowledged }),
        },
        CommandPayload::UpdateStatus { status, .. } => RequestSpec {
            method: Method::PATCH,
            path: format!("{ORDERS_PATH}/{order_id}/status"),
            body: serde_json::json!({ "status": status }),
        },
        CommandPayload::AcknowledgeChange { change_version, .. } => RequestSpec {
            method: Method::POST,
            path: format!("{ORDERS_PATH}/{order_id}/acknowledge-change"),
            body: serde_json::json!({ "changeVersion": change_version }),
        },
        CommandPayload::CompleteOrder { completion, .. } => RequestSpec {
            method: Method::PUT,
            path: format!("{ORDERS_PATH}/{order_id}/submit-data"),
            body: serde_json::json!({
                "startMeterReading": completion.start_meter_reading,
                "endMeterReading": completion.end_meter_reading,
                "gallonsDelivered": completion.gallons_delivered,
                "notes": completion.notes,
            }),
        },
    }
}

/// Pull an order out of a confirmation body: either the order itself or an
/// envelope with an `order` / `data` field. Acks without an order yield `None`.
pub fn extract_order(body: &Value) -> Option<Order> {
    let candidate = if body.get("id").is_some() && body.get("status").is_some() {
        body
    } else {
        body.get("order").or_else(|| body.get("data"))?
    };
    match serde_json::from_value::<Order>(candidate.clone()) {
        Ok(order) => Some(order),
        Err(e) => {
            debug!(error = %e, "confirmation body did not contain a usable order");
            None
        }
    }
}

/// Decode the bulk load: a bare array or `{ "orders": [...] }`.
pub fn extract_orders(body: Value) -> Result<Vec<Order>, ApiError> {
    let list = match body {
        Value::Array(list) => Value::Array(list),
        Value::Object(mut map) => map
            .remove("orders")
            .or_else(|| map.remove("data"))
            .ok_or_else(|| ApiError::Decode("expected an order list".to_string()))?,
        _ => return Err(ApiError::Decode("expected an order list".to_string())),
    };
    serde_json::from_value(list).map_err(|e| ApiError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_connect() {
        return ApiError::Connect {
            url: url.to_string(),
        };
    }
    if err.is_timeout() {
        return ApiError::Timeout {
            url: url.to_string(),
        };
    }
    if err.is_builder() {
        return ApiError::Request(format!("invalid order server URL: {url}"));
    }
    ApiError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Default message for an HTTP status code.
pub fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Credential is invalid or expired".to_string(),
        403 => "Operator not authorized".to_string(),
        404 => "Order endpoint not found".to_string(),
        409 => "Order was changed by someone else".to_string(),
        s if s >= 500 => "Order server error".to_string(),
        _ => "Unexpected response from order server".to_string(),
    }
}

/// Build the error for a non-success response, keeping the server's own
/// message when the body has one.
pub fn status_error(status: StatusCode, body_text: &str) -> ApiError {
    let trimmed = body_text.trim();
    let message = match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_message(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_message(status)),
        Err(_) => status_message(status),
    };
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// reqwest client
// ---------------------------------------------------------------------------

pub struct HttpOrderApi {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpOrderApi {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let token = self
            .credentials
            .bearer_token()
            .map_err(|e| ApiError::Credential(e.to_string()))?;
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .bearer_auth(token.as_str())
            .header("Accept", "application/json");
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let err = status_error(status, &body_text);
            warn!(%method, path, status = status.as_u16(), error = %err, "order server rejected request");
            return Err(err);
        }

        // Empty 204 responses come back as null.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn fetch_orders(&self) -> Result<Vec<Order>, ApiError> {
        let body = self.send(Method::GET, ORDERS_PATH, None).await?;
        let orders = extract_orders(body)?;
        debug!(count = orders.len(), "fetched order snapshot");
        Ok(orders)
    }

    async fn execute(&self, command: &Command) -> Result<Option<Order>, ApiError> {
        let spec = request_for(command);
        debug!(
            command_id = %command.id,
            kind = %command.kind(),
            method = %spec.method,
            path = %spec.path,
            "sending command"
        );
        // A 2xx is the server's acceptance; an unreadable body does not undo it.
        match self.send(spec.method, &spec.path, Some(&spec.body)).await {
            Ok(body) => Ok(extract_order(&body)),
            Err(ApiError::Decode(e)) => {
                warn!(command_id = %command.id, error = %e, "accepted command returned an unreadable body");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredential;
    use crate::error::FailureKind;
    use crate::model::CompletionData;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("orders.example.com/api/"), "https://orders.example.com");
        assert_eq!(normalize_base_url("localhost:3000/"), "http://localhost:3000");
        assert_eq!(normalize_base_url(" http://10.0.0.5:8080 "), "http://10.0.0.5:8080");
    }

    #[test]
    fn maps_commands_to_calls() {
        let claim = Command::new(CommandPayload::ClaimOrder { order_id: 7 });
        let spec = request_for(&claim);
        assert_eq!(spec.method, Method::PATCH);
        assert_eq!(spec.path, "/api/fuel-orders/7/status");
        assert_eq!(spec.body, serde_json::json!({ "status": "Acknowledged" }));

        let ack = Command::new(CommandPayload::AcknowledgeChange {
            order_id: 7,
            change_version: 4,
        });
        let spec = request_for(&ack);
        assert_eq!(spec.method, Method::POST);
        assert_eq!(spec.path, "/api/fuel-orders/7/acknowledge-change");
        assert_eq!(spec.body, serde_json::json!({ "changeVersion": 4 }));

        let complete = Command::new(CommandPayload::CompleteOrder {
            order_id: 7,
            completion: CompletionData {
                start_meter_reading: 1000.0,
                end_meter_reading: 1250.5,
                gallons_delivered: 250.5,
                notes: Some("left wing".into()),
            },
        });
        let spec = request_for(&complete);
        assert_eq!(spec.method, Method::PUT);
        assert_eq!(spec.body["gallonsDelivered"], serde_json::json!(250.5));
        assert_eq!(spec.body["notes"], serde_json::json!("left wing"));
    }

    #[test]
    fn extracts_order_from_confirmation_shapes() {
        let bare = serde_json::json!({ "id": 7, "status": "Acknowledged", "changeVersion": 2 });
        assert_eq!(extract_order(&bare).map(|o| o.change_version), Some(2));

        let wrapped = serde_json::json!({ "order": { "id": 7, "status": "EnRoute" } });
        assert_eq!(
            extract_order(&wrapped).map(|o| o.status),
            Some(OrderStatus::EnRoute)
        );

        assert_eq!(extract_order(&serde_json::json!({ "ok": true })), None);
        assert_eq!(extract_order(&Value::Null), None);
    }

    #[test]
    fn extracts_order_list_shapes() {
        let bare = serde_json::json!([{ "id": 1, "status": "Dispatched" }]);
        assert_eq!(extract_orders(bare).unwrap().len(), 1);

        let wrapped = serde_json::json!({ "orders": [
            { "id": 1, "status": "Dispatched" },
            { "id": 2, "status": "Completed" }
        ]});
        assert_eq!(extract_orders(wrapped).unwrap().len(), 2);

        assert!(matches!(
            extract_orders(serde_json::json!("nope")),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn status_errors_keep_server_message() {
        let err = status_error(
            StatusCode::CONFLICT,
            r#"{"error":"Stale changeVersion: expected 5"}"#,
        );
        assert_eq!(
            err,
            ApiError::Status {
                status: 409,
                message: "Stale changeVersion: expected 5".into()
            }
        );
        assert_eq!(err.classify(), FailureKind::Conflict);

        let err = status_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.to_string(), "Order server error (HTTP 502)");
        assert_eq!(err.classify(), FailureKind::Transient);
    }

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn execute_sends_bearer_and_parses_confirmation() {
        let body = r#"{"id":7,"status":"Acknowledged","assigneeId":42,"changeVersion":1}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let (url, server) = serve_once(response).await;
        let api = HttpOrderApi::new(
            &url,
            Arc::new(StaticCredential::new("tok-123")),
            Duration::from_secs(5),
        )
        .unwrap();

        let command = Command::new(CommandPayload::ClaimOrder { order_id: 7 });
        let confirmed = api.execute(&command).await.expect("accepted");
        assert_eq!(confirmed.map(|o| o.assignee_id), Some(Some(42)));

        let request = server.await.unwrap();
        assert!(request.starts_with("PATCH /api/fuel-orders/7/status"));
        assert!(request.to_lowercase().contains("authorization: bearer tok-123"));
    }

    #[tokio::test]
    async fn execute_surfaces_rejection_as_status_error() {
        let body = r#"{"error":"Invalid status transition"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 422 Unprocessable Entity\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            )
            .into_boxed_str(),
        );
        let (url, _server) = serve_once(response).await;
        let api = HttpOrderApi::new(
            &url,
            Arc::new(StaticCredential::new("tok")),
            Duration::from_secs(5),
        )
        .unwrap();

        let command = Command::new(CommandPayload::UpdateStatus {
            order_id: 7,
            status: OrderStatus::Fueling,
        });
        let err = api.execute(&command).await.expect_err("rejected");
        assert_eq!(
            err,
            ApiError::Status {
                status: 422,
                message: "Invalid status transition".into()
            }
        );
        assert_eq!(err.classify(), FailureKind::Permanent);
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = HttpOrderApi::new(
            &format!("http://{addr}"),
            Arc::new(StaticCredential::new("tok")),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = api.fetch_orders().await.expect_err("nothing listening");
        assert_eq!(err.classify(), FailureKind::Transient);
    }
}
