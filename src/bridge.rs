//! SMS-to-chat bridge pipeline.
//!
//! Validates the inbound request, finds the Flex Flow owning the sender
//! number, opens a chat channel backed by a task, and links the recipient
//! to that channel through a Proxy session. Every step depends on the one
//! before it, so they run strictly in sequence and the first failure ends
//! the request. Nothing already created upstream is rolled back.

use std::collections::HashMap;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::twilio::{ApiError, ApiResponse, ChannelRequest, FlexFlow, SessionRequest, TwilioClient};

pub const NO_FLOW_MESSAGE: &str = "Unable to find matching Flex Flow";
pub const CHANNEL_FAILED_MESSAGE: &str = "Failed to create chat channel";
pub const SESSION_FAILED_MESSAGE: &str = "Failed to create proxy session";

const TASK_INTEGRATION: &str = "task";
const CHAT_NAME_PREFIX: &str = "SMS";
const SESSION_MODE: &str = "message-only";

/// Client bookkeeping keys that never reach the caller.
const INTERNAL_SESSION_FIELDS: [&str; 2] = ["_version", "_solution"];

/// Body of an inbound bridge request, from JSON or form fields.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub from_number: Option<String>,
    pub to_name: Option<String>,
    pub to_number: Option<String>,
}

/// An inbound request with every required field present.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub from_number: String,
    pub to_name: String,
    pub to_number: String,
}

impl InboundRequest {
    /// Read each field from a JSON object on its own, so one mistyped value
    /// cannot hide the others. Non-string scalars such as numbers count as
    /// present.
    pub fn from_json(fields: &Map<String, Value>) -> Self {
        let field = |key: &str| fields.get(key).and_then(field_text);
        Self {
            from_number: field("fromNumber"),
            to_name: field("toName"),
            to_number: field("toNumber"),
        }
    }

    pub fn from_form(fields: &HashMap<String, String>) -> Self {
        let field = |key: &str| fields.get(key).cloned();
        Self {
            from_number: field("fromNumber"),
            to_name: field("toName"),
            to_number: field("toNumber"),
        }
    }

    /// Checks fields in order (sender, name, recipient) and names the first
    /// one missing. Empty strings count as missing.
    pub fn validate(self) -> Result<ValidatedRequest, String> {
        fn present(value: Option<String>, field: &str) -> Result<String, String> {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("Missing '{}' in request body", field))
        }

        Ok(ValidatedRequest {
            from_number: present(self.from_number, "fromNumber")?,
            to_name: present(self.to_name, "toName")?,
            to_number: present(self.to_number, "toNumber")?,
        })
    }
}

/// Attributes attached to the task that backs the chat channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAttributes {
    pub to: String,
    pub direction: String,
    pub name: String,
    pub from: String,
    pub target_worker_phone: String,
    pub auto_answer: bool,
}

impl TaskAttributes {
    pub fn outbound(request: &ValidatedRequest) -> Self {
        Self {
            to: request.to_number.clone(),
            direction: "outbound".to_string(),
            name: request.to_name.clone(),
            from: request.from_number.clone(),
            target_worker_phone: request.from_number.clone(),
            auto_answer: true,
        }
    }
}

/// One side of a Proxy session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Participant {
    pub identifier: String,
    pub proxy_identifier: String,
    pub friendly_name: String,
}

/// The recipient's phone and the chat channel, both masked behind the
/// sender number.
pub fn session_participants(channel_sid: &str, request: &ValidatedRequest) -> [Participant; 2] {
    [
        Participant {
            identifier: request.to_number.clone(),
            proxy_identifier: request.from_number.clone(),
            friendly_name: request.to_name.clone(),
        },
        Participant {
            identifier: channel_sid.to_string(),
            proxy_identifier: request.from_number.clone(),
            friendly_name: request.to_name.clone(),
        },
    ]
}

/// First flow, in listing order, bound to `from_number` with a task integration.
pub fn find_flex_flow<'a>(flows: &'a [FlexFlow], from_number: &str) -> Option<&'a FlexFlow> {
    flows.iter().find(|flow| {
        flow.contact_identity.as_deref() == Some(from_number)
            && flow.integration_type.as_deref() == Some(TASK_INTEGRATION)
    })
}

pub fn chat_friendly_name(to_number: &str) -> String {
    format!("{}{}", CHAT_NAME_PREFIX, to_number)
}

/// Status and JSON body handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl BridgeResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn message(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({ "message": message }),
        }
    }

    fn validation(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "status": StatusCode::BAD_REQUEST.as_u16(), "message": message }),
        }
    }

    /// A call that failed outright. Platform errors keep their status and
    /// body. Transport and decode failures have no status of their own and
    /// answer 500 with a body that carries none either.
    fn upstream_failure(err: &anyhow::Error) -> Self {
        if let Some(api) = err.downcast_ref::<ApiError>() {
            return Self {
                status: api.status,
                body: api.body.clone(),
            };
        }

        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "message": format!("{:#}", err) }),
        }
    }

    /// A created resource that came back without a sid: the platform's own
    /// body, under the status it reports.
    fn missing_sid(response: ApiResponse) -> Self {
        let status = response
            .body
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(response.status);

        Self {
            status,
            body: response.body,
        }
    }
}

/// `null`, `false`, zero and the empty string count as no result at all.
fn is_falsy(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn field_text(value: &Value) -> Option<String> {
    if is_falsy(value) {
        return None;
    }
    match value {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn sid_of(body: &Value) -> Option<&str> {
    body.get("sid").and_then(Value::as_str).filter(|sid| !sid.is_empty())
}

/// Run the whole pipeline for one request. Always produces a response.
pub async fn run(client: &TwilioClient, request: InboundRequest) -> BridgeResponse {
    debug!(
        "Received event: fromNumber={:?} toName={:?} toNumber={:?}",
        request.from_number, request.to_name, request.to_number
    );

    let request = match request.validate() {
        Ok(request) => request,
        Err(message) => {
            info!("Event property check failed: {}", message);
            return BridgeResponse::validation(message);
        }
    };

    info!(
        "Finding Flex Flow matching {} with integration_type of {}",
        request.from_number, TASK_INTEGRATION
    );
    let flows = match client.list_flex_flows().await {
        Ok(flows) => flows,
        Err(e) => {
            error!("Flex Flow lookup failed: {:#}", e);
            return BridgeResponse::upstream_failure(&e);
        }
    };
    if flows.is_empty() {
        error!("No Flex Flows returned from lookup");
    }

    let Some(flow) = find_flex_flow(&flows, &request.from_number) else {
        return BridgeResponse::message(StatusCode::INTERNAL_SERVER_ERROR, NO_FLOW_MESSAGE);
    };
    info!(
        "Matched Flex Flow {} (chat service {})",
        flow.sid,
        flow.chat_service_sid.as_deref().unwrap_or("none")
    );

    let identity = Uuid::new_v4().to_string();

    let task_attributes = match serde_json::to_string(&TaskAttributes::outbound(&request)) {
        Ok(attrs) => attrs,
        Err(e) => {
            return BridgeResponse::upstream_failure(&anyhow::Error::new(e));
        }
    };
    let channel_request = ChannelRequest {
        flex_flow_sid: flow.sid.clone(),
        target: request.to_number.clone(),
        identity: identity.clone(),
        chat_user_friendly_name: request.to_name.clone(),
        chat_friendly_name: chat_friendly_name(&request.to_number),
        task_attributes,
    };

    let channel = match client.create_chat_channel(&channel_request).await {
        Ok(channel) => channel,
        Err(e) => {
            error!("Chat channel creation failed: {:#}", e);
            return BridgeResponse::upstream_failure(&e);
        }
    };
    if is_falsy(&channel.body) {
        return BridgeResponse::message(StatusCode::INTERNAL_SERVER_ERROR, CHANNEL_FAILED_MESSAGE);
    }
    let Some(channel_sid) = sid_of(&channel.body).map(str::to_string) else {
        error!("Chat channel response has no sid (status {})", channel.status);
        return BridgeResponse::missing_sid(channel);
    };
    info!("Chat channel created: {}", channel_sid);

    let mut chat_channel = Map::new();
    chat_channel.insert("identity".to_string(), Value::String(identity));
    if let Value::Object(fields) = channel.body {
        chat_channel.extend(fields);
    }

    let participants = match serde_json::to_string(&session_participants(&channel_sid, &request)) {
        Ok(participants) => participants,
        Err(e) => {
            return BridgeResponse::upstream_failure(&anyhow::Error::new(e));
        }
    };
    let session_request = SessionRequest {
        unique_name: channel_sid.clone(),
        mode: SESSION_MODE.to_string(),
        participants,
    };

    let session = match client.create_proxy_session(&session_request).await {
        Ok(session) => session,
        Err(e) => {
            // The chat channel stays behind on the platform.
            error!("Proxy session creation failed for channel {}: {:#}", channel_sid, e);
            return BridgeResponse::upstream_failure(&e);
        }
    };
    if is_falsy(&session.body) {
        return BridgeResponse::message(StatusCode::INTERNAL_SERVER_ERROR, SESSION_FAILED_MESSAGE);
    }
    let Some(session_sid) = sid_of(&session.body).map(str::to_string) else {
        error!("Proxy session response has no sid (status {})", session.status);
        return BridgeResponse::missing_sid(session);
    };
    info!("Proxy session created: {}", session_sid);

    let mut proxy_session = Map::new();
    if let Value::Object(fields) = session.body {
        proxy_session.extend(
            fields
                .into_iter()
                .filter(|(key, _)| !INTERNAL_SESSION_FIELDS.contains(&key.as_str())),
        );
    }

    BridgeResponse::ok(json!({
        "chatChannel": chat_channel,
        "proxySession": proxy_session,
    }))
}
