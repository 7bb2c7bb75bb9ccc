use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TwilioConfig;

/// A Flex Flow as returned by the FlexFlows listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FlexFlow {
    pub sid: String,
    #[serde(default)]
    pub chat_service_sid: Option<String>,
    #[serde(default)]
    pub contact_identity: Option<String>,
    #[serde(default)]
    pub integration_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlexFlowList {
    #[serde(default)]
    flex_flows: Option<Vec<Value>>,
}

/// Form fields for creating a Flex chat channel.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub flex_flow_sid: String,
    pub target: String,
    pub identity: String,
    pub chat_user_friendly_name: String,
    pub chat_friendly_name: String,
    /// JSON-encoded task attributes.
    pub task_attributes: String,
}

/// Form fields for creating a Proxy session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub unique_name: String,
    pub mode: String,
    /// JSON-encoded participants array.
    pub participants: String,
}

/// Decoded body of a create call along with the HTTP status it came with.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

/// A non-2xx answer from an endpoint that treats those as failures.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self
            .body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        write!(f, "Twilio API error ({}): {}", self.status, message)
    }
}

impl std::error::Error for ApiError {}

pub struct TwilioClient {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioClient {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn proxy_service_sid(&self) -> &str {
        &self.config.proxy_service_sid
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
    }

    /// List every Flex Flow on the account. A body without a `flex_flows`
    /// collection yields an empty list. Entries are decoded one by one and
    /// malformed ones are skipped.
    pub async fn list_flex_flows(&self) -> Result<Vec<FlexFlow>> {
        let url = format!("{}/FlexFlows", self.config.flex_base_url);
        debug!("Fetching Flex Flows: {}", url);

        let response = self
            .with_auth(self.client.get(&url))
            .header("Content-Type", "application/json")
            .send()
            .await
            .context("Error fetching Flex Flows")?;

        let list: FlexFlowList = response
            .json()
            .await
            .context("Error converting Flex Flows response to JSON")?;

        let flows = list
            .flex_flows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<FlexFlow>(entry) {
                Ok(flow) => Some(flow),
                Err(e) => {
                    warn!("Skipping malformed Flex Flow entry: {}", e);
                    None
                }
            })
            .collect();

        Ok(flows)
    }

    /// Create a chat channel. The body is returned whatever the status, the
    /// caller decides success by the presence of a `sid`.
    pub async fn create_chat_channel(&self, request: &ChannelRequest) -> Result<ApiResponse> {
        let url = format!("{}/Channels", self.config.flex_base_url);
        debug!("Creating chat channel: {}", url);

        let form = [
            ("FlexFlowSid", request.flex_flow_sid.as_str()),
            ("Target", request.target.as_str()),
            ("Identity", request.identity.as_str()),
            ("ChatUserFriendlyName", request.chat_user_friendly_name.as_str()),
            ("ChatFriendlyName", request.chat_friendly_name.as_str()),
            ("TaskAttributes", request.task_attributes.as_str()),
        ];

        let response = self
            .with_auth(self.client.post(&url))
            .form(&form)
            .send()
            .await
            .context("Error creating chat channel")?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("Error converting chat channel response to JSON")?;

        Ok(ApiResponse { status, body })
    }

    /// Create a Proxy session on the configured service. Non-2xx answers
    /// surface as an [`ApiError`].
    pub async fn create_proxy_session(&self, request: &SessionRequest) -> Result<ApiResponse> {
        let url = format!(
            "{}/Services/{}/Sessions",
            self.config.proxy_base_url, self.config.proxy_service_sid
        );
        debug!("Creating proxy session: {}", url);

        let form = [
            ("UniqueName", request.unique_name.as_str()),
            ("Mode", request.mode.as_str()),
            ("Participants", request.participants.as_str()),
        ];

        let response = self
            .with_auth(self.client.post(&url))
            .form(&form)
            .send()
            .await
            .context("Error creating proxy session")?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("Error converting proxy session response to JSON")?;

        if !status.is_success() {
            return Err(ApiError { status, body }.into());
        }

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> TwilioClient {
        TwilioClient::new(TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: "token".into(),
            proxy_service_sid: "KS999".into(),
            flex_base_url: base_url.to_string(),
            proxy_base_url: base_url.to_string(),
        })
    }

    fn session_request() -> SessionRequest {
        SessionRequest {
            unique_name: "CH1".into(),
            mode: "message-only".into(),
            participants: "[]".into(),
        }
    }

    #[tokio::test]
    async fn test_list_flex_flows_sends_basic_auth() {
        let server = MockServer::start().await;

        // base64("AC123:token")
        Mock::given(method("GET"))
            .and(path("/FlexFlows"))
            .and(header("Authorization", "Basic QUMxMjM6dG9rZW4="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "flex_flows": [{
                    "sid": "FO1",
                    "chat_service_sid": "IS1",
                    "contact_identity": "+15550001111",
                    "integration_type": "task"
                }]
            })))
            .mount(&server)
            .await;

        let flows = test_client(&server.uri()).list_flex_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sid, "FO1");
        assert_eq!(flows[0].chat_service_sid.as_deref(), Some("IS1"));
    }

    #[tokio::test]
    async fn test_list_flex_flows_skips_malformed_entries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/FlexFlows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "flex_flows": [
                    { "sid": null, "integration_type": "studio" },
                    { "contact_identity": "+15550001111" },
                    {
                        "sid": "FO2",
                        "contact_identity": "+15550001111",
                        "integration_type": "task"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let flows = test_client(&server.uri()).list_flex_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sid, "FO2");
    }

    #[tokio::test]
    async fn test_list_flex_flows_missing_collection_is_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/FlexFlows"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": 20003,
                "message": "Authenticate",
                "status": 401
            })))
            .mount(&server)
            .await;

        let flows = test_client(&server.uri()).list_flex_flows().await.unwrap();
        assert!(flows.is_empty());
    }

    #[tokio::test]
    async fn test_list_flex_flows_invalid_json_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/FlexFlows"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        assert!(test_client(&server.uri()).list_flex_flows().await.is_err());
    }

    #[tokio::test]
    async fn test_create_chat_channel_posts_form() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Channels"))
            .and(header("Content-Type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("FlexFlowSid=FO1"))
            .and(body_string_contains("ChatFriendlyName=SMS%2B15559876543"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "CH1"})))
            .mount(&server)
            .await;

        let request = ChannelRequest {
            flex_flow_sid: "FO1".into(),
            target: "+15559876543".into(),
            identity: "id-1".into(),
            chat_user_friendly_name: "Jane".into(),
            chat_friendly_name: "SMS+15559876543".into(),
            task_attributes: "{}".into(),
        };
        let response = test_client(&server.uri())
            .create_chat_channel(&request)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body["sid"], "CH1");
    }

    #[tokio::test]
    async fn test_create_chat_channel_keeps_error_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Channels"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 20001,
                "message": "Invalid FlexFlowSid",
                "status": 400
            })))
            .mount(&server)
            .await;

        let request = ChannelRequest {
            flex_flow_sid: "bad".into(),
            target: "+1".into(),
            identity: "id".into(),
            chat_user_friendly_name: "n".into(),
            chat_friendly_name: "SMS+1".into(),
            task_attributes: "{}".into(),
        };
        let response = test_client(&server.uri())
            .create_chat_channel(&request)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["message"], "Invalid FlexFlowSid");
    }

    #[tokio::test]
    async fn test_create_proxy_session_uses_service_path() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Services/KS999/Sessions"))
            .and(body_string_contains("Mode=message-only"))
            .and(body_string_contains("UniqueName=CH1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sid": "KC1"})))
            .mount(&server)
            .await;

        let session = test_client(&server.uri())
            .create_proxy_session(&session_request())
            .await
            .unwrap();
        assert_eq!(session.status, StatusCode::CREATED);
        assert_eq!(session.body["sid"], "KC1");
    }

    #[tokio::test]
    async fn test_create_proxy_session_non_success_is_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Services/KS999/Sessions"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": 80603,
                "message": "Session UniqueName must be unique.",
                "status": 409
            })))
            .mount(&server)
            .await;

        let err = test_client(&server.uri())
            .create_proxy_session(&session_request())
            .await
            .unwrap_err();

        let api = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.body["code"], 80603);
        assert!(err.to_string().contains("must be unique"));
    }
}
