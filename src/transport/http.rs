//! HTTP transport to backend agents
//!
//! Every agent exposes the same small surface relative to its base URL:
//!
//! - `GET  /health` - liveness, any 2xx is alive
//! - `GET  /health/ready` - readiness, optional body `{"ready": bool, "credentials_present": bool}`
//! - `POST /run` - blocking run, body is the canonical request
//! - `POST /run/stream` - streamed run, reply is newline-delimited JSON frames
//! - `POST /cancel/{request_id}` - best-effort cancellation
//!
//! # Example
//!
//! ```no_run
//! use task_router::transport::{AgentTransport, HttpAgentTransport};
//! use task_router::registry::AgentEndpoint;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpAgentTransport::new();
//! let endpoint = AgentEndpoint::new("bias_scan", "http://bias-agent:8000");
//! transport.probe_liveness(&endpoint, Duration::from_secs(2)).await?;
//! # Ok(())
//! # }
//! ```

use super::ndjson::ndjson_frames;
use super::{AgentTransport, BackendBody, BackendReply, FrameStream, ReadinessProbe, TransportError};
use crate::config::ConfigError;
use crate::protocol::AgentRunRequest;
use crate::registry::AgentEndpoint;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// reqwest-backed [`AgentTransport`]
#[derive(Debug, Clone, Default)]
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

/// Optional readiness body reported by an agent
#[derive(Debug, Default, Deserialize)]
struct ReadinessBody {
    ready: Option<bool>,
    credentials_present: Option<bool>,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Attach the agent's bearer token when one is configured
    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        endpoint: &AgentEndpoint,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        match endpoint.auth_token() {
            Ok(Some(token)) => Ok(builder.bearer_auth(token)),
            Ok(None) => Ok(builder),
            Err(ConfigError::EnvVarNotFound(name)) => Err(TransportError::Credential(name)),
            Err(e) => Err(TransportError::Credential(e.to_string())),
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        builder.send().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

/// Decode a non-empty readiness body; it must be an object with boolean fields
fn decode_readiness(text: &str) -> Result<ReadinessBody, TransportError> {
    let invalid = |e: String| TransportError::Decode(format!("unrecognized readiness body: {e}"));

    match serde_json::from_str::<serde_json::Value>(text).map_err(|e| invalid(e.to_string()))? {
        value @ serde_json::Value::Object(_) => {
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
        }
        _ => Err(invalid("expected a JSON object".to_string())),
    }
}

/// `{base_url}/cancel/{request_id}` with the id escaped as one path segment
fn cancel_url(endpoint: &AgentEndpoint, request_id: &str) -> Result<Url, TransportError> {
    // Dot segments would be dropped from the path and address a different route
    if request_id.is_empty() || request_id == "." || request_id == ".." {
        return Err(TransportError::Connect(format!(
            "request id '{request_id}' cannot be addressed in a cancel URL"
        )));
    }

    let mut url = Url::parse(&endpoint.base_url)
        .map_err(|e| TransportError::Connect(format!("invalid agent base URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Connect("agent base URL cannot hold a path".to_string()))?
        .pop_if_empty()
        .push("cancel")
        .push(request_id);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[async_trait::async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn probe_liveness(
        &self,
        endpoint: &AgentEndpoint,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let url = endpoint.url("health");
        debug!(task_type = %endpoint.task_type, url = %url, "Liveness probe");

        let request = self.client.get(&url).timeout(timeout);
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
            })
        }
    }

    async fn probe_readiness(
        &self,
        endpoint: &AgentEndpoint,
        timeout: Duration,
    ) -> Result<ReadinessProbe, TransportError> {
        let url = endpoint.url("health/ready");
        debug!(task_type = %endpoint.task_type, url = %url, "Readiness probe");

        let request = self.authorize(self.client.get(&url).timeout(timeout), endpoint)?;
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Ok(ReadinessProbe {
                ready: false,
                credentials_present: false,
            });
        }

        // The body is optional; a bare 2xx means ready with credentials present.
        // A body that is present but unreadable is never taken as ready.
        let text = response.text().await.map_err(map_reqwest_error)?;
        let body: ReadinessBody = if text.trim().is_empty() {
            ReadinessBody::default()
        } else {
            decode_readiness(&text)?
        };

        Ok(ReadinessProbe {
            ready: body.ready.unwrap_or(true),
            credentials_present: body.credentials_present.unwrap_or(true),
        })
    }

    async fn run(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRunRequest,
    ) -> Result<BackendReply, TransportError> {
        let url = endpoint.url("run");
        debug!(
            task_type = %endpoint.task_type,
            request_id = %request.request_id,
            url = %url,
            "Dispatching synchronous run"
        );

        let builder = self.authorize(self.client.post(&url).json(request), endpoint)?;
        let response = self.send(builder).await?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;

        let body = if text.trim().is_empty() {
            BackendBody::Empty
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => BackendBody::Json(value),
                Err(_) => BackendBody::Unparseable(text),
            }
        };

        Ok(BackendReply { status, body })
    }

    async fn run_stream(
        &self,
        endpoint: &AgentEndpoint,
        request: &AgentRunRequest,
    ) -> Result<FrameStream, TransportError> {
        let url = endpoint.url("run/stream");
        debug!(
            task_type = %endpoint.task_type,
            request_id = %request.request_id,
            url = %url,
            "Opening agent stream"
        );

        let builder = self.authorize(self.client.post(&url).json(request), endpoint)?;
        let response = self.send(builder).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        Ok(ndjson_frames(response.bytes_stream()))
    }

    async fn cancel(
        &self,
        endpoint: &AgentEndpoint,
        request_id: &str,
    ) -> Result<(), TransportError> {
        let url = cancel_url(endpoint, request_id)?;
        debug!(task_type = %endpoint.task_type, url = %url, "Cancelling agent run");

        let builder = self.authorize(
            self.client.post(url).timeout(Duration::from_secs(5)),
            endpoint,
        )?;
        let response = self.send(builder).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RunMode;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> AgentRunRequest {
        AgentRunRequest {
            task_type: "bias_scan".to_string(),
            request_id: "req-1".to_string(),
            mode: RunMode::Demo,
            inputs: json!({"text": "hello"}),
        }
    }

    #[tokio::test]
    async fn test_run_forwards_canonical_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/run"))
            .and(body_partial_json(json!({
                "task_type": "bias_scan",
                "request_id": "req-1",
                "mode": "DEMO"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "outputs": {"findings": []}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let reply = transport.run(&endpoint, &request()).await.unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(
            reply.body,
            BackendBody::Json(json!({"ok": true, "outputs": {"findings": []}}))
        );
    }

    #[tokio::test]
    async fn test_run_keeps_unparseable_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let reply = transport.run(&endpoint, &request()).await.unwrap();

        assert_eq!(reply.status, 500);
        assert!(!reply.is_success());
        assert!(matches!(reply.body, BackendBody::Unparseable(_)));
    }

    #[tokio::test]
    async fn test_readiness_defaults_when_body_missing() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health/ready"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let probe = transport
            .probe_readiness(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(probe.ready);
        assert!(probe.credentials_present);
    }

    #[tokio::test]
    async fn test_readiness_reports_missing_credentials() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health/ready"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ready": true,
                "credentials_present": false
            })))
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let probe = transport
            .probe_readiness(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(probe.ready);
        assert!(!probe.credentials_present);
    }

    #[tokio::test]
    async fn test_unreadable_readiness_body_is_not_ready() {
        let bodies = [
            "<html>NOT READY: missing GOOGLE_CREDENTIALS</html>",
            r#"{"ready": "no", "credentials_present": 0}"#,
            "[true, true]",
            "true",
        ];

        for body in bodies {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/health/ready"))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&mock_server)
                .await;

            let transport = HttpAgentTransport::new();
            let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
            let result = transport
                .probe_readiness(&endpoint, Duration::from_secs(1))
                .await;

            assert!(
                matches!(result, Err(TransportError::Decode(_))),
                "body {body:?} gave {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_readiness_object_with_unknown_fields_is_accepted() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health/ready"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ready": false, "version": "1.4"})),
            )
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let probe = transport
            .probe_readiness(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!probe.ready);
        assert!(probe.credentials_present);
    }

    #[tokio::test]
    async fn test_liveness_probe_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());
        let result = transport
            .probe_liveness(&endpoint, Duration::from_millis(100))
            .await;

        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_liveness_probe_connection_refused() {
        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", "http://127.0.0.1:1");
        let result = transport
            .probe_liveness(&endpoint, Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_stream_frames_are_decoded() {
        let mock_server = MockServer::start().await;

        let body = "{\"sequence\":0,\"kind\":\"PROGRESS\",\"payload\":{}}\n\
                    {\"sequence\":1,\"kind\":\"DONE\",\"payload\":{}}\n";
        Mock::given(method("POST"))
            .and(path("/run/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri()).with_streaming(true);
        let frames: Vec<_> = transport
            .run_stream(&endpoint, &request())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap()["kind"], "DONE");
    }

    #[tokio::test]
    async fn test_bearer_token_sent_when_configured() {
        let mock_server = MockServer::start().await;
        std::env::set_var("TASK_ROUTER_HTTP_TEST_TOKEN", "s3cret");

        Mock::given(method("POST"))
            .and(path("/cancel/req-1"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri())
            .with_auth_token_env("TASK_ROUTER_HTTP_TEST_TOKEN");

        assert!(transport.cancel(&endpoint, "req-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_token_env_is_credential_error() {
        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", "http://127.0.0.1:1")
            .with_auth_token_env("TASK_ROUTER_HTTP_TEST_TOKEN_UNSET");

        let result = transport.run(&endpoint, &request()).await;
        assert_eq!(
            result,
            Err(TransportError::Credential(
                "TASK_ROUTER_HTTP_TEST_TOKEN_UNSET".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_cancel_escapes_request_id_as_one_segment() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/cancel/job%2F\.\.%2F\.\.%2Frun%3Fx=1%23frag$"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = HttpAgentTransport::new();
        let endpoint = AgentEndpoint::new("bias_scan", mock_server.uri());

        assert!(transport
            .cancel(&endpoint, "job/../../run?x=1#frag")
            .await
            .is_ok());
    }

    #[test]
    fn test_cancel_url_keeps_base_path_and_rejects_dot_ids() {
        let endpoint = AgentEndpoint::new("bias_scan", "http://agent:8000/v2/");
        let url = cancel_url(&endpoint, "a b?c").unwrap();
        assert_eq!(url.as_str(), "http://agent:8000/v2/cancel/a%20b%3Fc");

        assert!(cancel_url(&endpoint, "..").is_err());
        assert!(cancel_url(&endpoint, ".").is_err());
    }
}
