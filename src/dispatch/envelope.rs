//! Result envelope builder
//!
//! Agents answer in a handful of shapes. Everything that reaches a caller is
//! normalized here into an [`AgentRunResponse`] carrying exactly one of
//! outputs or error; anything ambiguous becomes `MalformedUpstreamResponse`.

use crate::error::RouterError;
use crate::protocol::AgentRunResponse;
use crate::transport::{BackendBody, BackendReply};
use serde_json::{Map, Value};

/// Wrap a backend reply into the uniform envelope
pub fn wrap(request_id: &str, reply: &BackendReply) -> AgentRunResponse {
    match classify(reply) {
        Ok(outputs) => AgentRunResponse::success(request_id, outputs),
        Err(err) => from_error(request_id, &err),
    }
}

/// Failure envelope for an error raised anywhere in the router
pub fn from_error(request_id: &str, err: &RouterError) -> AgentRunResponse {
    AgentRunResponse::failure(request_id, err.to_descriptor())
}

/// Decide whether a reply is a success, an agent-reported failure or malformed
pub fn classify(reply: &BackendReply) -> Result<Value, RouterError> {
    let object = match &reply.body {
        BackendBody::Json(Value::Object(map)) => map,
        BackendBody::Json(_) if reply.is_success() => {
            return Err(RouterError::malformed("agent reply is not a JSON object"))
        }
        BackendBody::Unparseable(_) if reply.is_success() => {
            return Err(RouterError::malformed("agent reply is not valid JSON"))
        }
        BackendBody::Empty if reply.is_success() => {
            return Err(RouterError::malformed("agent reply is empty"))
        }
        _ => return Err(status_failure(reply.status)),
    };

    let ok = match object.get("ok") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(RouterError::malformed("agent reply has non-boolean 'ok'")),
    };

    let outputs = present(object, "outputs").or_else(|| present(object, "result"));
    let error = present(object, "error");

    match (outputs, error) {
        (Some(_), Some(_)) => Err(RouterError::malformed(
            "agent reply has both outputs and error",
        )),
        (Some(outputs), None) => {
            if ok == Some(false) {
                Err(RouterError::malformed("agent reply has ok=false with outputs"))
            } else if !reply.is_success() {
                Err(RouterError::malformed(format!(
                    "agent reply has outputs with HTTP {}",
                    reply.status
                )))
            } else {
                Ok(outputs.clone())
            }
        }
        (None, Some(error)) => {
            if ok == Some(true) {
                Err(RouterError::malformed("agent reply has ok=true with error"))
            } else {
                Err(agent_failure(error))
            }
        }
        (None, None) if !reply.is_success() => Err(status_failure(reply.status)),
        (None, None) => Err(RouterError::malformed(
            "agent reply has neither outputs nor error",
        )),
    }
}

fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn status_failure(status: u16) -> RouterError {
    RouterError::upstream(format!("agent returned HTTP {status}"))
}

/// `UpstreamError` for an agent-reported error, or malformed if it is unusable
fn agent_failure(error: &Value) -> RouterError {
    match error {
        Value::String(message) if !message.is_empty() => RouterError::upstream(message),
        Value::Object(map) => {
            let message = map.get("message").and_then(Value::as_str);
            let kind = map.get("kind").and_then(Value::as_str);
            match (kind, message) {
                (Some(kind), Some(message)) => RouterError::upstream(format!("{kind}: {message}")),
                (None, Some(message)) => RouterError::upstream(message),
                (Some(kind), None) => RouterError::upstream(kind),
                (None, None) => RouterError::malformed("agent error has neither kind nor message"),
            }
        }
        _ => RouterError::malformed("agent error is not an object or string"),
    }
}
