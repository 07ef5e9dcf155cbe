//! Invocation event and response shapes exchanged with the hosting platform
//!
//! Events follow the HTTP API v2 payload format. Every field is optional so a
//! partial or malformed event still deserializes; the accessors below apply the
//! defaults that make translation total.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Method used when the event carries no HTTP context
pub const DEFAULT_METHOD: &str = "GET";
/// Path used when the event carries no raw path
pub const DEFAULT_PATH: &str = "/";

/// Inbound invocation event
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default, deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub route_key: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub raw_path: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub raw_query_string: Option<String>,
    #[serde(default, deserialize_with = "lenient_headers")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, deserialize_with = "lenient")]
    pub request_context: Option<RequestContext>,
    #[serde(default, deserialize_with = "lenient")]
    pub body: Option<String>,
    /// Whether `body` is pre-encoded by the platform
    #[serde(default, deserialize_with = "lenient")]
    pub is_base64_encoded: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default, deserialize_with = "lenient")]
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub http: Option<HttpContext>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpContext {
    #[serde(default, deserialize_with = "lenient")]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source_ip: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub user_agent: Option<String>,
}

impl InboundEvent {
    /// Build a minimal event, mostly useful for smoke tests
    pub fn new(method: &str, raw_path: &str) -> Self {
        Self {
            raw_path: Some(raw_path.to_string()),
            request_context: Some(RequestContext {
                request_id: None,
                http: Some(HttpContext {
                    method: Some(method.to_string()),
                    path: Some(raw_path.to_string()),
                    ..HttpContext::default()
                }),
            }),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.raw_query_string = Some(query.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    /// Declared HTTP method, `GET` when the event has no HTTP context
    pub fn method(&self) -> &str {
        self.request_context
            .as_ref()
            .and_then(|ctx| ctx.http.as_ref())
            .and_then(|http| http.method.as_deref())
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_METHOD)
    }

    /// Raw path, `/` when absent or empty
    pub fn path(&self) -> &str {
        self.raw_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PATH)
    }

    /// Raw query string, `None` when absent or empty
    pub fn query(&self) -> Option<&str> {
        self.raw_query_string.as_deref().filter(|q| !q.is_empty())
    }

    /// Content-Type header value, looked up case-insensitively
    pub fn content_type(&self) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .map(|(_, value)| value.as_str())
        })
    }

    pub fn body_is_base64(&self) -> bool {
        self.is_base64_encoded.unwrap_or(false)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_context
            .as_ref()
            .and_then(|ctx| ctx.request_id.as_deref())
    }
}

/// A value of the wrong type reads as absent instead of failing the event
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Keep string-valued headers only; anything else is dropped
fn lenient_headers<'de, D>(deserializer: D) -> Result<Option<HashMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(Some(
            map.into_iter()
                .filter_map(|(name, value)| match value {
                    Value::String(value) => Some((name, value)),
                    _ => None,
                })
                .collect(),
        )),
        _ => Ok(None),
    }
}

/// Response returned to the platform for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_base64_encoded: bool,
}
