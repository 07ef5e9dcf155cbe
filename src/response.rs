//! Translation of backend responses into invocation responses

use crate::event::OutboundResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::body::Bytes;
use hyper::HeaderMap;
use std::collections::HashMap;

/// Response received from the backend on a successful attempt
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Collapse multi-valued headers into one value per name, joined by ", "
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

/// Convert a backend response into the invocation response.
///
/// The body is always base64 encoded with the flag set, text and binary alike.
pub fn to_outbound(response: BackendResponse) -> OutboundResponse {
    OutboundResponse {
        status_code: response.status,
        headers: flatten_headers(&response.headers),
        body: STANDARD.encode(&response.body),
        is_base64_encoded: true,
    }
}
