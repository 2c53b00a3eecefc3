//! HTTP seam for push providers.
//!
//! Providers talk to Apple/Google through this trait so tests can stub the
//! network. The real transport is a blocking `ureq` agent with a global
//! timeout — provider calls run on the dispatcher's worker pool, never on
//! the RPC path.

use std::time::Duration;

/// Failure of a single HTTP exchange.
#[derive(Debug)]
pub enum TransportError {
    /// Non-2xx response, with body text if any.
    Status(u16, String),
    /// Connect/timeout/TLS level failure.
    Network(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code, body) => write!(f, "http status {code}: {body}"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

pub trait PushTransport: Send + Sync {
    /// POST a JSON body and return the parsed JSON response.
    ///
    /// An empty 2xx body parses as `Null` (APNS success responses carry
    /// no body).
    fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;
}

/// Blocking `ureq` transport with a global per-call timeout.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl PushTransport for UreqTransport {
    fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let mut request = self.agent.post(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let mut response = request
            .send_json(body)
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(TransportError::Status(status, text));
        }
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Network(e.to_string()))
    }
}
