//! APNS wake-up provider.
//!
//! A certificate bundle is selected per (logical client name, production
//! vs sandbox) from the client's reported build variant. A missing bundle
//! skips that registration and logs — push is best-effort, so it never
//! fails the cycle. The payload carries the unread badge and a localized
//! "one new message" / "N new messages" alert key.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use cachet_model::{ClientRegistration, CoreError};

use super::transport::{PushTransport, TransportError};
use super::{PushOutcome, PushProvider, PushStatus, WakePayload};

const APNS_PRODUCTION_HOST: &str = "https://api.push.apple.com";
const APNS_SANDBOX_HOST: &str = "https://api.sandbox.push.apple.com";

const LOC_KEY_ONE: &str = "apn_one_new_message";
const LOC_KEY_MANY: &str = "apn_new_messages";

/// APNS response reasons that mean the token is permanently dead.
const DEAD_TOKEN_REASONS: &[&str] = &["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"];

/// One configured certificate bundle.
#[derive(Debug, Clone)]
pub struct ApnsBundle {
    pub client_name: String,
    pub production: bool,
    pub cert_path: String,
    pub cert_password: String,
}

pub struct ApnsProvider {
    /// Keyed by (client name, production flag).
    bundles: HashMap<(String, bool), ApnsBundle>,
    transport: Arc<dyn PushTransport>,
}

impl ApnsProvider {
    pub fn new(bundles: Vec<ApnsBundle>, transport: Arc<dyn PushTransport>) -> Self {
        let bundles = bundles
            .into_iter()
            .map(|b| ((b.client_name.clone(), b.production), b))
            .collect();
        Self { bundles, transport }
    }

    fn push_one(&self, registration: &ClientRegistration, wake: &WakePayload) -> PushStatus {
        let Some(token) = registration.apns_token.as_deref() else {
            return PushStatus::Skipped("no apns token".to_string());
        };
        let client_name = registration.apns_client_name.as_deref().unwrap_or_default();
        let Some(bundle) = self
            .bundles
            .get(&(client_name.to_string(), registration.apns_production))
        else {
            let err = CoreError::ConfigurationMissing(format!(
                "apns certificate bundle for {client_name} (production={})",
                registration.apns_production
            ));
            tracing::warn!(
                client = %registration.client_id,
                error = %err,
                "skipping push"
            );
            return PushStatus::Skipped(err.to_string());
        };

        let host = if bundle.production {
            APNS_PRODUCTION_HOST
        } else {
            APNS_SANDBOX_HOST
        };
        let url = format!("{host}/3/device/{token}");
        let badge = wake.undelivered + registration.unread_count;
        let loc_key = if wake.undelivered == 1 {
            LOC_KEY_ONE
        } else {
            LOC_KEY_MANY
        };
        let body = json!({
            "aps": {
                "alert": {
                    "loc-key": loc_key,
                    "loc-args": [wake.undelivered.to_string()],
                },
                "sound": "default",
                "badge": badge,
            }
        });
        let headers = [
            ("apns-topic", bundle.client_name.clone()),
            ("apns-push-type", "alert".to_string()),
        ];

        match self.transport.post_json(&url, &headers, &body) {
            Ok(_) => PushStatus::Delivered,
            Err(TransportError::Status(code, text)) if code == 400 || code == 410 => {
                let reason = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v.get("reason").and_then(|r| r.as_str().map(String::from)))
                    .unwrap_or_default();
                if DEAD_TOKEN_REASONS.contains(&reason.as_str()) {
                    PushStatus::Invalid
                } else {
                    PushStatus::Transient(format!("apns {code}: {reason}"))
                }
            }
            Err(e) => PushStatus::Transient(e.to_string()),
        }
    }
}

impl PushProvider for ApnsProvider {
    fn name(&self) -> &'static str {
        "apns"
    }

    fn supports(&self, registration: &ClientRegistration) -> bool {
        registration.apns_token.is_some()
    }

    fn push(
        &self,
        registrations: &[ClientRegistration],
        wake: &WakePayload,
    ) -> Result<Vec<PushOutcome>, CoreError> {
        Ok(registrations
            .iter()
            .map(|registration| PushOutcome {
                client_id: registration.client_id.clone(),
                status: self.push_one(registration, wake),
            })
            .collect())
    }
}
