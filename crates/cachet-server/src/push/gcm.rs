//! GCM wake-up provider.
//!
//! Sends restricted-package multicasts in batches of at most 1000
//! registration ids (hard provider limit). Canonical registration ids in
//! the response are surfaced so the stored id gets replaced — stale ids
//! otherwise silently stop working. Per-registration failures never fail
//! the rest of a batch.

use std::sync::Arc;

use serde_json::json;

use cachet_model::{ClientRegistration, CoreError};

use super::transport::{PushTransport, TransportError};
use super::{PushOutcome, PushProvider, PushStatus, WakePayload};

const GCM_SEND_ENDPOINT: &str = "https://gcm-http.googleapis.com/gcm/send";

/// Hard GCM limit on registration ids per multicast request.
const MAX_BATCH: usize = 1000;

/// GCM response errors that mean the registration is permanently dead.
const DEAD_REGISTRATION_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration"];

pub struct GcmProvider {
    api_key: String,
    transport: Arc<dyn PushTransport>,
}

impl GcmProvider {
    pub fn new(api_key: String, transport: Arc<dyn PushTransport>) -> Self {
        Self { api_key, transport }
    }

    /// Callers must pass only id-bearing registrations: the response's
    /// `results` array aligns with `registration_ids` by index, so a
    /// member without an id would shift every outcome after it.
    fn send_batch(
        &self,
        package: &str,
        batch: &[&ClientRegistration],
        wake: &WakePayload,
    ) -> Result<Vec<PushOutcome>, CoreError> {
        let registration_ids: Vec<&str> = batch
            .iter()
            .filter_map(|r| r.gcm_registration_id.as_deref())
            .collect();
        let body = json!({
            "registration_ids": registration_ids,
            "restricted_package_name": package,
            "collapse_key": "new_messages",
            "data": { "message": wake.message },
        });
        let headers = [("Authorization", format!("key={}", self.api_key))];

        let response = match self.transport.post_json(GCM_SEND_ENDPOINT, &headers, &body) {
            Ok(v) => v,
            Err(TransportError::Status(code, text)) if (400..500).contains(&code) => {
                // Whole-request rejection (bad key, malformed payload) is
                // not a per-registration problem; nothing to retry inline.
                return Err(CoreError::Provider(format!(
                    "gcm rejected request: {code} {text}"
                )));
            }
            Err(e) => return Err(CoreError::Provider(e.to_string())),
        };

        // Results align with the request's registration id order.
        let results = response
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(batch.len());
        for (i, registration) in batch.iter().enumerate() {
            let status = match results.get(i) {
                Some(result) => {
                    if let Some(error) = result.get("error").and_then(|v| v.as_str()) {
                        if DEAD_REGISTRATION_ERRORS.contains(&error) {
                            PushStatus::Invalid
                        } else {
                            PushStatus::Transient(error.to_string())
                        }
                    } else if let Some(canonical) =
                        result.get("registration_id").and_then(|v| v.as_str())
                    {
                        PushStatus::Canonical(canonical.to_string())
                    } else {
                        PushStatus::Delivered
                    }
                }
                None => PushStatus::Transient("missing result entry".to_string()),
            };
            outcomes.push(PushOutcome {
                client_id: registration.client_id.clone(),
                status,
            });
        }
        Ok(outcomes)
    }
}

impl PushProvider for GcmProvider {
    fn name(&self) -> &'static str {
        "gcm"
    }

    fn supports(&self, registration: &ClientRegistration) -> bool {
        registration.gcm_registration_id.is_some()
    }

    fn push(
        &self,
        registrations: &[ClientRegistration],
        wake: &WakePayload,
    ) -> Result<Vec<PushOutcome>, CoreError> {
        let mut outcomes = Vec::with_capacity(registrations.len());

        // Only id-bearing registrations can be multicast; the rest are
        // reported instead of silently skewing result alignment.
        let (addressable, unaddressable): (Vec<&ClientRegistration>, Vec<&ClientRegistration>) =
            registrations
                .iter()
                .partition(|r| r.gcm_registration_id.is_some());
        for registration in unaddressable {
            outcomes.push(PushOutcome {
                client_id: registration.client_id.clone(),
                status: PushStatus::Skipped("no gcm registration id".to_string()),
            });
        }

        // One multicast per restricted package name.
        let mut packages: Vec<&str> = addressable
            .iter()
            .map(|r| r.gcm_package.as_deref().unwrap_or_default())
            .collect();
        packages.sort_unstable();
        packages.dedup();

        for package in packages {
            let group: Vec<&ClientRegistration> = addressable
                .iter()
                .filter(|r| r.gcm_package.as_deref().unwrap_or_default() == package)
                .copied()
                .collect();
            for batch in group.chunks(MAX_BATCH) {
                outcomes.extend(self.send_batch(package, batch, wake)?);
            }
        }
        Ok(outcomes)
    }
}
