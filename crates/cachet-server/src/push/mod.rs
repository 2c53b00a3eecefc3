//! Wake-up push dispatch.
//!
//! Wake requests are coalesced per client and deduped by a backlog
//! fingerprint; push is strictly best-effort relative to the authoritative
//! delivery state machine, so every failure here is logged and retried no
//! earlier than the next scheduled cycle.

pub mod apns;
pub mod gcm;
pub mod transport;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use cachet_model::{ClientRegistration, CoreError};

use crate::gateway::PersistenceGateway;

/// What a wake carries: the dedup fingerprint doubles as the data message.
#[derive(Debug, Clone)]
pub struct WakePayload {
    /// `"undelivered:{n}"` — also the dedup fingerprint.
    pub message: String,
    /// Deliveries still awaiting acknowledgement.
    pub undelivered: u32,
}

/// Per-registration result of a provider call.
#[derive(Debug)]
pub struct PushOutcome {
    pub client_id: String,
    pub status: PushStatus,
}

#[derive(Debug)]
pub enum PushStatus {
    /// Accepted by the provider.
    Delivered,
    /// Accepted, and the provider reported a canonical registration id
    /// the stored one must be replaced with.
    Canonical(String),
    /// Registration is permanently dead; the channel must be cleared.
    Invalid,
    /// Transient failure; retried on the next wake cycle only.
    Transient(String),
    /// Not attempted (e.g. missing certificate bundle); never fails the cycle.
    Skipped(String),
}

/// A push provider: APNS or GCM.
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether this provider can reach the given registration.
    fn supports(&self, registration: &ClientRegistration) -> bool;
    /// Send one wake to each registration. Per-registration failures are
    /// reported in the outcomes; `Err` means the whole call failed
    /// transiently (network, provider 5xx).
    fn push(
        &self,
        registrations: &[ClientRegistration],
        wake: &WakePayload,
    ) -> Result<Vec<PushOutcome>, CoreError>;
}

/// Coalesces delivery backlog per client into rate-limited wake-ups and
/// routes each to the first capable provider.
pub struct PushDispatcher {
    gateway: Arc<dyn PersistenceGateway>,
    /// Ordered by preference: GCM before APNS.
    providers: Vec<Arc<dyn PushProvider>>,
    /// Clients with a wake task already scheduled.
    pending: Mutex<HashSet<String>>,
    coalesce_window: Duration,
    /// Bounds concurrent provider calls independently of the RPC pool.
    limiter: Arc<Semaphore>,
}

impl PushDispatcher {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        providers: Vec<Arc<dyn PushProvider>>,
        coalesce_window: Duration,
        worker_pool_size: usize,
    ) -> Self {
        Self {
            gateway,
            providers,
            pending: Mutex::new(HashSet::new()),
            coalesce_window,
            limiter: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }

    /// Request an out-of-band wake for a client.
    ///
    /// If a task is already scheduled for this client, nothing new is
    /// scheduled — the existing task reads the latest backlog when it
    /// fires. A superseded task is never cancelled; it simply becomes a
    /// no-op through the fingerprint check.
    pub fn request_wake(self: &Arc<Self>, client_id: &str) {
        {
            let mut pending = self.pending.lock();
            if !pending.insert(client_id.to_string()) {
                tracing::debug!(client = %client_id, "wake already scheduled — coalescing");
                return;
            }
        }

        let dispatcher = Arc::clone(self);
        let client = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.coalesce_window).await;
            // Clear the pending flag before running so a wake request
            // arriving mid-cycle schedules a fresh task.
            dispatcher.pending.lock().remove(&client);

            let Ok(permit) = Arc::clone(&dispatcher.limiter).acquire_owned().await else {
                return;
            };
            let worker = Arc::clone(&dispatcher);
            let join = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                worker.run_wake_cycle(&client);
            })
            .await;
            if let Err(e) = join {
                tracing::error!(error = %e, "wake worker panicked");
            }
        });
    }

    /// One wake cycle for one client. Runs on the worker pool; re-reads
    /// all state at fire time.
    fn run_wake_cycle(&self, client_id: &str) {
        match self.try_wake(client_id) {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    client = %client_id,
                    error = %e,
                    "wake cycle failed — will retry on next scheduled cycle"
                );
            }
        }
    }

    fn try_wake(&self, client_id: &str) -> Result<(), CoreError> {
        let undelivered = self.gateway.undelivered_count(client_id)?;
        if undelivered == 0 {
            tracing::debug!(client = %client_id, "no undelivered backlog — skipping wake");
            return Ok(());
        }

        let Some(registration) = self.gateway.find_registration(client_id)? else {
            tracing::info!(client = %client_id, "client not push-capable — no registration");
            return Ok(());
        };

        let fingerprint = format!("undelivered:{undelivered}");
        if registration.last_push_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            tracing::debug!(
                client = %client_id,
                fingerprint = %fingerprint,
                "backlog unchanged since last wake — skipping"
            );
            return Ok(());
        }

        let Some(provider) = self.providers.iter().find(|p| p.supports(&registration)) else {
            tracing::info!(client = %client_id, "client not push-capable — no matching provider");
            return Ok(());
        };

        let wake = WakePayload {
            message: fingerprint.clone(),
            undelivered,
        };
        let outcomes = provider.push(std::slice::from_ref(&registration), &wake)?;

        let mut sent = false;
        for outcome in outcomes {
            match outcome.status {
                PushStatus::Delivered => sent = true,
                PushStatus::Canonical(canonical_id) => {
                    tracing::info!(
                        client = %outcome.client_id,
                        "replacing stale registration id with canonical one"
                    );
                    self.gateway
                        .replace_gcm_registration(&outcome.client_id, &canonical_id)?;
                    sent = true;
                }
                PushStatus::Invalid => {
                    tracing::warn!(
                        client = %outcome.client_id,
                        provider = provider.name(),
                        "registration permanently invalid — clearing push channels"
                    );
                    self.gateway.clear_push_channels(&outcome.client_id)?;
                }
                PushStatus::Transient(reason) => {
                    tracing::warn!(
                        client = %outcome.client_id,
                        provider = provider.name(),
                        reason = %reason,
                        "transient push failure"
                    );
                }
                PushStatus::Skipped(reason) => {
                    tracing::debug!(
                        client = %outcome.client_id,
                        provider = provider.name(),
                        reason = %reason,
                        "push skipped"
                    );
                }
            }
        }

        if sent {
            self.gateway.record_wake_sent(client_id, &fingerprint)?;
            tracing::info!(
                client = %client_id,
                provider = provider.name(),
                undelivered,
                "wake sent"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::gateway::SqliteGateway;
    use cachet_model::{Delivery, DeliveryState, Message};

    struct RecordingProvider {
        calls: Mutex<Vec<(Vec<String>, String)>>,
        outcome: fn(&str) -> PushStatus,
    }

    impl RecordingProvider {
        fn delivered() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome: |_| PushStatus::Delivered,
            })
        }
    }

    impl PushProvider for RecordingProvider {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn supports(&self, registration: &ClientRegistration) -> bool {
            registration.is_push_capable()
        }
        fn push(
            &self,
            registrations: &[ClientRegistration],
            wake: &WakePayload,
        ) -> Result<Vec<PushOutcome>, CoreError> {
            let ids: Vec<String> = registrations.iter().map(|r| r.client_id.clone()).collect();
            self.calls.lock().push((ids, wake.message.clone()));
            Ok(registrations
                .iter()
                .map(|r| PushOutcome {
                    client_id: r.client_id.clone(),
                    status: (self.outcome)(&r.client_id),
                })
                .collect())
        }
    }

    fn setup(
        provider: Arc<RecordingProvider>,
    ) -> (Arc<PushDispatcher>, Arc<dyn PersistenceGateway>) {
        let gateway: Arc<dyn PersistenceGateway> =
            Arc::new(SqliteGateway::new(db::open_in_memory_db().unwrap()));
        let dispatcher = Arc::new(PushDispatcher::new(
            Arc::clone(&gateway),
            vec![provider],
            Duration::from_millis(20),
            2,
        ));
        (dispatcher, gateway)
    }

    fn seed_backlog(gateway: &Arc<dyn PersistenceGateway>, client: &str, count: usize) {
        for i in 0..count {
            let id = format!("m{i}");
            gateway
                .save_message(&Message {
                    id: id.clone(),
                    sender_id: "alice".into(),
                    salt: vec![],
                    body: vec![1],
                    attachment_ref: None,
                    shared_key_id: None,
                    hmac: vec![],
                    signature: vec![],
                    sent_at: 0,
                    delivery_count: 1,
                })
                .unwrap();
            gateway
                .save_delivery(&Delivery {
                    message_id: id,
                    sender_id: "alice".into(),
                    receiver_id: client.into(),
                    state: DeliveryState::Delivering,
                    key_id: None,
                    encrypted_key: None,
                    accepted_at: 0,
                    state_changed_at: 0,
                    client_notified_at: None,
                })
                .unwrap();
        }
        gateway
            .save_registration(&ClientRegistration {
                client_id: client.into(),
                gcm_package: Some("com.example.app".into()),
                gcm_registration_id: Some("reg".into()),
                ..Default::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn coalesces_wakes_within_window_and_sends_final_count() {
        let provider = RecordingProvider::delivered();
        let (dispatcher, gateway) = setup(Arc::clone(&provider));
        seed_backlog(&gateway, "bob", 1);

        dispatcher.request_wake("bob");
        // Second delivery lands inside the coalescing window.
        seed_backlog(&gateway, "bob", 2);
        dispatcher.request_wake("bob");

        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = provider.calls.lock();
        assert_eq!(calls.len(), 1, "coalesced into one provider call");
        assert_eq!(calls[0].1, "undelivered:2", "final count, not intermediate");
    }

    #[tokio::test]
    async fn unchanged_fingerprint_suppresses_redundant_push() {
        let provider = RecordingProvider::delivered();
        let (dispatcher, gateway) = setup(Arc::clone(&provider));
        seed_backlog(&gateway, "bob", 2);

        dispatcher.request_wake("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Backlog unchanged: the second cycle must be a no-op.
        dispatcher.request_wake("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(provider.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_backlog_means_no_provider_call() {
        let provider = RecordingProvider::delivered();
        let (dispatcher, gateway) = setup(Arc::clone(&provider));
        gateway
            .save_registration(&ClientRegistration {
                client_id: "bob".into(),
                gcm_registration_id: Some("reg".into()),
                ..Default::default()
            })
            .unwrap();

        dispatcher.request_wake("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unregistered_client_is_logged_noop() {
        let provider = RecordingProvider::delivered();
        let (dispatcher, gateway) = setup(Arc::clone(&provider));
        seed_backlog(&gateway, "bob", 1);
        // Strip the registration: backlog exists but no push channel.
        gateway.clear_push_channels("bob").unwrap();

        dispatcher.request_wake("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn invalid_registration_clears_channels() {
        let provider = Arc::new(RecordingProvider {
            calls: Mutex::new(Vec::new()),
            outcome: |_| PushStatus::Invalid,
        });
        let (dispatcher, gateway) = setup(Arc::clone(&provider));
        seed_backlog(&gateway, "bob", 1);

        dispatcher.request_wake("bob");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reg = gateway.find_registration("bob").unwrap().unwrap();
        assert!(reg.gcm_registration_id.is_none());
        assert!(reg.apns_token.is_none());
        // No fingerprint recorded: nothing was actually sent.
        assert!(reg.last_push_fingerprint.is_none());
    }
}
