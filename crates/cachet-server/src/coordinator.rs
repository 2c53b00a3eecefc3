//! Per-receiver delivery orchestration.
//!
//! Accepting a message creates one delivery row per receiver and drives
//! each through its state machine independently: direct delivery over a
//! live connection when one exists, otherwise a wake via the push
//! dispatcher. The persisted delivery row is authoritative; transport and
//! push are both best-effort on top of it.

use std::sync::Arc;

use cachet_model::rpc::{ClientEvent, DeliveryKeyDto, ReceiverKey};
use cachet_model::{transition, CoreError, Delivery, DeliveryState, Message, Transition};

use crate::connection_table::ConnectionTable;
use crate::gateway::PersistenceGateway;
use crate::group_ledger::GroupKeyLedger;
use crate::push::PushDispatcher;

pub struct DeliveryCoordinator {
    gateway: Arc<dyn PersistenceGateway>,
    connections: Arc<ConnectionTable>,
    ledger: Arc<GroupKeyLedger>,
    push: Arc<PushDispatcher>,
}

impl DeliveryCoordinator {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        connections: Arc<ConnectionTable>,
        ledger: Arc<GroupKeyLedger>,
        push: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            gateway,
            connections,
            ledger,
            push,
        }
    }

    /// Accept a message for fan-out.
    ///
    /// Group messages resolve their receiver set from the active
    /// membership and are rejected while a key rotation marker is fresh
    /// (the sender would be encrypting under a key epoch that is being
    /// replaced). Re-accepting a known message is idempotent: existing
    /// delivery rows are reported, not recreated.
    pub fn accept(
        &self,
        message: &Message,
        group_id: Option<&str>,
        receiver_ids: &[String],
        receiver_keys: &[ReceiverKey],
    ) -> Result<Vec<DeliveryKeyDto>, CoreError> {
        let receivers = match group_id {
            Some(group) => {
                if self.ledger.rotation_blocked(group)? {
                    tracing::info!(
                        message = %message.id,
                        group = %group,
                        "message rejected — key rotation in progress"
                    );
                    return Err(CoreError::RotationInProgress(group.to_string()));
                }
                self.ledger
                    .active_members(group)?
                    .into_iter()
                    .map(|m| m.client_id)
                    .filter(|id| *id != message.sender_id)
                    .collect::<Vec<_>>()
            }
            None => receiver_ids
                .iter()
                .filter(|id| **id != message.sender_id)
                .cloned()
                .collect(),
        };

        if self.gateway.find_message(&message.id)?.is_none() {
            let mut stored = message.clone();
            stored.delivery_count = u32::try_from(receivers.len()).unwrap_or(u32::MAX);
            self.gateway.save_message(&stored)?;
        }

        let now = timestamp_ms();
        let mut deliveries = Vec::with_capacity(receivers.len());
        for receiver_id in &receivers {
            if self.gateway.find_delivery(&message.id, receiver_id)?.is_none() {
                let key = receiver_keys.iter().find(|k| k.receiver_id == *receiver_id);
                let delivery = Delivery {
                    message_id: message.id.clone(),
                    sender_id: message.sender_id.clone(),
                    receiver_id: receiver_id.clone(),
                    state: DeliveryState::New,
                    key_id: key.map(|k| k.key_id.clone()),
                    encrypted_key: key.map(|k| k.ciphertext.clone()),
                    accepted_at: now,
                    state_changed_at: now,
                    client_notified_at: None,
                };
                self.gateway.save_delivery(&delivery)?;
                self.dispatch(&delivery, message, now)?;
            }
            deliveries.push(DeliveryKeyDto {
                message_id: message.id.clone(),
                receiver_id: receiver_id.clone(),
            });
        }

        tracing::info!(
            message = %message.id,
            sender = %message.sender_id,
            receivers = deliveries.len(),
            "message accepted"
        );
        Ok(deliveries)
    }

    /// Move one fresh delivery to `Delivering` and get it to the receiver:
    /// directly when a connection is live, via a wake request otherwise.
    fn dispatch(&self, delivery: &Delivery, message: &Message, now: i64) -> Result<(), CoreError> {
        self.gateway.advance_delivery(
            &delivery.message_id,
            &delivery.receiver_id,
            DeliveryState::New,
            DeliveryState::Delivering,
            now,
        )?;

        if let Some(connection) = self.connections.connection_for(&delivery.receiver_id) {
            let event = ClientEvent::NewMessage {
                message: message.clone(),
                key_id: delivery.key_id.clone(),
                encrypted_key: delivery.encrypted_key.clone(),
            };
            let frame = serde_json::to_string(&event)?;
            if connection.send(frame) {
                self.gateway
                    .mark_client_notified(&delivery.message_id, &delivery.receiver_id, now)?;
                tracing::debug!(
                    message = %delivery.message_id,
                    receiver = %delivery.receiver_id,
                    "delivered over live connection"
                );
                return Ok(());
            }
            // Connection died between lookup and send; fall through to push.
            tracing::debug!(
                receiver = %delivery.receiver_id,
                "connection gone mid-send — falling back to wake"
            );
        }

        self.push.request_wake(&delivery.receiver_id);
        Ok(())
    }

    /// A client came online: flush its backlog over the new connection.
    pub fn flush_backlog(&self, client_id: &str) -> Result<usize, CoreError> {
        let Some(connection) = self.connections.connection_for(client_id) else {
            return Ok(0);
        };
        let pending = self
            .gateway
            .deliveries_for_receiver(client_id, DeliveryState::Delivering)?;
        let now = timestamp_ms();
        let mut flushed = 0;
        for delivery in &pending {
            let Some(message) = self.gateway.find_message(&delivery.message_id)? else {
                continue;
            };
            let event = ClientEvent::NewMessage {
                message,
                key_id: delivery.key_id.clone(),
                encrypted_key: delivery.encrypted_key.clone(),
            };
            let frame = serde_json::to_string(&event)?;
            if !connection.send(frame) {
                break;
            }
            self.gateway
                .mark_client_notified(&delivery.message_id, client_id, now)?;
            flushed += 1;
        }
        if flushed > 0 {
            tracing::info!(client = %client_id, flushed, "backlog flushed on reconnect");
        }
        Ok(flushed)
    }

    /// Transport-level acknowledgement: `Delivering` → `Delivered`.
    pub fn on_acknowledged(&self, message_id: &str, receiver_id: &str) -> Result<(), CoreError> {
        self.advance(message_id, receiver_id, DeliveryState::Delivered)
    }

    /// Application-level confirmation: `Delivered` → `Confirmed`.
    pub fn on_confirmed(&self, message_id: &str, receiver_id: &str) -> Result<(), CoreError> {
        self.advance(message_id, receiver_id, DeliveryState::Confirmed)
    }

    /// Abort a non-terminal delivery (message revoked by its sender).
    pub fn abort(&self, message_id: &str, receiver_id: &str) -> Result<(), CoreError> {
        self.advance(message_id, receiver_id, DeliveryState::Aborted)
    }

    /// Validate the requested hop against the state machine, then apply it
    /// as a compare-and-set. Unknown deliveries and illegal hops are
    /// logged no-ops — retransmitted acknowledgements must be harmless.
    fn advance(
        &self,
        message_id: &str,
        receiver_id: &str,
        requested: DeliveryState,
    ) -> Result<(), CoreError> {
        let Some(delivery) = self.gateway.find_delivery(message_id, receiver_id)? else {
            tracing::info!(
                message = %message_id,
                receiver = %receiver_id,
                requested = requested.as_str(),
                "state change dropped — no such delivery"
            );
            return Ok(());
        };
        match transition(delivery.state, requested) {
            Transition::Advanced(next) => {
                let applied = self.gateway.advance_delivery(
                    message_id,
                    receiver_id,
                    delivery.state,
                    next,
                    timestamp_ms(),
                )?;
                if applied {
                    tracing::debug!(
                        message = %message_id,
                        receiver = %receiver_id,
                        state = next.as_str(),
                        "delivery advanced"
                    );
                } else {
                    // Raced with another instance; the row already moved on.
                    tracing::debug!(
                        message = %message_id,
                        receiver = %receiver_id,
                        "state change lost compare-and-set race"
                    );
                }
                Ok(())
            }
            Transition::Rejected => {
                tracing::info!(
                    message = %message_id,
                    receiver = %receiver_id,
                    current = delivery.state.as_str(),
                    requested = requested.as_str(),
                    "state change dropped — illegal transition"
                );
                Ok(())
            }
        }
    }
}

fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
