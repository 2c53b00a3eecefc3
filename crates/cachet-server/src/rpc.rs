//! Request dispatch for the delivery RPC surface.
//!
//! Transport-independent: the listener hands every parsed request here
//! and frames whatever comes back. Connection registration itself lives
//! in the listener (it owns the handle); `Hello` here only resets the
//! client's wake bookkeeping and flushes its backlog.

use std::sync::Arc;

use tokio::sync::mpsc;

use cachet_model::rpc::{DeliveryRequest, DeliveryResponse};
use cachet_model::{ClientPresence, ClientRegistration, Connectivity, CoreError};

use crate::server_state::ServerState;

pub async fn handle_request(
    state: &Arc<ServerState>,
    request: DeliveryRequest,
    shutdown: &mpsc::Sender<()>,
) -> DeliveryResponse {
    match dispatch(state, request, shutdown).await {
        Ok(response) => response,
        Err(CoreError::RotationInProgress(group_id)) => {
            DeliveryResponse::RotationInProgress { group_id }
        }
        Err(e) => DeliveryResponse::Error {
            code: error_code(&e),
            message: e.to_string(),
        },
    }
}

async fn dispatch(
    state: &Arc<ServerState>,
    request: DeliveryRequest,
    shutdown: &mpsc::Sender<()>,
) -> Result<DeliveryResponse, CoreError> {
    match request {
        DeliveryRequest::Hello { client_id } => {
            let now = timestamp_ms();
            state.gateway.mark_client_ready(&client_id, now)?;
            state.gateway.save_presence(&ClientPresence {
                client_id: client_id.clone(),
                connectivity: Connectivity::Online,
                updated_at: now,
            })?;
            state.coordinator.flush_backlog(&client_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::AcceptMessage {
            message,
            group_id,
            receiver_ids,
            receiver_keys,
        } => {
            let deliveries = state.coordinator.accept(
                &message,
                group_id.as_deref(),
                &receiver_ids,
                &receiver_keys,
            )?;
            Ok(DeliveryResponse::Accepted { deliveries })
        }
        DeliveryRequest::AcknowledgeDelivery {
            message_id,
            receiver_id,
        } => {
            state.coordinator.on_acknowledged(&message_id, &receiver_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::ConfirmDelivery {
            message_id,
            receiver_id,
        } => {
            state.coordinator.on_confirmed(&message_id, &receiver_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::RotateGroupKey {
            group_id,
            shared_key_id,
            supplier_id,
            member_keys,
        } => {
            state
                .ledger
                .rotate(&group_id, &shared_key_id, &supplier_id, &member_keys)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::InviteMember {
            group_id,
            client_id,
            role,
        } => {
            state.ledger.invite(&group_id, &client_id, role)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::JoinGroup {
            group_id,
            client_id,
        } => {
            state.ledger.join(&group_id, &client_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::SuspendMember {
            group_id,
            client_id,
        } => {
            state.ledger.suspend(&group_id, &client_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::RemoveMember {
            group_id,
            client_id,
        } => {
            state.ledger.remove(&group_id, &client_id)?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::RegisterPush {
            client_id,
            gcm_package,
            gcm_registration_id,
            apns_token,
            apns_client_name,
            apns_production,
        } => {
            if gcm_registration_id.is_none() && apns_token.is_none() {
                return Err(CoreError::RegistrationInvalid(
                    "registration carries no push channel".to_string(),
                ));
            }
            // Merge onto the existing row so re-registering one channel
            // keeps the other's bookkeeping intact.
            let mut registration = state
                .gateway
                .find_registration(&client_id)?
                .unwrap_or_else(|| ClientRegistration {
                    client_id: client_id.clone(),
                    ..Default::default()
                });
            if gcm_registration_id.is_some() {
                registration.gcm_package = gcm_package;
                registration.gcm_registration_id = gcm_registration_id;
            }
            if apns_token.is_some() {
                registration.apns_token = apns_token;
                registration.apns_client_name = apns_client_name;
                registration.apns_production = apns_production;
            }
            state.gateway.save_registration(&registration)?;
            tracing::info!(client = %client_id, "push registration updated");
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::SetPresence {
            client_id,
            connectivity,
        } => {
            state.gateway.save_presence(&ClientPresence {
                client_id,
                connectivity,
                updated_at: timestamp_ms(),
            })?;
            Ok(DeliveryResponse::Ok)
        }
        DeliveryRequest::GetStatus => Ok(DeliveryResponse::Status {
            uptime_secs: state.uptime_secs(),
            connected_clients: state.connections.len(),
        }),
        DeliveryRequest::Shutdown => {
            tracing::info!("shutdown requested over rpc");
            let _ = shutdown.send(()).await;
            Ok(DeliveryResponse::Ok)
        }
    }
}

fn error_code(error: &CoreError) -> u32 {
    match error {
        CoreError::UnknownGroup(_) => 404,
        CoreError::IncompleteKeySet(_)
        | CoreError::RegistrationInvalid(_)
        | CoreError::Serialization(_) => 400,
        _ => 500,
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
