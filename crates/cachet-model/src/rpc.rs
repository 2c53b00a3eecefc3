//! Wire types for the delivery RPC surface.
//!
//! Transport-agnostic: the production transport frames these however it
//! likes; the bundled listener speaks newline-delimited JSON.

use serde::{Deserialize, Serialize};

use crate::entities::{Connectivity, MemberRole, Message};

/// Request from a client to the delivery server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DeliveryRequest {
    /// Identify the connection. Must be the first request on a connection;
    /// registers it for direct delivery and resets unread bookkeeping.
    Hello { client_id: String },
    /// Submit a message for fan-out to the given receivers.
    ///
    /// For a group message `group_id` is set and `receiver_ids` may be
    /// empty — the server resolves the active membership itself.
    AcceptMessage {
        message: Message,
        group_id: Option<String>,
        receiver_ids: Vec<String>,
        /// Per-receiver encrypted copies of the message key.
        receiver_keys: Vec<ReceiverKey>,
    },
    /// Transport-level acknowledgement from the receiver.
    AcknowledgeDelivery {
        message_id: String,
        receiver_id: String,
    },
    /// Application-level confirmation (e.g. "displayed").
    ConfirmDelivery {
        message_id: String,
        receiver_id: String,
    },
    /// Publish a new group key epoch with per-member encrypted copies.
    RotateGroupKey {
        group_id: String,
        shared_key_id: String,
        supplier_id: String,
        member_keys: Vec<ReceiverKey>,
    },
    /// Admin: invite a client into a group.
    InviteMember {
        group_id: String,
        client_id: String,
        role: MemberRole,
    },
    /// Invited client joins the group.
    JoinGroup { group_id: String, client_id: String },
    /// Admin: suspend a member (reversible).
    SuspendMember { group_id: String, client_id: String },
    /// Admin: remove a member for good (key material is scrubbed).
    RemoveMember { group_id: String, client_id: String },
    /// Register or update push capability for a client.
    RegisterPush {
        client_id: String,
        gcm_package: Option<String>,
        gcm_registration_id: Option<String>,
        apns_token: Option<String>,
        apns_client_name: Option<String>,
        apns_production: bool,
    },
    /// Client-reported connectivity change.
    SetPresence {
        client_id: String,
        connectivity: Connectivity,
    },
    /// Server status.
    GetStatus,
    /// Shut down the server.
    Shutdown,
}

/// A per-receiver encrypted key copy accompanying a message or rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverKey {
    pub receiver_id: String,
    pub key_id: String,
    pub ciphertext: Vec<u8>,
}

/// Response from the delivery server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DeliveryResponse {
    /// Generic success.
    Ok,
    /// Message accepted; one entry per created (or pre-existing) delivery.
    Accepted { deliveries: Vec<DeliveryKeyDto> },
    /// A rotation marker is fresh for this group — back off and retry.
    RotationInProgress { group_id: String },
    /// Server status.
    Status {
        uptime_secs: u64,
        connected_clients: usize,
    },
    /// Error.
    Error { code: u32, message: String },
}

/// Identifies one delivery row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryKeyDto {
    pub message_id: String,
    pub receiver_id: String,
}

/// Event pushed to a live client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// Direct delivery of a newly accepted message.
    NewMessage {
        message: Message,
        key_id: Option<String>,
        encrypted_key: Option<Vec<u8>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_shape() {
        let req = DeliveryRequest::AcknowledgeDelivery {
            message_id: "m1".into(),
            receiver_id: "bob".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""method":"AcknowledgeDelivery""#));
        let back: DeliveryRequest = serde_json::from_str(&json).unwrap();
        match back {
            DeliveryRequest::AcknowledgeDelivery {
                message_id,
                receiver_id,
            } => {
                assert_eq!(message_id, "m1");
                assert_eq!(receiver_id, "bob");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rotation_in_progress_is_distinct_from_error() {
        let resp = DeliveryResponse::RotationInProgress {
            group_id: "g1".into(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"RotationInProgress""#));
        assert!(!json.contains("Error"));
    }
}
