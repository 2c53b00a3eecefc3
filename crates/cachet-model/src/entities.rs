use serde::{Deserialize, Serialize};

/// Per-receiver delivery progress.
///
/// Terminal states (`Confirmed`, `Failed`, `Aborted`) have no successors;
/// rows in a terminal state are only ever removed by the external
/// retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Row created, routing not yet decided.
    New,
    /// Handed to the receiver's connection or awaiting wake-up push.
    Delivering,
    /// Receiver's transport-level acknowledgement arrived.
    Delivered,
    /// Receiver's application-level confirmation (e.g. "displayed").
    Confirmed,
    /// Retry/backoff exhausted by the external sweep.
    Failed,
    /// Sender revocation, receiver block, or group removal.
    Aborted,
}

impl DeliveryState {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Aborted)
    }

    /// Stable column value for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse a persisted column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "delivering" => Some(Self::Delivering),
            "delivered" => Some(Self::Delivered),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Membership lifecycle within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipState {
    /// No relationship with the group.
    NotInvolved,
    /// Invited by an admin, not yet joined.
    Invited,
    /// Active member.
    Joined,
    /// Temporarily excluded; may rejoin.
    Suspended,
    /// Removed for good; key fields are scrubbed.
    Removed,
}

impl MembershipState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInvolved => "not_involved",
            Self::Invited => "invited",
            Self::Joined => "joined",
            Self::Suspended => "suspended",
            Self::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_involved" => Some(Self::NotInvolved),
            "invited" => Some(Self::Invited),
            "joined" => Some(Self::Joined),
            "suspended" => Some(Self::Suspended),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Role of a member within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Admin,
    Member,
    NearbyMember,
    WorldwideMember,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
            Self::NearbyMember => "nearby_member",
            Self::WorldwideMember => "worldwide_member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            "nearby_member" => Some(Self::NearbyMember),
            "worldwide_member" => Some(Self::WorldwideMember),
            _ => None,
        }
    }
}

/// Client connectivity as reported by the client itself.
///
/// Advisory only — routing consults it, correctness never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Offline,
    Background,
    Online,
    Typing,
}

impl Connectivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Background => "background",
            Self::Online => "online",
            Self::Typing => "typing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offline" => Some(Self::Offline),
            "background" => Some(Self::Background),
            "online" => Some(Self::Online),
            "typing" => Some(Self::Typing),
            _ => None,
        }
    }
}

/// Immutable message envelope, persisted once at accept time.
///
/// All cryptographic fields (body, hmac, signature, key ciphertexts) are
/// opaque bytes — the server never inspects plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier chosen by the sender.
    pub id: String,
    /// Sender's client identifier.
    pub sender_id: String,
    /// Per-message salt.
    pub salt: Vec<u8>,
    /// Encrypted message body.
    pub body: Vec<u8>,
    /// Encrypted attachment reference, if any.
    pub attachment_ref: Option<Vec<u8>>,
    /// Shared group key epoch the body was encrypted under, if a group message.
    pub shared_key_id: Option<String>,
    /// HMAC over the encrypted body.
    pub hmac: Vec<u8>,
    /// Sender signature.
    pub signature: Vec<u8>,
    /// Send timestamp (unix ms).
    pub sent_at: i64,
    /// Number of deliveries fanned out for this message.
    pub delivery_count: u32,
}

/// One delivery row per (message, receiver) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub state: DeliveryState,
    /// Identifier of the key the receiver's copy was wrapped with.
    pub key_id: Option<String>,
    /// The receiver's personal encrypted copy of the per-message key.
    pub encrypted_key: Option<Vec<u8>>,
    /// When the delivery row was created (unix ms).
    pub accepted_at: i64,
    /// When the state last changed (unix ms).
    pub state_changed_at: i64,
    /// When the client was last notified about this delivery (unix ms).
    pub client_notified_at: Option<i64>,
}

/// Push capability info for one client.
///
/// When both channels are configured, GCM is authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    /// GCM restricted package name.
    pub gcm_package: Option<String>,
    /// GCM registration id; replaced when a canonical id comes back.
    pub gcm_registration_id: Option<String>,
    /// APNS device token (hex).
    pub apns_token: Option<String>,
    /// Logical app name selecting the APNS certificate bundle.
    pub apns_client_name: Option<String>,
    /// Production vs sandbox build variant, as reported by the client.
    pub apns_production: bool,
    /// Wakes sent since the client last connected.
    pub unread_count: u32,
    /// Fingerprint of the last wake actually sent (dedup).
    pub last_push_fingerprint: Option<String>,
    pub last_login_at: Option<i64>,
    pub last_ready_at: Option<i64>,
}

impl ClientRegistration {
    /// Whether any push channel is configured at all.
    pub fn is_push_capable(&self) -> bool {
        self.gcm_registration_id.is_some() || self.apns_token.is_some()
    }
}

/// One row per (group, client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    pub group_id: String,
    pub client_id: String,
    pub role: MemberRole,
    pub state: MembershipState,
    /// This member's encrypted copy of the group key.
    pub encrypted_group_key: Option<Vec<u8>>,
    /// Key epoch the encrypted copy belongs to.
    pub shared_key_id: Option<String>,
    /// Admin who supplied the current key copy.
    pub key_supplier: Option<String>,
    /// When the current key copy was issued (unix ms).
    pub key_date: Option<i64>,
}

impl GroupMembership {
    /// Whether this member takes part in fan-out and key rotation.
    ///
    /// Nearby/worldwide members are presence-driven in the clients; the
    /// server counts them as active only once joined.
    pub fn is_active(&self) -> bool {
        match self.state {
            MembershipState::Joined => true,
            MembershipState::Invited => {
                matches!(self.role, MemberRole::Admin | MemberRole::Member)
            }
            _ => false,
        }
    }

    /// Scrub key material once the member is no longer involved.
    pub fn trash_keys(&mut self) {
        self.encrypted_group_key = None;
        self.shared_key_id = None;
        self.key_supplier = None;
        self.key_date = None;
    }
}

/// Per-group key ledger row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPresence {
    pub group_id: String,
    /// Current shared key epoch.
    pub shared_key_id: Option<String>,
    /// Admin who published the current epoch.
    pub key_supplier: Option<String>,
    /// When the current epoch was published (unix ms).
    pub key_date: Option<i64>,
    /// Advisory mutual-exclusion marker for concurrent rotations (unix ms).
    pub rotation_started_at: Option<i64>,
}

/// Connectivity snapshot for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresence {
    pub client_id: String,
    pub connectivity: Connectivity,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_roundtrip() {
        for s in [
            DeliveryState::New,
            DeliveryState::Delivering,
            DeliveryState::Delivered,
            DeliveryState::Confirmed,
            DeliveryState::Failed,
            DeliveryState::Aborted,
        ] {
            assert_eq!(DeliveryState::parse(s.as_str()), Some(s));
        }
        assert_eq!(DeliveryState::parse("bogus"), None);
    }

    #[test]
    fn nearby_member_active_only_when_joined() {
        let mut m = GroupMembership {
            group_id: "g".into(),
            client_id: "c".into(),
            role: MemberRole::NearbyMember,
            state: MembershipState::Invited,
            encrypted_group_key: None,
            shared_key_id: None,
            key_supplier: None,
            key_date: None,
        };
        assert!(!m.is_active());
        m.state = MembershipState::Joined;
        assert!(m.is_active());
        m.role = MemberRole::Member;
        m.state = MembershipState::Invited;
        assert!(m.is_active());
    }

    #[test]
    fn trash_keys_scrubs_everything() {
        let mut m = GroupMembership {
            group_id: "g".into(),
            client_id: "c".into(),
            role: MemberRole::Member,
            state: MembershipState::Removed,
            encrypted_group_key: Some(vec![1, 2, 3]),
            shared_key_id: Some("k1".into()),
            key_supplier: Some("admin".into()),
            key_date: Some(123),
        };
        m.trash_keys();
        assert!(m.encrypted_group_key.is_none());
        assert!(m.shared_key_id.is_none());
        assert!(m.key_supplier.is_none());
        assert!(m.key_date.is_none());
    }
}
