//! Bookkeeping for encrypted-group-key distribution and rotation.
//!
//! Rotation takes an advisory, staleness-bounded marker rather than a true
//! distributed lock: the ledger has no single-writer guarantee across
//! coordinator instances, so the marker only arbitrates the common case of
//! two admins racing to publish conflicting key epochs.

use std::sync::Arc;

use cachet_model::rpc::ReceiverKey;
use cachet_model::{
    membership_transition, CoreError, GroupMembership, MemberRole, MembershipState, Transition,
};

use crate::gateway::{PersistenceGateway, RotationEntry};

pub struct GroupKeyLedger {
    gateway: Arc<dyn PersistenceGateway>,
    stale_after_ms: i64,
}

impl GroupKeyLedger {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, stale_after_ms: i64) -> Self {
        Self {
            gateway,
            stale_after_ms,
        }
    }

    /// Whether a fresh rotation marker currently blocks fan-out for this group.
    pub fn rotation_blocked(&self, group_id: &str) -> Result<bool, CoreError> {
        self.gateway
            .rotation_marker_fresh(group_id, timestamp_ms(), self.stale_after_ms)
    }

    /// Memberships taking part in fan-out and key rotation.
    pub fn active_members(&self, group_id: &str) -> Result<Vec<GroupMembership>, CoreError> {
        Ok(self
            .gateway
            .memberships_for_group(group_id)?
            .into_iter()
            .filter(GroupMembership::is_active)
            .collect())
    }

    /// Publish a new key epoch for a group.
    ///
    /// Fails with `RotationInProgress` while another rotation's marker is
    /// fresh, and with `IncompleteKeySet` when a ciphertext is missing for
    /// any active member — a partial epoch would strand members on an old
    /// key. The marker is cleared on every exit path.
    pub fn rotate(
        &self,
        group_id: &str,
        shared_key_id: &str,
        supplier_id: &str,
        member_keys: &[ReceiverKey],
    ) -> Result<(), CoreError> {
        let now = timestamp_ms();
        if !self
            .gateway
            .try_acquire_rotation_marker(group_id, now, self.stale_after_ms)?
        {
            tracing::info!(group = %group_id, "rotation marker held — rejecting rotation");
            return Err(CoreError::RotationInProgress(group_id.to_string()));
        }

        let result = self.apply_rotation(group_id, shared_key_id, supplier_id, now, member_keys);
        if let Err(e) = self.gateway.clear_rotation_marker(group_id) {
            tracing::error!(group = %group_id, error = %e, "failed to clear rotation marker");
        }
        result
    }

    fn apply_rotation(
        &self,
        group_id: &str,
        shared_key_id: &str,
        supplier_id: &str,
        now: i64,
        member_keys: &[ReceiverKey],
    ) -> Result<(), CoreError> {
        let active = self.active_members(group_id)?;
        if active.is_empty() {
            return Err(CoreError::UnknownGroup(group_id.to_string()));
        }

        let mut entries: Vec<RotationEntry> = Vec::with_capacity(active.len());
        for member in &active {
            let Some(key) = member_keys.iter().find(|k| k.receiver_id == member.client_id)
            else {
                tracing::warn!(
                    group = %group_id,
                    member = %member.client_id,
                    "rotation is missing a key for an active member"
                );
                return Err(CoreError::IncompleteKeySet(group_id.to_string()));
            };
            entries.push((member.client_id.clone(), key.ciphertext.clone()));
        }

        self.gateway
            .apply_key_rotation(group_id, shared_key_id, supplier_id, now, &entries)?;

        tracing::info!(
            group = %group_id,
            epoch = %shared_key_id,
            supplier = %supplier_id,
            members = entries.len(),
            "group key rotated"
        );
        Ok(())
    }

    // ── membership lifecycle ──

    /// Invite a client into a group. Re-inviting an involved member is a
    /// logged no-op.
    pub fn invite(
        &self,
        group_id: &str,
        client_id: &str,
        role: MemberRole,
    ) -> Result<(), CoreError> {
        let current = self.gateway.find_membership(group_id, client_id)?;
        let current_state = current
            .as_ref()
            .map_or(MembershipState::NotInvolved, |m| m.state);
        match membership_transition(current_state, MembershipState::Invited) {
            Transition::Advanced(state) => {
                let membership = GroupMembership {
                    group_id: group_id.to_string(),
                    client_id: client_id.to_string(),
                    role,
                    state,
                    encrypted_group_key: None,
                    shared_key_id: None,
                    key_supplier: None,
                    key_date: None,
                };
                self.gateway.save_membership(&membership)?;
                tracing::info!(group = %group_id, client = %client_id, role = role.as_str(), "member invited");
                Ok(())
            }
            Transition::Rejected => {
                tracing::info!(
                    group = %group_id,
                    client = %client_id,
                    state = current_state.as_str(),
                    "invite dropped — illegal membership transition"
                );
                Ok(())
            }
        }
    }

    /// An invited client joins.
    pub fn join(&self, group_id: &str, client_id: &str) -> Result<(), CoreError> {
        self.advance_membership(group_id, client_id, MembershipState::Joined)
    }

    /// Temporarily exclude a member; reversible via `join`.
    pub fn suspend(&self, group_id: &str, client_id: &str) -> Result<(), CoreError> {
        self.advance_membership(group_id, client_id, MembershipState::Suspended)
    }

    /// Remove a member for good and scrub their key material.
    pub fn remove(&self, group_id: &str, client_id: &str) -> Result<(), CoreError> {
        self.advance_membership(group_id, client_id, MembershipState::Removed)
    }

    fn advance_membership(
        &self,
        group_id: &str,
        client_id: &str,
        requested: MembershipState,
    ) -> Result<(), CoreError> {
        let Some(mut membership) = self.gateway.find_membership(group_id, client_id)? else {
            tracing::info!(
                group = %group_id,
                client = %client_id,
                requested = requested.as_str(),
                "membership change dropped — no such membership"
            );
            return Ok(());
        };
        match membership_transition(membership.state, requested) {
            Transition::Advanced(state) => {
                membership.state = state;
                if state == MembershipState::Removed {
                    membership.trash_keys();
                }
                self.gateway.save_membership(&membership)?;
                tracing::info!(
                    group = %group_id,
                    client = %client_id,
                    state = state.as_str(),
                    "membership advanced"
                );
                Ok(())
            }
            Transition::Rejected => {
                tracing::info!(
                    group = %group_id,
                    client = %client_id,
                    current = membership.state.as_str(),
                    requested = requested.as_str(),
                    "membership change dropped — illegal transition"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::gateway::SqliteGateway;

    fn ledger() -> (GroupKeyLedger, Arc<dyn PersistenceGateway>) {
        let gw: Arc<dyn PersistenceGateway> =
            Arc::new(SqliteGateway::new(db::open_in_memory_db().unwrap()));
        (GroupKeyLedger::new(Arc::clone(&gw), 5_000), gw)
    }

    fn key(receiver: &str) -> ReceiverKey {
        ReceiverKey {
            receiver_id: receiver.into(),
            key_id: "epoch-2".into(),
            ciphertext: vec![1, 2, 3],
        }
    }

    #[test]
    fn rotate_updates_every_active_membership() {
        let (ledger, gw) = ledger();
        for client in ["a", "b", "c"] {
            ledger.invite("g1", client, MemberRole::Member).unwrap();
            ledger.join("g1", client).unwrap();
        }

        ledger
            .rotate("g1", "epoch-2", "admin", &[key("a"), key("b"), key("c")])
            .unwrap();

        for client in ["a", "b", "c"] {
            let m = gw.find_membership("g1", client).unwrap().unwrap();
            assert_eq!(m.shared_key_id.as_deref(), Some("epoch-2"));
            assert_eq!(m.key_supplier.as_deref(), Some("admin"));
        }
        // Marker released for the next rotation.
        assert!(!ledger.rotation_blocked("g1").unwrap());
    }

    #[test]
    fn concurrent_rotation_is_rejected_until_marker_clears() {
        let (ledger, gw) = ledger();
        ledger.invite("g1", "a", MemberRole::Member).unwrap();
        ledger.join("g1", "a").unwrap();

        // A previous rotation's marker is still fresh.
        assert!(gw
            .try_acquire_rotation_marker("g1", timestamp_ms(), 5_000)
            .unwrap());
        let err = ledger
            .rotate("g1", "epoch-2", "admin", &[key("a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::RotationInProgress(_)));

        gw.clear_rotation_marker("g1").unwrap();
        ledger.rotate("g1", "epoch-2", "admin", &[key("a")]).unwrap();
    }

    #[test]
    fn incomplete_key_set_fails_and_releases_marker() {
        let (ledger, gw) = ledger();
        for client in ["a", "b"] {
            ledger.invite("g1", client, MemberRole::Member).unwrap();
            ledger.join("g1", client).unwrap();
        }

        let err = ledger
            .rotate("g1", "epoch-2", "admin", &[key("a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::IncompleteKeySet(_)));

        // Nothing was applied and the marker is free again.
        let m = gw.find_membership("g1", "a").unwrap().unwrap();
        assert_ne!(m.shared_key_id.as_deref(), Some("epoch-2"));
        assert!(!ledger.rotation_blocked("g1").unwrap());
    }

    #[test]
    fn removed_member_is_scrubbed_and_excluded_from_rotation() {
        let (ledger, gw) = ledger();
        for client in ["a", "b"] {
            ledger.invite("g1", client, MemberRole::Member).unwrap();
            ledger.join("g1", client).unwrap();
        }
        ledger
            .rotate("g1", "epoch-1", "admin", &[key("a"), key("b")])
            .unwrap();

        ledger.remove("g1", "b").unwrap();
        let m = gw.find_membership("g1", "b").unwrap().unwrap();
        assert_eq!(m.state, MembershipState::Removed);
        assert!(m.encrypted_group_key.is_none());
        assert!(m.shared_key_id.is_none());

        // The next epoch only needs the remaining member.
        ledger.rotate("g1", "epoch-2", "admin", &[key("a")]).unwrap();
        assert_eq!(ledger.active_members("g1").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_invite_is_a_noop() {
        let (ledger, gw) = ledger();
        ledger.invite("g1", "a", MemberRole::Admin).unwrap();
        ledger.join("g1", "a").unwrap();
        // Replayed invite must not demote the joined member.
        ledger.invite("g1", "a", MemberRole::Member).unwrap();
        let m = gw.find_membership("g1", "a").unwrap().unwrap();
        assert_eq!(m.state, MembershipState::Joined);
        assert_eq!(m.role, MemberRole::Admin);
    }
}
