//! Repository interface for all persistent entities.
//!
//! Every component reads and writes through [`PersistenceGateway`]; the
//! concrete store is swappable. All state-machine mutations are row-scoped
//! compare-and-set operations here — coordinator instances hold no locks
//! and scale horizontally.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use cachet_model::{
    ClientPresence, ClientRegistration, Connectivity, CoreError, Delivery, DeliveryState,
    GroupMembership, GroupPresence, MemberRole, MembershipState, Message,
};

/// A (client id, encrypted group key ciphertext) pair applied during rotation.
pub type RotationEntry = (String, Vec<u8>);

pub trait PersistenceGateway: Send + Sync {
    // ── messages ──
    fn find_message(&self, id: &str) -> Result<Option<Message>, CoreError>;
    fn save_message(&self, message: &Message) -> Result<(), CoreError>;

    // ── deliveries ──
    fn find_delivery(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> Result<Option<Delivery>, CoreError>;
    fn save_delivery(&self, delivery: &Delivery) -> Result<(), CoreError>;
    fn deliveries_for_receiver(
        &self,
        receiver_id: &str,
        state: DeliveryState,
    ) -> Result<Vec<Delivery>, CoreError>;
    /// Sender-side view of a message's fan-out, e.g. for the external
    /// retention sweep and sender-facing status queries.
    fn deliveries_for_sender(
        &self,
        sender_id: &str,
        state: DeliveryState,
    ) -> Result<Vec<Delivery>, CoreError>;
    /// Deliveries still awaiting transport acknowledgement for one client.
    fn undelivered_count(&self, receiver_id: &str) -> Result<u32, CoreError>;
    /// Atomic compare-and-set on one delivery row. Returns whether the row
    /// was in `expected` state and has been advanced to `next`.
    fn advance_delivery(
        &self,
        message_id: &str,
        receiver_id: &str,
        expected: DeliveryState,
        next: DeliveryState,
        now_ms: i64,
    ) -> Result<bool, CoreError>;
    fn mark_client_notified(
        &self,
        message_id: &str,
        receiver_id: &str,
        now_ms: i64,
    ) -> Result<(), CoreError>;

    // ── client registrations ──
    fn find_registration(&self, client_id: &str) -> Result<Option<ClientRegistration>, CoreError>;
    fn save_registration(&self, registration: &ClientRegistration) -> Result<(), CoreError>;
    /// Replace a stale GCM registration id with the canonical one GCM
    /// reported. All later pushes use the canonical id exclusively.
    fn replace_gcm_registration(&self, client_id: &str, canonical_id: &str)
        -> Result<(), CoreError>;
    /// Clear all push channels after a permanent registration failure so
    /// future cycles skip the dead channel.
    fn clear_push_channels(&self, client_id: &str) -> Result<(), CoreError>;
    /// Reset unread/fingerprint bookkeeping when the client connects.
    fn mark_client_ready(&self, client_id: &str, now_ms: i64) -> Result<(), CoreError>;
    /// Record that a wake was sent: persist the fingerprint and count it
    /// toward the unread badge.
    fn record_wake_sent(&self, client_id: &str, fingerprint: &str) -> Result<(), CoreError>;

    // ── group memberships & presence ──
    fn find_membership(
        &self,
        group_id: &str,
        client_id: &str,
    ) -> Result<Option<GroupMembership>, CoreError>;
    fn save_membership(&self, membership: &GroupMembership) -> Result<(), CoreError>;
    fn memberships_for_group(&self, group_id: &str) -> Result<Vec<GroupMembership>, CoreError>;
    fn find_group_presence(&self, group_id: &str) -> Result<Option<GroupPresence>, CoreError>;
    fn save_group_presence(&self, presence: &GroupPresence) -> Result<(), CoreError>;
    /// Set the advisory rotation marker if it is unset or stale.
    /// Returns whether this caller acquired it.
    fn try_acquire_rotation_marker(
        &self,
        group_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<bool, CoreError>;
    fn clear_rotation_marker(&self, group_id: &str) -> Result<(), CoreError>;
    /// Whether a rotation marker is currently set and fresh.
    fn rotation_marker_fresh(
        &self,
        group_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<bool, CoreError>;
    /// Update every listed membership's key fields and the group's own
    /// ledger row in one transaction.
    fn apply_key_rotation(
        &self,
        group_id: &str,
        shared_key_id: &str,
        supplier_id: &str,
        key_date: i64,
        entries: &[RotationEntry],
    ) -> Result<(), CoreError>;

    // ── client presence ──
    fn find_presence(&self, client_id: &str) -> Result<Option<ClientPresence>, CoreError>;
    fn save_presence(&self, presence: &ClientPresence) -> Result<(), CoreError>;
}

/// `SQLite`-backed gateway.
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGateway {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| {
            tracing::error!(error = %e, "server db mutex poisoned — recovering");
            e.into_inner()
        })
    }
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::Persistence(e.to_string())
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    let state: String = row.get(3)?;
    Ok(Delivery {
        message_id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        state: DeliveryState::parse(&state).unwrap_or(DeliveryState::Failed),
        key_id: row.get(4)?,
        encrypted_key: row.get(5)?,
        accepted_at: row.get(6)?,
        state_changed_at: row.get(7)?,
        client_notified_at: row.get(8)?,
    })
}

const DELIVERY_COLS: &str = "message_id, sender_id, receiver_id, state, key_id, encrypted_key, \
                             accepted_at, state_changed_at, client_notified_at";

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMembership> {
    let role: String = row.get(2)?;
    let state: String = row.get(3)?;
    Ok(GroupMembership {
        group_id: row.get(0)?,
        client_id: row.get(1)?,
        role: MemberRole::parse(&role).unwrap_or(MemberRole::Member),
        state: MembershipState::parse(&state).unwrap_or(MembershipState::NotInvolved),
        encrypted_group_key: row.get(4)?,
        shared_key_id: row.get(5)?,
        key_supplier: row.get(6)?,
        key_date: row.get(7)?,
    })
}

const MEMBERSHIP_COLS: &str = "group_id, client_id, role, state, encrypted_group_key, \
                               shared_key_id, key_supplier, key_date";

impl PersistenceGateway for SqliteGateway {
    fn find_message(&self, id: &str) -> Result<Option<Message>, CoreError> {
        let db = self.lock();
        db.query_row(
            "SELECT id, sender_id, salt, body, attachment_ref, shared_key_id, hmac, signature, \
             sent_at, delivery_count FROM messages WHERE id = ?1",
            params![id],
            |row| {
                Ok(Message {
                    id: row.get(0)?,
                    sender_id: row.get(1)?,
                    salt: row.get(2)?,
                    body: row.get(3)?,
                    attachment_ref: row.get(4)?,
                    shared_key_id: row.get(5)?,
                    hmac: row.get(6)?,
                    signature: row.get(7)?,
                    sent_at: row.get(8)?,
                    delivery_count: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_message(&self, message: &Message) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO messages \
             (id, sender_id, salt, body, attachment_ref, shared_key_id, hmac, signature, sent_at, delivery_count) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                message.id,
                message.sender_id,
                message.salt,
                message.body,
                message.attachment_ref,
                message.shared_key_id,
                message.hmac,
                message.signature,
                message.sent_at,
                message.delivery_count,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_delivery(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> Result<Option<Delivery>, CoreError> {
        let db = self.lock();
        db.query_row(
            &format!(
                "SELECT {DELIVERY_COLS} FROM deliveries WHERE message_id = ?1 AND receiver_id = ?2"
            ),
            params![message_id, receiver_id],
            row_to_delivery,
        )
        .optional()
        .map_err(db_err)
    }

    fn save_delivery(&self, delivery: &Delivery) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO deliveries \
             (message_id, sender_id, receiver_id, state, key_id, encrypted_key, \
              accepted_at, state_changed_at, client_notified_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                delivery.message_id,
                delivery.sender_id,
                delivery.receiver_id,
                delivery.state.as_str(),
                delivery.key_id,
                delivery.encrypted_key,
                delivery.accepted_at,
                delivery.state_changed_at,
                delivery.client_notified_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn deliveries_for_receiver(
        &self,
        receiver_id: &str,
        state: DeliveryState,
    ) -> Result<Vec<Delivery>, CoreError> {
        let db = self.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {DELIVERY_COLS} FROM deliveries \
                 WHERE receiver_id = ?1 AND state = ?2 ORDER BY accepted_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![receiver_id, state.as_str()], row_to_delivery)
            .map_err(db_err)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn deliveries_for_sender(
        &self,
        sender_id: &str,
        state: DeliveryState,
    ) -> Result<Vec<Delivery>, CoreError> {
        let db = self.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {DELIVERY_COLS} FROM deliveries \
                 WHERE sender_id = ?1 AND state = ?2 ORDER BY accepted_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![sender_id, state.as_str()], row_to_delivery)
            .map_err(db_err)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn undelivered_count(&self, receiver_id: &str) -> Result<u32, CoreError> {
        let db = self.lock();
        db.query_row(
            "SELECT COUNT(*) FROM deliveries WHERE receiver_id = ?1 AND state = 'delivering'",
            params![receiver_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn advance_delivery(
        &self,
        message_id: &str,
        receiver_id: &str,
        expected: DeliveryState,
        next: DeliveryState,
        now_ms: i64,
    ) -> Result<bool, CoreError> {
        let db = self.lock();
        let changed = db
            .execute(
                "UPDATE deliveries SET state = ?1, state_changed_at = ?2 \
                 WHERE message_id = ?3 AND receiver_id = ?4 AND state = ?5",
                params![
                    next.as_str(),
                    now_ms,
                    message_id,
                    receiver_id,
                    expected.as_str()
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn mark_client_notified(
        &self,
        message_id: &str,
        receiver_id: &str,
        now_ms: i64,
    ) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE deliveries SET client_notified_at = ?1 \
             WHERE message_id = ?2 AND receiver_id = ?3",
            params![now_ms, message_id, receiver_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_registration(&self, client_id: &str) -> Result<Option<ClientRegistration>, CoreError> {
        let db = self.lock();
        db.query_row(
            "SELECT client_id, gcm_package, gcm_registration_id, apns_token, apns_client_name, \
             apns_production, unread_count, last_push_fingerprint, last_login_at, last_ready_at \
             FROM client_registrations WHERE client_id = ?1",
            params![client_id],
            |row| {
                Ok(ClientRegistration {
                    client_id: row.get(0)?,
                    gcm_package: row.get(1)?,
                    gcm_registration_id: row.get(2)?,
                    apns_token: row.get(3)?,
                    apns_client_name: row.get(4)?,
                    apns_production: row.get(5)?,
                    unread_count: row.get(6)?,
                    last_push_fingerprint: row.get(7)?,
                    last_login_at: row.get(8)?,
                    last_ready_at: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_registration(&self, registration: &ClientRegistration) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO client_registrations \
             (client_id, gcm_package, gcm_registration_id, apns_token, apns_client_name, \
              apns_production, unread_count, last_push_fingerprint, last_login_at, last_ready_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                registration.client_id,
                registration.gcm_package,
                registration.gcm_registration_id,
                registration.apns_token,
                registration.apns_client_name,
                registration.apns_production,
                registration.unread_count,
                registration.last_push_fingerprint,
                registration.last_login_at,
                registration.last_ready_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn replace_gcm_registration(
        &self,
        client_id: &str,
        canonical_id: &str,
    ) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE client_registrations SET gcm_registration_id = ?1 WHERE client_id = ?2",
            params![canonical_id, client_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn clear_push_channels(&self, client_id: &str) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE client_registrations SET gcm_package = NULL, gcm_registration_id = NULL, \
             apns_token = NULL, apns_client_name = NULL WHERE client_id = ?1",
            params![client_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn mark_client_ready(&self, client_id: &str, now_ms: i64) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE client_registrations SET unread_count = 0, last_push_fingerprint = NULL, \
             last_ready_at = ?1, last_login_at = ?1 WHERE client_id = ?2",
            params![now_ms, client_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn record_wake_sent(&self, client_id: &str, fingerprint: &str) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE client_registrations SET last_push_fingerprint = ?1, \
             unread_count = unread_count + 1 WHERE client_id = ?2",
            params![fingerprint, client_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_membership(
        &self,
        group_id: &str,
        client_id: &str,
    ) -> Result<Option<GroupMembership>, CoreError> {
        let db = self.lock();
        db.query_row(
            &format!(
                "SELECT {MEMBERSHIP_COLS} FROM group_memberships \
                 WHERE group_id = ?1 AND client_id = ?2"
            ),
            params![group_id, client_id],
            row_to_membership,
        )
        .optional()
        .map_err(db_err)
    }

    fn save_membership(&self, membership: &GroupMembership) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO group_memberships \
             (group_id, client_id, role, state, encrypted_group_key, shared_key_id, key_supplier, key_date) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                membership.group_id,
                membership.client_id,
                membership.role.as_str(),
                membership.state.as_str(),
                membership.encrypted_group_key,
                membership.shared_key_id,
                membership.key_supplier,
                membership.key_date,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn memberships_for_group(&self, group_id: &str) -> Result<Vec<GroupMembership>, CoreError> {
        let db = self.lock();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMBERSHIP_COLS} FROM group_memberships WHERE group_id = ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![group_id], row_to_membership)
            .map_err(db_err)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn find_group_presence(&self, group_id: &str) -> Result<Option<GroupPresence>, CoreError> {
        let db = self.lock();
        db.query_row(
            "SELECT group_id, shared_key_id, key_supplier, key_date, rotation_started_at \
             FROM group_presence WHERE group_id = ?1",
            params![group_id],
            |row| {
                Ok(GroupPresence {
                    group_id: row.get(0)?,
                    shared_key_id: row.get(1)?,
                    key_supplier: row.get(2)?,
                    key_date: row.get(3)?,
                    rotation_started_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_group_presence(&self, presence: &GroupPresence) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO group_presence \
             (group_id, shared_key_id, key_supplier, key_date, rotation_started_at) \
             VALUES (?1,?2,?3,?4,?5)",
            params![
                presence.group_id,
                presence.shared_key_id,
                presence.key_supplier,
                presence.key_date,
                presence.rotation_started_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn try_acquire_rotation_marker(
        &self,
        group_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<bool, CoreError> {
        let db = self.lock();
        // Upsert with a conditional update: only steal the marker when it
        // is unset or stale.
        let changed = db
            .execute(
                "INSERT INTO group_presence (group_id, rotation_started_at) VALUES (?1, ?2) \
                 ON CONFLICT(group_id) DO UPDATE SET rotation_started_at = ?2 \
                 WHERE group_presence.rotation_started_at IS NULL \
                    OR group_presence.rotation_started_at <= ?2 - ?3",
                params![group_id, now_ms, stale_after_ms],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn clear_rotation_marker(&self, group_id: &str) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "UPDATE group_presence SET rotation_started_at = NULL WHERE group_id = ?1",
            params![group_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn rotation_marker_fresh(
        &self,
        group_id: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> Result<bool, CoreError> {
        let db = self.lock();
        let started: Option<Option<i64>> = db
            .query_row(
                "SELECT rotation_started_at FROM group_presence WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(matches!(started, Some(Some(t)) if t > now_ms - stale_after_ms))
    }

    fn apply_key_rotation(
        &self,
        group_id: &str,
        shared_key_id: &str,
        supplier_id: &str,
        key_date: i64,
        entries: &[RotationEntry],
    ) -> Result<(), CoreError> {
        let mut guard = self.lock();
        let tx = guard.transaction().map_err(db_err)?;
        for (client_id, ciphertext) in entries {
            tx.execute(
                "UPDATE group_memberships SET encrypted_group_key = ?1, shared_key_id = ?2, \
                 key_supplier = ?3, key_date = ?4 WHERE group_id = ?5 AND client_id = ?6",
                params![
                    ciphertext,
                    shared_key_id,
                    supplier_id,
                    key_date,
                    group_id,
                    client_id
                ],
            )
            .map_err(db_err)?;
        }
        tx.execute(
            "INSERT INTO group_presence (group_id, shared_key_id, key_supplier, key_date) \
             VALUES (?1,?2,?3,?4) \
             ON CONFLICT(group_id) DO UPDATE SET shared_key_id = ?2, key_supplier = ?3, key_date = ?4",
            params![group_id, shared_key_id, supplier_id, key_date],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn find_presence(&self, client_id: &str) -> Result<Option<ClientPresence>, CoreError> {
        let db = self.lock();
        db.query_row(
            "SELECT client_id, connectivity, updated_at FROM client_presence WHERE client_id = ?1",
            params![client_id],
            |row| {
                let connectivity: String = row.get(1)?;
                Ok(ClientPresence {
                    client_id: row.get(0)?,
                    connectivity: Connectivity::parse(&connectivity)
                        .unwrap_or(Connectivity::Offline),
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_presence(&self, presence: &ClientPresence) -> Result<(), CoreError> {
        let db = self.lock();
        db.execute(
            "INSERT OR REPLACE INTO client_presence (client_id, connectivity, updated_at) \
             VALUES (?1,?2,?3)",
            params![
                presence.client_id,
                presence.connectivity.as_str(),
                presence.updated_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
