//! Delivery server for the cachet end-to-end encrypted messenger.
//!
//! The server never sees plaintext: it stores opaque ciphertext, drives a
//! per-receiver delivery state machine, keeps the group key rotation
//! ledger, and wakes offline clients through APNS/GCM.

pub mod config;
pub mod connection_table;
pub mod coordinator;
pub mod db;
pub mod gateway;
pub mod group_ledger;
pub mod listener;
pub mod push;
pub mod rpc;
pub mod server_state;
