//! Consensus crate for tessera partition groups.
//!
//! This crate provides the leader-based replication engine used by
//! tessera_cluster. The API surface is intentionally small: higher layers
//! supply a `StateMachine`, a `LogStore` and a `Transport`, then drive
//! proposals through `Group`.

pub mod raft;
