//! `pg-keeper`: the per-node agent of a primary/standby PostgreSQL cluster
//! managed by an external monitor (`spec.md` §1).
//!
//! This crate implements the keeper runtime: a [`supervisor`] that launches
//! and restarts the Local Postgres Controller ([`lpc`]) and the node-active
//! loop ([`node_active`]); an [`fsm`] engine that converges local Postgres on
//! whatever role the monitor assigns; on-disk [`state`] (keeper state, PID
//! file, expected-status file) that makes all of the above crash-safe; and a
//! [`partition`] detector that lets a primary self-demote rather than risk a
//! split brain. [`config`] and [`error`] provide the ambient configuration
//! and error-handling stack; [`hba`] keeps `pg_hba.conf` in sync with the
//! formation.

pub mod config;
pub mod error;
pub mod fsm;
pub mod hba;
pub mod lpc;
pub mod node_active;
pub mod observability;
pub mod partition;
pub mod role;
pub mod state;
pub mod supervisor;

pub(crate) mod cleanup_helpers;
pub(crate) mod fs;
