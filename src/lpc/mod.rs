//! The Local Postgres Controller (`spec.md` §4.2).

mod controller;
pub mod pg_control;

pub use controller::LocalPostgresController;
