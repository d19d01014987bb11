//! `SQLite` storage for the swarm supervisor.
//!
//! Provides persistence for projects, swarm runs, and checkpoints.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::{NewCheckpoint, RunAnnotation};
