//! Gradebook aggregation and read-aloud timing for a classroom learning
//! platform whose data lives behind a hosted Postgres backend.

pub mod db;
pub mod error;
pub mod gateway;
pub mod gradebook;
pub mod models;
pub mod notify;
pub mod read_aloud;
pub mod report;
pub mod sources;
