//! Fleet Gateway Library
//!
//! Load balancer and worker nodes for a UDP game-server fleet, sharing a ledger
//! for bans, connection counts and redirect proofs.
//!
//! # Features
//!
//! - `metrics_server` - Prometheus/JSON stats over HTTP on `METRICS_PORT` (enabled by default)

pub mod anticheat;
pub mod cluster;
pub mod config;
pub mod ledger;
pub mod lobby;
pub mod metrics;
pub mod net;
