//! Node roles of the fleet
//!
//! The load balancer admits clients and redirects them; workers host rooms.
//! They coordinate only through the shared ledger.

pub mod balancer;
pub mod handoff;
pub mod worker;

pub use balancer::BalancerRole;
pub use worker::WorkerRole;
