//! Anticheat: per-check penalty policies, ledger-backed bans and mod compatibility
//!
//! Violations are routed to a named [`penalty::Check`]; the configured policy decides
//! whether the violation is tolerated, counted as a strike, or escalated to a
//! disconnect or ban.

pub mod mods;
pub mod penalty;
pub mod sanctions;

pub use penalty::{Check, CheckPolicy, Penalty, PenaltyRule, StrikeCounter, Verdict};
