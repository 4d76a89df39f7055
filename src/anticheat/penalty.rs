//! Per-check penalty policies and strike counting
//!
//! Every named check maps to a [`CheckPolicy`]. Evaluating a violation against the
//! policy and the connection's [`StrikeCounter`] yields a [`Verdict`]; the node then
//! carries out the verdict (ledger ban, disconnect, or dropping the message).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ban length used when a `ban` policy omits `banDuration`
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Named anticheat checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Check {
    /// Host-game request carried invalid game settings
    CheckSettings,
    /// Game traffic addressed an object the sender does not own
    CheckObjectOwnership,
    /// Host-only action from a non-host
    HostChecks,
    /// Datagram failed to decode or had an impossible shape
    MalformedPackets,
    /// Datagram larger than the abuse threshold
    MassivePackets,
}

impl Check {
    pub const ALL: [Check; 5] = [
        Check::CheckSettings,
        Check::CheckObjectOwnership,
        Check::HostChecks,
        Check::MalformedPackets,
        Check::MassivePackets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Check::CheckSettings => "checkSettings",
            Check::CheckObjectOwnership => "checkObjectOwnership",
            Check::HostChecks => "hostChecks",
            Check::MalformedPackets => "malformedPackets",
            Check::MassivePackets => "massivePackets",
        }
    }
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal action of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    Ban,
    Disconnect,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyRule {
    #[serde(default)]
    pub penalty: Option<Penalty>,
    /// Violations tolerated before the terminal action (unset: act immediately)
    #[serde(default)]
    pub strikes: Option<u32>,
    /// Ban length in seconds
    #[serde(default)]
    pub ban_duration: Option<u64>,
}

impl PenaltyRule {
    pub fn penalty(&self) -> Penalty {
        self.penalty.unwrap_or(Penalty::Disconnect)
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BAN_DURATION)
    }
}

/// Policy for one check: a plain toggle or a full rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckPolicy {
    Toggle(bool),
    Rule(PenaltyRule),
}

impl CheckPolicy {
    /// Effective rule, `None` when the check is disabled
    pub fn rule(&self) -> Option<PenaltyRule> {
        match self {
            CheckPolicy::Toggle(false) => None,
            CheckPolicy::Toggle(true) => Some(PenaltyRule::default()),
            CheckPolicy::Rule(rule) => Some(rule.clone()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CheckPolicy::Toggle(false))
    }
}

/// What the node must do about one violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Check disabled, keep processing
    Allow,
    /// Strike recorded below the threshold, keep processing
    Warn { strikes: u32, threshold: u32 },
    /// Drop the current message, nothing else
    Drop,
    /// Disconnect the connection
    Disconnect,
    /// Ban the remote IP for the duration, then disconnect
    Ban(Duration),
}

impl Verdict {
    /// Whether the caller must stop handling the current message
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Allow | Verdict::Warn { .. })
    }
}

/// Per-connection strike counters, one per check
#[derive(Debug, Default, Clone)]
pub struct StrikeCounter {
    counts: HashMap<Check, u32>,
}

impl StrikeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, check: Check) -> u32 {
        self.counts.get(&check).copied().unwrap_or(0)
    }

    /// Record a strike, returning the new count
    fn strike(&mut self, check: Check) -> u32 {
        let count = self.counts.entry(check).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&mut self, check: Check) {
        self.counts.remove(&check);
    }

    /// Evaluate one violation of `check` under `policy`
    pub fn evaluate(&mut self, check: Check, policy: &CheckPolicy) -> Verdict {
        let Some(rule) = policy.rule() else {
            return Verdict::Allow;
        };

        let terminal = match rule.penalty() {
            Penalty::Ignore => return Verdict::Drop,
            Penalty::Disconnect => Verdict::Disconnect,
            Penalty::Ban => Verdict::Ban(rule.ban_duration()),
        };

        let threshold = match rule.strikes {
            Some(threshold) if threshold > 0 => threshold,
            _ => return terminal,
        };

        let strikes = self.strike(check);
        if strikes < threshold {
            return Verdict::Warn { strikes, threshold };
        }

        self.reset(check);
        terminal
    }
}
