//! Usage quota as observed from the remote user-profile document.
//!
//! Read-only on the client: replaced wholesale on each remote update,
//! never locally mutated.

use serde::{Deserialize, Serialize};

use crate::config::Policy;

/// Subscription tier as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Premium,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

/// Processed-minutes counters for the current user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageQuota {
    #[serde(default)]
    pub plan: PlanTier,

    #[serde(default)]
    pub monthly_minutes_used: u32,

    #[serde(default)]
    pub lifetime_minutes_used: u32,
}

impl UsageQuota {
    /// Minutes still available under the plan's binding cap: lifetime for
    /// the free tier, monthly otherwise.
    pub fn remaining_minutes(&self, policy: &Policy) -> u32 {
        match self.plan {
            PlanTier::Free => policy
                .lifetime_cap_minutes
                .saturating_sub(self.lifetime_minutes_used),
            PlanTier::Premium => policy
                .monthly_cap_minutes
                .saturating_sub(self.monthly_minutes_used),
        }
    }

    pub fn is_exhausted(&self, policy: &Policy) -> bool {
        self.remaining_minutes(policy) == 0
    }
}
