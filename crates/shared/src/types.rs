//! Domain enums shared between the billing engine, API and worker

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or user supplied string is not a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Subscription tier of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Basic,
        SubscriptionTier::Premium,
        SubscriptionTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    /// Ordering used to tell upgrades from downgrades
    pub fn rank(&self) -> u8 {
        match self {
            SubscriptionTier::Free => 0,
            SubscriptionTier::Basic => 1,
            SubscriptionTier::Premium => 2,
            SubscriptionTier::Enterprise => 3,
        }
    }

    /// Unlimited tiers are never blocked on balance
    pub fn is_unlimited(&self) -> bool {
        matches!(self, SubscriptionTier::Premium | SubscriptionTier::Enterprise)
    }

    /// Whether the tier is sold through the payment provider
    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "basic" => Ok(SubscriptionTier::Basic),
            "premium" => Ok(SubscriptionTier::Premium),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            _ => Err(ParseEnumError::new("subscription tier", s)),
        }
    }
}

/// Provider-side state of an account's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Map a provider subscription status string onto the local status set.
    ///
    /// Trialing counts as active; incomplete and unpaid states are treated as
    /// past due since no payment has cleared.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" | "trialing" => SubscriptionStatus::Active,
            "past_due" | "unpaid" | "incomplete" | "paused" => SubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

/// Kind of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Usage,
    Refund,
    Purchase,
    Bonus,
    Renewal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Usage => "usage",
            TransactionKind::Refund => "refund",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Bonus => "bonus",
            TransactionKind::Renewal => "renewal",
        }
    }

    /// Kinds that may be minted through a plain credit operation
    pub fn is_grant(&self) -> bool {
        matches!(
            self,
            TransactionKind::Purchase | TransactionKind::Bonus | TransactionKind::Renewal
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usage" => Ok(TransactionKind::Usage),
            "refund" => Ok(TransactionKind::Refund),
            "purchase" => Ok(TransactionKind::Purchase),
            "bonus" => Ok(TransactionKind::Bonus),
            "renewal" => Ok(TransactionKind::Renewal),
            _ => Err(ParseEnumError::new("transaction kind", s)),
        }
    }
}

/// Billing period requested at checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse_is_case_insensitive() {
        assert_eq!(
            "Premium".parse::<SubscriptionTier>(),
            Ok(SubscriptionTier::Premium)
        );
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_tier_rank_orders_upgrades() {
        assert!(SubscriptionTier::Basic.rank() > SubscriptionTier::Free.rank());
        assert!(SubscriptionTier::Enterprise.rank() > SubscriptionTier::Premium.rank());
    }

    #[test]
    fn test_unlimited_tiers() {
        assert!(!SubscriptionTier::Free.is_unlimited());
        assert!(!SubscriptionTier::Basic.is_unlimited());
        assert!(SubscriptionTier::Premium.is_unlimited());
        assert!(SubscriptionTier::Enterprise.is_unlimited());
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_provider("trialing"),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_provider("unpaid"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_provider("canceled"),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!(SubscriptionStatus::PastDue.to_string(), "past_due");
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::PastDue)
        );
    }

    #[test]
    fn test_only_grants_are_grant_kinds() {
        assert!(TransactionKind::Renewal.is_grant());
        assert!(!TransactionKind::Usage.is_grant());
        assert!(!TransactionKind::Refund.is_grant());
    }
}
