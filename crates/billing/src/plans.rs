//! Static subscription plan catalog

use clipmeter_shared::SubscriptionTier;
use serde::Serialize;

/// Credits granted to every new account (the free tier allotment)
pub const FREE_STARTING_CREDITS: i64 = 10;

/// Monthly allotment and entitlements of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionPlan {
    pub tier: SubscriptionTier,
    /// Credits minted at each successful renewal. Zero for unlimited tiers.
    pub monthly_credits: i64,
    pub watermark_required: bool,
    pub unlimited: bool,
}

impl SubscriptionPlan {
    pub fn free() -> Self {
        Self {
            tier: SubscriptionTier::Free,
            monthly_credits: FREE_STARTING_CREDITS,
            watermark_required: true,
            unlimited: false,
        }
    }

    pub fn basic() -> Self {
        Self {
            tier: SubscriptionTier::Basic,
            monthly_credits: 100,
            watermark_required: false,
            unlimited: false,
        }
    }

    pub fn premium() -> Self {
        Self {
            tier: SubscriptionTier::Premium,
            monthly_credits: 0,
            watermark_required: false,
            unlimited: true,
        }
    }

    pub fn enterprise() -> Self {
        Self {
            tier: SubscriptionTier::Enterprise,
            monthly_credits: 0,
            watermark_required: false,
            unlimited: true,
        }
    }

    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free => Self::free(),
            SubscriptionTier::Basic => Self::basic(),
            SubscriptionTier::Premium => Self::premium(),
            SubscriptionTier::Enterprise => Self::enterprise(),
        }
    }

    /// Full catalog ordered from lowest to highest tier
    pub fn catalog() -> Vec<SubscriptionPlan> {
        SubscriptionTier::ALL
            .iter()
            .map(|tier| Self::for_tier(*tier))
            .collect()
    }
}
