use shared::{
    domain::{ControlItem, ItemId, Operation, TierStatus},
    error::AssessmentError,
};

pub const DEMO_ITEM_LIMIT: usize = 6;

/// Decides what a subscription tier may see and do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    demo_item_limit: usize,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            demo_item_limit: DEMO_ITEM_LIMIT,
        }
    }
}

impl TierPolicy {
    pub fn new(demo_item_limit: usize) -> Self {
        Self { demo_item_limit }
    }

    pub fn demo_item_limit(&self) -> usize {
        self.demo_item_limit
    }

    pub fn visible_len(&self, total: usize, tier: TierStatus) -> usize {
        match tier {
            TierStatus::Pro => total,
            TierStatus::Demo => total.min(self.demo_item_limit),
        }
    }

    /// Prefix of `items` the tier is entitled to, in canonical order.
    pub fn visible_items<'a>(&self, items: &'a [ControlItem], tier: TierStatus) -> &'a [ControlItem] {
        &items[..self.visible_len(items.len(), tier)]
    }

    pub fn can_mutate(&self, tier: TierStatus, operation: Operation) -> bool {
        match operation {
            Operation::View | Operation::Edit | Operation::Remove => true,
            Operation::Export | Operation::FullCatalog => tier == TierStatus::Pro,
        }
    }

    pub fn ensure(&self, tier: TierStatus, operation: Operation) -> Result<(), AssessmentError> {
        if self.can_mutate(tier, operation) {
            Ok(())
        } else {
            Err(AssessmentError::TierDenied { operation, tier })
        }
    }

    pub fn is_reachable(&self, items: &[ControlItem], tier: TierStatus, id: &ItemId) -> bool {
        self.visible_items(items, tier)
            .iter()
            .any(|item| &item.id == id)
    }
}
