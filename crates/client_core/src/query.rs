use std::{fmt, str::FromStr};

use shared::domain::{ComplianceStatus, ControlItem, ParseEnumError, TierStatus};

use crate::tier::TierPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Only(ComplianceStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: ComplianceStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(expected) => *expected == status,
        }
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusFilter::All => f.write_str("all"),
            StatusFilter::Only(status) => fmt::Display::fmt(status, f),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        value.parse().map(StatusFilter::Only)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub search_term: String,
    pub status: StatusFilter,
}

impl ItemQuery {
    pub fn new(search_term: impl Into<String>, status: StatusFilter) -> Self {
        Self {
            search_term: search_term.into(),
            status,
        }
    }

    pub fn search(search_term: impl Into<String>) -> Self {
        Self::new(search_term, StatusFilter::All)
    }

    pub fn status(status: ComplianceStatus) -> Self {
        Self::new(String::new(), StatusFilter::Only(status))
    }

    pub fn matches(&self, item: &ControlItem) -> bool {
        if !self.status.matches(item.status) {
            return false;
        }
        let needle = self.search_term.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        [&item.requirement, &item.category, &item.owner]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Items matching `query`, in input order.
pub fn filter<'a>(items: &'a [ControlItem], query: &ItemQuery) -> Vec<&'a ControlItem> {
    items.iter().filter(|item| query.matches(item)).collect()
}

/// Read-only projection over the items a tier may see.
#[derive(Debug, Clone, Copy)]
pub struct QueryView<'a> {
    visible: &'a [ControlItem],
}

impl<'a> QueryView<'a> {
    pub fn gated(policy: &TierPolicy, items: &'a [ControlItem], tier: TierStatus) -> Self {
        Self {
            visible: policy.visible_items(items, tier),
        }
    }

    pub fn items(&self) -> &'a [ControlItem] {
        self.visible
    }

    pub fn query(&self, query: &ItemQuery) -> Vec<&'a ControlItem> {
        filter(self.visible, query)
    }
}
