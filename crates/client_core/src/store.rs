use chrono::{DateTime, Utc};
use shared::{
    domain::{ComplianceStatus, ControlItem, ItemId, Priority},
    error::AssessmentError,
    protocol::{AssessmentMetrics, AssessmentSnapshot, Counts, DashboardSummary},
};

/// Mutable subset of a control item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemPatch {
    pub status: Option<ComplianceStatus>,
    pub notes: Option<String>,
    pub requirement: Option<String>,
    pub subtasks_done: Vec<(String, bool)>,
}

impl ItemPatch {
    pub fn status(status: ComplianceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::default()
        }
    }

    pub fn requirement(requirement: impl Into<String>) -> Self {
        Self {
            requirement: Some(requirement.into()),
            ..Self::default()
        }
    }

    pub fn subtask_done(subtask_id: impl Into<String>, done: bool) -> Self {
        Self {
            subtasks_done: vec![(subtask_id.into(), done)],
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// In-memory assessment of the active session. Only this type mutates the
/// item sequence; it never performs I/O.
#[derive(Debug, Clone, Default)]
pub struct AssessmentStore {
    items: Vec<ControlItem>,
    last_updated: Option<DateTime<Utc>>,
    revision: u64,
    persisted_revision: u64,
}

impl AssessmentStore {
    pub fn load(&mut self, items: Vec<ControlItem>, last_updated: Option<DateTime<Utc>>) {
        self.items = items;
        self.last_updated = last_updated;
        self.revision = 0;
        self.persisted_revision = 0;
    }

    pub fn items(&self) -> &[ControlItem] {
        &self.items
    }

    pub fn get(&self, id: &ItemId) -> Option<&ControlItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_dirty(&self) -> bool {
        self.persisted_revision < self.revision
    }

    /// Records that everything up to `revision` reached the remote store.
    pub fn mark_persisted(&mut self, revision: u64) {
        self.persisted_revision = self.persisted_revision.max(revision.min(self.revision));
    }

    pub fn snapshot(&self) -> AssessmentSnapshot {
        AssessmentSnapshot::from_items(&self.items, self.last_updated)
    }

    /// Applies `patch` in place. Unknown subtask ids reject the whole patch.
    pub fn update_item(
        &mut self,
        id: &ItemId,
        patch: &ItemPatch,
    ) -> Result<&ControlItem, AssessmentError> {
        let index = self.position(id)?;
        let item = &mut self.items[index];

        if let Some((missing, _)) = patch
            .subtasks_done
            .iter()
            .find(|(subtask_id, _)| item.subtask(subtask_id).is_none())
        {
            return Err(AssessmentError::SubtaskNotFound {
                item_id: id.clone(),
                subtask_id: missing.clone(),
            });
        }

        if let Some(status) = patch.status {
            item.status = status;
        }
        if let Some(notes) = &patch.notes {
            item.notes = notes.clone();
        }
        if let Some(requirement) = &patch.requirement {
            item.requirement = requirement.clone();
        }
        for (subtask_id, done) in &patch.subtasks_done {
            if let Some(subtask) = item.subtasks.iter_mut().find(|s| &s.id == subtask_id) {
                subtask.done = *done;
            }
        }

        self.touch();
        Ok(&self.items[index])
    }

    pub fn remove_item(&mut self, id: &ItemId) -> Result<ControlItem, AssessmentError> {
        let index = self.position(id)?;
        let removed = self.items.remove(index);
        self.touch();
        Ok(removed)
    }

    fn position(&self, id: &ItemId) -> Result<usize, AssessmentError> {
        self.items
            .iter()
            .position(|item| &item.id == id)
            .ok_or_else(|| AssessmentError::ItemNotFound {
                item_id: id.clone(),
            })
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.last_updated = Some(Utc::now());
    }
}

/// Share of `Compliant` items as a whole percentage, rounded half up.
pub fn progress(items: &[ControlItem]) -> u8 {
    let total = items.len();
    if total == 0 {
        return 0;
    }
    let compliant = items
        .iter()
        .filter(|item| item.status == ComplianceStatus::Compliant)
        .count();
    ((200 * compliant + total) / (2 * total)) as u8
}

/// Every status appears, zero counts included, in declaration order.
pub fn counts_by_status(items: &[ControlItem]) -> Counts<ComplianceStatus> {
    Counts(
        ComplianceStatus::ALL
            .iter()
            .map(|status| {
                let count = items.iter().filter(|item| item.status == *status).count();
                (*status, count)
            })
            .collect(),
    )
}

/// Every priority appears, zero counts included, lowest first.
pub fn counts_by_priority(items: &[ControlItem]) -> Counts<Priority> {
    Counts(
        Priority::ALL
            .iter()
            .map(|priority| {
                let count = items
                    .iter()
                    .filter(|item| item.priority == *priority)
                    .count();
                (*priority, count)
            })
            .collect(),
    )
}

/// Only categories that occur, in order of first appearance.
pub fn counts_by_category(items: &[ControlItem]) -> Counts<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for item in items {
        match counts
            .iter_mut()
            .find(|(category, _)| *category == item.category)
        {
            Some((_, count)) => *count += 1,
            None => counts.push((item.category.clone(), 1)),
        }
    }
    Counts(counts)
}

pub fn summary(items: &[ControlItem]) -> DashboardSummary {
    DashboardSummary {
        total: items.len(),
        critical: items
            .iter()
            .filter(|item| item.priority == Priority::Critical)
            .count(),
        started: items.iter().filter(|item| item.status.is_started()).count(),
        compliant: items
            .iter()
            .filter(|item| item.status == ComplianceStatus::Compliant)
            .count(),
        progress: progress(items),
    }
}

pub fn metrics(items: &[ControlItem]) -> AssessmentMetrics {
    AssessmentMetrics {
        summary: summary(items),
        by_status: counts_by_status(items),
        by_priority: counts_by_priority(items),
        by_category: counts_by_category(items),
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
