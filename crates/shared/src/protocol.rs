use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{ser::Serializer, Deserialize, Deserializer, Serialize};

use crate::{
    domain::{ComplianceStatus, ControlItem, ItemId, Priority, Subtask, TierStatus, UserId},
    error::AssessmentError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

/// Persisted form of a control item.
///
/// Status and priority stay raw strings here so a bad value reaches the
/// engine as an integrity violation instead of an opaque decode failure.
/// Missing or non-string labels decode to their JSON text and fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlItemRecord {
    pub id: ItemId,
    pub category: String,
    pub requirement: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, deserialize_with = "raw_label")]
    pub priority: String,
    #[serde(default, deserialize_with = "raw_label")]
    pub status: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub subtasks: Vec<SubtaskRecord>,
}

fn raw_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(label) => label,
        other => other.to_string(),
    })
}

impl From<&ControlItem> for ControlItemRecord {
    fn from(item: &ControlItem) -> Self {
        Self {
            id: item.id.clone(),
            category: item.category.clone(),
            requirement: item.requirement.clone(),
            owner: item.owner.clone(),
            priority: item.priority.as_str().to_string(),
            status: item.status.as_str().to_string(),
            notes: item.notes.clone(),
            subtasks: item
                .subtasks
                .iter()
                .map(|subtask| SubtaskRecord {
                    id: subtask.id.clone(),
                    text: subtask.text.clone(),
                    done: subtask.done,
                })
                .collect(),
        }
    }
}

impl TryFrom<ControlItemRecord> for ControlItem {
    type Error = AssessmentError;

    fn try_from(record: ControlItemRecord) -> Result<Self, Self::Error> {
        let priority: Priority =
            record
                .priority
                .parse()
                .map_err(|err: crate::domain::ParseEnumError| AssessmentError::Integrity {
                    item_id: record.id.clone(),
                    detail: err.to_string(),
                })?;
        let status: ComplianceStatus =
            record
                .status
                .parse()
                .map_err(|err: crate::domain::ParseEnumError| AssessmentError::Integrity {
                    item_id: record.id.clone(),
                    detail: err.to_string(),
                })?;

        let mut subtask_ids = HashSet::new();
        let mut subtasks = Vec::with_capacity(record.subtasks.len());
        for subtask in record.subtasks {
            if !subtask_ids.insert(subtask.id.clone()) {
                return Err(AssessmentError::Integrity {
                    item_id: record.id,
                    detail: format!("duplicate subtask id '{}'", subtask.id),
                });
            }
            subtasks.push(Subtask {
                id: subtask.id,
                text: subtask.text,
                done: subtask.done,
            });
        }

        Ok(ControlItem {
            id: record.id,
            category: record.category,
            requirement: record.requirement,
            owner: record.owner,
            priority,
            status,
            notes: record.notes,
            subtasks,
        })
    }
}

/// The full serialized item sequence of one user at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentSnapshot {
    pub items: Vec<ControlItemRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl AssessmentSnapshot {
    pub fn from_items(items: &[ControlItem], last_updated: Option<DateTime<Utc>>) -> Self {
        Self {
            items: items.iter().map(ControlItemRecord::from).collect(),
            last_updated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Validates every record and returns the typed items in stored order.
    pub fn into_items(self) -> Result<Vec<ControlItem>, AssessmentError> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(self.items.len());
        for record in self.items {
            if !seen.insert(record.id.clone()) {
                return Err(AssessmentError::Integrity {
                    item_id: record.id,
                    detail: "duplicate item id".into(),
                });
            }
            items.push(ControlItem::try_from(record)?);
        }
        Ok(items)
    }
}

/// Ordered tally of items per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counts<K>(pub Vec<(K, usize)>);

impl<K: PartialEq> Counts<K> {
    pub fn get(&self, key: &K) -> usize {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.iter().map(|(_, count)| count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(K, usize)> {
        self.0.iter()
    }
}

impl<K: Serialize> Serialize for Counts<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(key, count)| (key, count)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DashboardSummary {
    pub total: usize,
    pub critical: usize,
    pub started: usize,
    pub compliant: usize,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssessmentMetrics {
    pub summary: DashboardSummary,
    pub by_status: Counts<ComplianceStatus>,
    pub by_priority: Counts<Priority>,
    pub by_category: Counts<String>,
}

/// Input handed to the export collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentReport {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub tier: TierStatus,
    pub items: Vec<ControlItem>,
    pub metrics: AssessmentMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub location: String,
    pub item_count: usize,
}
