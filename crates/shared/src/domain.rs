use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id_newtype!(UserId);

/// Stable identifier of a control item.
///
/// Older snapshots stored numeric ids; those deserialize into their decimal
/// string so that `1` and `"1"` name the same item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawItemId")]
pub struct ItemId(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawItemId {
    Text(String),
    Number(i64),
}

impl From<RawItemId> for ItemId {
    fn from(value: RawItemId) -> Self {
        match value {
            RawItemId::Text(text) => Self(text),
            RawItemId::Number(number) => Self(number.to_string()),
        }
    }
}

impl ItemId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scopes asynchronous work to one login session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub Uuid);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} value '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Low" | "low" | "Nizak" => Ok(Priority::Low),
            "Medium" | "medium" | "Srednji" => Ok(Priority::Medium),
            "High" | "high" | "Visok" => Ok(Priority::High),
            "Critical" | "critical" | "Kritičan" => Ok(Priority::Critical),
            _ => Err(ParseEnumError {
                kind: "priority",
                value: value.to_string(),
            }),
        }
    }
}

/// Compliance status of a control item.
///
/// `NotStarted < PartiallyCompliant < Compliant` is the progress order.
/// `NonCompliant` sits outside it and the type has no `Ord`; use
/// [`ComplianceStatus::progress_rank`] where the order matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplianceStatus {
    NotStarted,
    PartiallyCompliant,
    Compliant,
    NonCompliant,
}

impl ComplianceStatus {
    pub const ALL: [ComplianceStatus; 4] = [
        ComplianceStatus::NotStarted,
        ComplianceStatus::PartiallyCompliant,
        ComplianceStatus::Compliant,
        ComplianceStatus::NonCompliant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceStatus::NotStarted => "NotStarted",
            ComplianceStatus::PartiallyCompliant => "PartiallyCompliant",
            ComplianceStatus::Compliant => "Compliant",
            ComplianceStatus::NonCompliant => "NonCompliant",
        }
    }

    pub fn progress_rank(self) -> Option<u8> {
        match self {
            ComplianceStatus::NotStarted => Some(0),
            ComplianceStatus::PartiallyCompliant => Some(1),
            ComplianceStatus::Compliant => Some(2),
            ComplianceStatus::NonCompliant => None,
        }
    }

    pub fn is_started(self) -> bool {
        self != ComplianceStatus::NotStarted
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "NotStarted" | "not_started" | "Nije započeto" => Ok(ComplianceStatus::NotStarted),
            "PartiallyCompliant" | "partially_compliant" | "Djelomično" => {
                Ok(ComplianceStatus::PartiallyCompliant)
            }
            "Compliant" | "compliant" | "Usklađeno" => Ok(ComplianceStatus::Compliant),
            "NonCompliant" | "non_compliant" | "Neusklađeno" => Ok(ComplianceStatus::NonCompliant),
            _ => Err(ParseEnumError {
                kind: "status",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierStatus {
    #[default]
    Demo,
    Pro,
}

impl fmt::Display for TierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierStatus::Demo => f.write_str("demo"),
            TierStatus::Pro => f.write_str("pro"),
        }
    }
}

/// Operations a tier may or may not be entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    View,
    Edit,
    Remove,
    Export,
    FullCatalog,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::View => "view",
            Operation::Edit => "edit",
            Operation::Remove => "remove",
            Operation::Export => "export",
            Operation::FullCatalog => "full_catalog",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlItem {
    pub id: ItemId,
    pub category: String,
    pub requirement: String,
    pub owner: String,
    pub priority: Priority,
    pub status: ComplianceStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl ControlItem {
    pub fn subtask(&self, subtask_id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|subtask| subtask.id == subtask_id)
    }
}
