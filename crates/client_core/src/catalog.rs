//! Default NIS2 gap-analysis checklist used when a user has no stored
//! assessment yet.

use shared::domain::{ComplianceStatus, ControlItem, ItemId, Priority, Subtask};

pub const CATALOG_SIZE: usize = 18;

struct Seed {
    id: &'static str,
    category: &'static str,
    requirement: &'static str,
    owner: &'static str,
    priority: Priority,
    subtasks: &'static [(&'static str, &'static str)],
}

const SEEDS: [Seed; CATALOG_SIZE] = [
    Seed {
        id: "1",
        category: "Governance",
        requirement: "Approval of security policies by management",
        owner: "Management",
        priority: Priority::High,
        subtasks: &[("1a", "Signed information security policy")],
    },
    Seed {
        id: "2",
        category: "Risk analysis",
        requirement: "Risk analysis policies",
        owner: "Risk Officer",
        priority: Priority::High,
        subtasks: &[("2a", "Asset registers")],
    },
    Seed {
        id: "3",
        category: "Incident handling",
        requirement: "Incident detection and prevention",
        owner: "SOC",
        priority: Priority::High,
        subtasks: &[("3a", "SIEM implemented")],
    },
    Seed {
        id: "4",
        category: "Incident handling",
        requirement: "Incident handling and reporting",
        owner: "SOC",
        priority: Priority::High,
        subtasks: &[("4a", "Incident response plan defined")],
    },
    Seed {
        id: "5",
        category: "Business continuity",
        requirement: "Backup management",
        owner: "IT Ops",
        priority: Priority::Medium,
        subtasks: &[("5a", "Immutable backups")],
    },
    Seed {
        id: "6",
        category: "Business continuity",
        requirement: "Disaster recovery",
        owner: "IT Ops",
        priority: Priority::Medium,
        subtasks: &[("6a", "Disaster recovery plan tested")],
    },
    Seed {
        id: "7",
        category: "Supply chain",
        requirement: "Supplier security",
        owner: "Procurement",
        priority: Priority::High,
        subtasks: &[],
    },
    Seed {
        id: "8",
        category: "Supply chain",
        requirement: "Security clauses in supplier contracts",
        owner: "Legal",
        priority: Priority::High,
        subtasks: &[],
    },
    Seed {
        id: "9",
        category: "Secure development",
        requirement: "Security by design",
        owner: "Development",
        priority: Priority::Medium,
        subtasks: &[],
    },
    Seed {
        id: "10",
        category: "Vulnerability handling",
        requirement: "Patch management",
        owner: "Security",
        priority: Priority::High,
        subtasks: &[],
    },
    Seed {
        id: "11",
        category: "Effectiveness measurement",
        requirement: "Audits and penetration tests",
        owner: "Internal Audit",
        priority: Priority::Medium,
        subtasks: &[],
    },
    Seed {
        id: "12",
        category: "Cyber hygiene",
        requirement: "System hardening",
        owner: "IT Support",
        priority: Priority::Low,
        subtasks: &[],
    },
    Seed {
        id: "13",
        category: "Training",
        requirement: "Security awareness training",
        owner: "HR",
        priority: Priority::Low,
        subtasks: &[],
    },
    Seed {
        id: "14",
        category: "Cryptography",
        requirement: "Encryption",
        owner: "Security",
        priority: Priority::Medium,
        subtasks: &[],
    },
    Seed {
        id: "15",
        category: "Human resources",
        requirement: "Onboarding and offboarding",
        owner: "HR",
        priority: Priority::Low,
        subtasks: &[],
    },
    Seed {
        id: "16",
        category: "Access control",
        requirement: "Need-to-know access",
        owner: "Identity",
        priority: Priority::High,
        subtasks: &[],
    },
    Seed {
        id: "17",
        category: "Authentication",
        requirement: "Multi-factor authentication",
        owner: "Identity",
        priority: Priority::High,
        subtasks: &[],
    },
    Seed {
        id: "18",
        category: "Communication",
        requirement: "Secure communication channels",
        owner: "IT Ops",
        priority: Priority::Medium,
        subtasks: &[],
    },
];

pub struct ControlCatalog;

impl ControlCatalog {
    /// The full canonical item sequence, every item `NotStarted`.
    pub fn items() -> Vec<ControlItem> {
        SEEDS
            .iter()
            .map(|seed| ControlItem {
                id: ItemId::new(seed.id),
                category: seed.category.to_string(),
                requirement: seed.requirement.to_string(),
                owner: seed.owner.to_string(),
                priority: seed.priority,
                status: ComplianceStatus::NotStarted,
                notes: String::new(),
                subtasks: seed
                    .subtasks
                    .iter()
                    .map(|(id, text)| Subtask {
                        id: (*id).to_string(),
                        text: (*text).to_string(),
                        done: false,
                    })
                    .collect(),
            })
            .collect()
    }
}
