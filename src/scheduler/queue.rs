//! Named priority queues.
//!
//! Consumption order: system > priority_high > priority_low.
//! Rows that name no queue, or an unknown one, land on priority_low.

use std::str::FromStr;

/// Queue a dispatched task is routed to (lower rank = consumed first).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    System = 0,
    PriorityHigh = 1,
    #[default]
    PriorityLow = 2,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::System,
        QueueName::PriorityHigh,
        QueueName::PriorityLow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::System => "system",
            QueueName::PriorityHigh => "priority_high",
            QueueName::PriorityLow => "priority_low",
        }
    }

    /// Resolve the optional `queue` key of a task's extra config.
    /// Unknown names fall back to the default with a warning.
    pub fn resolve(task_name: &str, requested: Option<&str>) -> Self {
        match requested {
            None => Self::default(),
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(task=%task_name, queue=%raw, "Unknown queue, using priority_low");
                Self::default()
            }),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(QueueName::System),
            "priority_high" => Ok(QueueName::PriorityHigh),
            "priority_low" => Ok(QueueName::PriorityLow),
            other => Err(format!("unknown queue '{other}'")),
        }
    }
}
