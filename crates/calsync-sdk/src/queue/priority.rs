use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::UpdateAction;

/// Sync queue priority
///
/// Decides the transmission order of pending items:
/// - High: deletes, so removed resources disappear for everyone quickly
/// - Medium: updates to existing resources
/// - Low: creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SyncPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl SyncPriority {
    /// Priority derived from the update action
    pub fn from_action(action: UpdateAction) -> Self {
        match action {
            UpdateAction::Delete => SyncPriority::High,
            UpdateAction::Update => SyncPriority::Medium,
            UpdateAction::Create => SyncPriority::Low,
        }
    }

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(SyncPriority::High),
            1 => Some(SyncPriority::Medium),
            2 => Some(SyncPriority::Low),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncPriority::High => "high",
            SyncPriority::Medium => "medium",
            SyncPriority::Low => "low",
        }
    }

    /// Whether `self` is sent before `other`
    pub fn is_higher_than(&self, other: SyncPriority) -> bool {
        self.value() < other.value()
    }

    pub fn all() -> [SyncPriority; 3] {
        [SyncPriority::High, SyncPriority::Medium, SyncPriority::Low]
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for SyncPriority {
    fn default() -> Self {
        SyncPriority::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(SyncPriority::High < SyncPriority::Medium);
        assert!(SyncPriority::Medium < SyncPriority::Low);
        assert!(SyncPriority::High.is_higher_than(SyncPriority::Low));
        assert!(!SyncPriority::Low.is_higher_than(SyncPriority::Medium));
    }

    #[test]
    fn test_priority_from_action() {
        assert_eq!(SyncPriority::from_action(UpdateAction::Delete), SyncPriority::High);
        assert_eq!(SyncPriority::from_action(UpdateAction::Update), SyncPriority::Medium);
        assert_eq!(SyncPriority::from_action(UpdateAction::Create), SyncPriority::Low);
    }

    #[test]
    fn test_priority_value_roundtrip() {
        for priority in SyncPriority::all() {
            assert_eq!(SyncPriority::from_value(priority.value()), Some(priority));
        }
        assert_eq!(SyncPriority::from_value(9), None);
    }
}
