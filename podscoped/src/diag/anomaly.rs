use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub target: String,
    pub severity: Severity,
    pub description: String,
}

/// Deduplicated anomaly set: at most one entry per (category, target),
/// keeping the highest severity seen and the description that came with it.
/// Timestamps are stamped at first detection and never rewritten, so
/// rendering the same book twice gives identical output.
#[derive(Clone, Default)]
pub struct AnomalyBook {
    entries: BTreeMap<(Category, String), Anomaly>,
}

impl AnomalyBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(
        &mut self,
        category: Category,
        target: &str,
        severity: Severity,
        description: String,
    ) {
        let key = (category, target.to_string());
        match self.entries.get_mut(&key) {
            Some(existing) => {
                if severity >= existing.severity {
                    existing.severity = severity;
                    existing.description = description;
                }
            }
            None => {
                self.entries.insert(
                    key,
                    Anomaly {
                        timestamp: Utc::now(),
                        category,
                        target: target.to_string(),
                        severity,
                        description,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most severe first, then category order, then target.
    pub fn sorted(&self) -> Vec<Anomaly> {
        let mut out: Vec<Anomaly> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.target.cmp(&b.target))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert!(Severity::Critical < Severity::Fatal);
    }

    #[test]
    fn one_entry_per_category_target_pair() {
        let mut book = AnomalyBook::new();
        book.upsert(Category::Dns, "example.com", Severity::Warning, "a".into());
        book.upsert(Category::Dns, "example.com", Severity::Critical, "b".into());
        book.upsert(Category::Dns, "example.com", Severity::Info, "c".into());
        assert_eq!(book.len(), 1);
        let anomaly = &book.sorted()[0];
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(anomaly.description, "b");
    }

    #[test]
    fn equal_severity_refreshes_description() {
        let mut book = AnomalyBook::new();
        book.upsert(Category::Dns, "x", Severity::Warning, "first".into());
        book.upsert(Category::Dns, "x", Severity::Warning, "latest".into());
        assert_eq!(book.sorted()[0].description, "latest");
    }

    #[test]
    fn sorted_puts_most_severe_first() {
        let mut book = AnomalyBook::new();
        book.upsert(Category::Network, "a", Severity::Warning, String::new());
        book.upsert(Category::Dns, "b", Severity::Critical, String::new());
        book.upsert(Category::Cpu, "c", Severity::Info, String::new());
        let severities: Vec<Severity> = book.sorted().iter().map(|a| a.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::Warning, Severity::Info]
        );
    }
}
