//! In-memory warning store.
//!
//! Bounded at `max_warnings` entries with oldest-first eviction.
//! Operations are O(n) under a single lock, which is fine at this size
//! and call rate.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use relay_common::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningStoreConfig {
    pub max_warnings: usize,
    /// Warnings older than this are dropped by the cleanup task.
    pub max_warning_age_hours: i64,
}

impl Default for WarningStoreConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1000,
            max_warning_age_hours: 24,
        }
    }
}

pub struct WarningStore {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningStoreConfig,
}

impl WarningStore {
    pub fn new(config: WarningStoreConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Add a warning, evicting the oldest entry when at capacity.
    pub fn add(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();

        while warnings.len() >= self.config.max_warnings {
            let oldest = warnings
                .values()
                .min_by_key(|w| w.created_at)
                .map(|w| w.id.clone());
            match oldest {
                Some(oldest_id) => {
                    warnings.remove(&oldest_id);
                }
                None => break,
            }
        }

        debug!(id = %id, category = ?category, severity = ?severity, "Warning added");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn acknowledge_all(&self) -> usize {
        let mut warnings = self.warnings.write();
        let now = Utc::now();
        let mut count = 0;

        for warning in warnings.values_mut() {
            if !warning.acknowledged {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
                count += 1;
            }
        }

        count
    }

    pub fn clear(&self) -> usize {
        let mut warnings = self.warnings.write();
        let removed = warnings.len();
        warnings.clear();
        removed
    }

    pub fn clear_older_than(&self, hours: i64) -> usize {
        let mut warnings = self.warnings.write();
        let threshold_minutes = hours * 60;
        let before = warnings.len();

        warnings.retain(|_, w| w.age_minutes() <= threshold_minutes);

        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed = removed, hours = hours, "Cleared old warnings");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    pub fn has_critical(&self) -> bool {
        self.critical_count() > 0
    }

    /// Periodic maintenance.
    pub fn cleanup(&self) {
        self.clear_older_than(self.config.max_warning_age_hours);
    }
}

impl Default for WarningStore {
    fn default() -> Self {
        Self::new(WarningStoreConfig::default())
    }
}

/// Spawn the periodic cleanup task.
pub fn spawn_warning_cleanup(
    store: Arc<WarningStore>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.cleanup();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_list() {
        let store = WarningStore::default();

        let id = store.add(
            WarningCategory::Processing,
            WarningSeverity::Error,
            "mediation failed".to_string(),
            "test".to_string(),
        );

        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
    }

    #[test]
    fn acknowledge_clears_unacknowledged_count() {
        let store = WarningStore::default();

        let id = store.add(
            WarningCategory::Routing,
            WarningSeverity::Warn,
            "unknown pool".to_string(),
            "test".to_string(),
        );

        assert_eq!(store.unacknowledged_count(), 1);
        assert!(store.acknowledge(&id));
        assert_eq!(store.unacknowledged_count(), 0);
    }

    #[test]
    fn filter_by_severity() {
        let store = WarningStore::default();

        store.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            "w".to_string(),
            "test".to_string(),
        );
        store.add(
            WarningCategory::Election,
            WarningSeverity::Critical,
            "redis down".to_string(),
            "test".to_string(),
        );

        let critical = store.by_severity(WarningSeverity::Critical);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].message, "redis down");
        assert!(store.has_critical());
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let store = WarningStore::new(WarningStoreConfig {
            max_warnings: 3,
            max_warning_age_hours: 24,
        });

        let first = store.add(
            WarningCategory::Processing,
            WarningSeverity::Info,
            "first".to_string(),
            "test".to_string(),
        );
        for i in 0..3 {
            store.add(
                WarningCategory::Processing,
                WarningSeverity::Info,
                format!("later-{}", i),
                "test".to_string(),
            );
        }

        assert_eq!(store.count(), 3);
        assert!(!store.all().iter().any(|w| w.id == first));
    }

    #[test]
    fn clear_older_than_keeps_recent() {
        let store = WarningStore::default();
        store.add(
            WarningCategory::Processing,
            WarningSeverity::Info,
            "recent".to_string(),
            "test".to_string(),
        );

        assert_eq!(store.clear_older_than(1), 0);
        assert_eq!(store.count(), 1);
    }
}
