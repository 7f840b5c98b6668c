//! User notification preferences.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// A daily window during which notifications are held back. The window
/// may wrap past midnight; `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Explicit per-category switches.
    #[serde(default)]
    pub categories_enabled: BTreeMap<String, bool>,
    /// Applies to categories without an explicit switch.
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

fn default_enabled() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            categories_enabled: BTreeMap::new(),
            default_enabled: true,
            quiet_hours: None,
        }
    }
}

impl Preferences {
    pub fn is_enabled(&self, category: &str) -> bool {
        self.categories_enabled
            .get(category)
            .copied()
            .unwrap_or(self.default_enabled)
    }

    pub fn is_quiet(&self, time: NaiveTime) -> bool {
        self.quiet_hours.is_some_and(|window| window.contains(time))
    }
}

/// Holds the current preference snapshot. Updates replace it atomically;
/// readers keep whatever snapshot they already took.
#[derive(Debug, Default)]
pub struct PreferenceStore {
    current: RwLock<Arc<Preferences>>,
}

impl PreferenceStore {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            current: RwLock::new(Arc::new(preferences)),
        }
    }

    pub fn snapshot(&self) -> Arc<Preferences> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update(&self, preferences: Preferences) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(preferences);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let window = QuietHours {
            start: at(13, 0),
            end: at(14, 0),
        };
        assert!(window.contains(at(13, 0)));
        assert!(window.contains(at(13, 59)));
        assert!(!window.contains(at(14, 0)));
        assert!(!window.contains(at(9, 0)));
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let window = QuietHours {
            start: at(22, 0),
            end: at(7, 0),
        };
        assert!(window.contains(at(23, 30)));
        assert!(window.contains(at(0, 0)));
        assert!(window.contains(at(6, 59)));
        assert!(!window.contains(at(7, 0)));
        assert!(!window.contains(at(12, 0)));
    }

    #[test]
    fn test_empty_window() {
        let window = QuietHours {
            start: at(8, 0),
            end: at(8, 0),
        };
        assert!(!window.contains(at(8, 0)));
    }

    #[test]
    fn test_category_switches() {
        let mut prefs = Preferences::default();
        prefs.categories_enabled.insert("sync.completed".to_string(), false);
        assert!(!prefs.is_enabled("sync.completed"));
        assert!(prefs.is_enabled("sync.failed"));

        prefs.default_enabled = false;
        assert!(!prefs.is_enabled("news"));
    }

    #[test]
    fn test_deserialize_partial() {
        let prefs: Preferences = serde_json::from_str(
            r#"{"quiet_hours": {"start": "22:00:00", "end": "07:00:00"}}"#,
        )
        .unwrap();
        assert!(prefs.default_enabled);
        assert!(prefs.is_quiet(at(23, 0)));
    }

    #[test]
    fn test_store_snapshot_isolated_from_update() {
        let store = PreferenceStore::default();
        let before = store.snapshot();

        let mut prefs = Preferences::default();
        prefs.default_enabled = false;
        store.update(prefs);

        assert!(before.default_enabled);
        assert!(!store.snapshot().default_enabled);
    }
}
