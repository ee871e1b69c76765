//! Runtime feature toggles
//!
//! `FeatureFlags` is created once from [`FeaturesConfig`] and shared as an
//! `Arc` with every component. Toggling a feature notifies subscribers
//! with a [`FeatureChange`] event; components never re-read a global.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, RwLock};

use crate::config::FeaturesConfig;
use crate::domain::DomainError;

/// A toggleable feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    DirectEdit,
    DirectTransfer,
    S3,
    AutoUpdate,
    Synchronization,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::DirectEdit => "direct_edit",
            Feature::DirectTransfer => "direct_transfer",
            Feature::S3 => "s3",
            Feature::AutoUpdate => "auto_update",
            Feature::Synchronization => "synchronization",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "direct_edit" => Ok(Feature::DirectEdit),
            "direct_transfer" => Ok(Feature::DirectTransfer),
            "s3" => Ok(Feature::S3),
            "auto_update" => Ok(Feature::AutoUpdate),
            "synchronization" => Ok(Feature::Synchronization),
            other => Err(DomainError::ValidationFailed(format!("unknown feature: {other}"))),
        }
    }
}

/// Emitted when a feature changes value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureChange {
    pub feature: Feature,
    pub enabled: bool,
}

/// Thread-safe store of feature toggles
#[derive(Debug, Default)]
pub struct FeatureFlags {
    values: RwLock<HashMap<Feature, bool>>,
    subscribers: Mutex<Vec<Sender<FeatureChange>>>,
}

impl FeatureFlags {
    /// Seeds the store from the configuration file values
    pub fn from_config(config: &FeaturesConfig) -> Self {
        let values = HashMap::from([
            (Feature::DirectEdit, config.direct_edit),
            (Feature::DirectTransfer, config.direct_transfer),
            (Feature::S3, config.s3),
            (Feature::AutoUpdate, config.auto_update),
            (Feature::Synchronization, config.synchronization),
        ]);
        Self {
            values: RwLock::new(values),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current value of a feature (unknown features are off)
    pub fn is_enabled(&self, feature: Feature) -> bool {
        match self.values.read() {
            Ok(values) => values.get(&feature).copied().unwrap_or(false),
            Err(poisoned) => poisoned.into_inner().get(&feature).copied().unwrap_or(false),
        }
    }

    /// Changes a feature; subscribers are notified only on actual change
    pub fn set(&self, feature: Feature, enabled: bool) {
        let previous = match self.values.write() {
            Ok(mut values) => values.insert(feature, enabled),
            Err(poisoned) => poisoned.into_inner().insert(feature, enabled),
        };
        if previous == Some(enabled) {
            return;
        }

        let change = FeatureChange { feature, enabled };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(change).is_ok());
        }
    }

    /// Applies toggles published by the server; unknown names are skipped
    ///
    /// Returns the number of features whose value changed.
    pub fn apply_server(&self, values: &HashMap<String, bool>) -> usize {
        let mut changed = 0;
        for (name, enabled) in values {
            let Ok(feature) = name.parse::<Feature>() else {
                continue;
            };
            if self.is_enabled(feature) != *enabled {
                self.set(feature, *enabled);
                changed += 1;
            }
        }
        changed
    }

    /// Returns a receiver of future changes
    pub fn subscribe(&self) -> Receiver<FeatureChange> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}
