// SPDX-License-Identifier: MIT

//! The closed vocabulary of change categories a set of file paths can fall
//! into.
//!
//! Microservice names are a runtime configuration value, not part of the
//! compile-time vocabulary, so they are tracked as two name sets rather than
//! per-service enum variants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which class of component a set of changed paths affects.
///
/// `HasAnyChanges` (the `has_any_changes` method) is the disjunction over
/// every flag including the per-microservice name sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCategories {
    pub main_binary: bool,
    pub frontend: bool,
    pub display_app: bool,
    pub firmware: bool,
    pub config: bool,
    /// Microservice names whose `app/` tree changed.
    #[serde(default)]
    pub microservice_code: BTreeSet<String>,
    /// Microservice names whose `requirements.txt` changed.
    #[serde(default)]
    pub microservice_deps: BTreeSet<String>,
}

impl ChangeCategories {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff any flag or microservice name set is non-empty.
    pub fn has_any_changes(&self) -> bool {
        self.main_binary
            || self.frontend
            || self.display_app
            || self.firmware
            || self.config
            || !self.microservice_code.is_empty()
            || !self.microservice_deps.is_empty()
    }

    /// Union of every microservice name touched by either code or deps.
    pub fn touched_microservices(&self) -> BTreeSet<String> {
        self.microservice_code
            .union(&self.microservice_deps)
            .cloned()
            .collect()
    }

    /// Merge another category set into this one (used when combining git-diff
    /// categorisation with the "a new artifact exists" forced `main_binary`).
    pub fn merge(&mut self, other: &ChangeCategories) {
        self.main_binary |= other.main_binary;
        self.frontend |= other.frontend;
        self.display_app |= other.display_app;
        self.firmware |= other.firmware;
        self.config |= other.config;
        self.microservice_code
            .extend(other.microservice_code.iter().cloned());
        self.microservice_deps
            .extend(other.microservice_deps.iter().cloned());
    }
}
