//! Per-metric error counters.
//!
//! Glean metrics never surface validation failures to the caller; instead a
//! small counter is bumped against the offending metric, and host
//! applications (or tests, via `test_get_num_recorded_errors`) can inspect it
//! later. This mirrors `glean-core`'s own `test_get_num_recorded_errors`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::ErrorType;

#[derive(Default)]
pub struct ErrorRecorder {
    counts: Mutex<HashMap<(String, String, ErrorType), u32>>,
}

impl ErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of `error_type` against `category.name`.
    pub fn record(&self, category: &str, name: &str, error_type: ErrorType) {
        log::warn!(
            "{}.{} recorded a {} error",
            category,
            name,
            error_type
        );
        let mut counts = self.counts.lock().expect("error recorder mutex poisoned");
        *counts
            .entry((category.to_owned(), name.to_owned(), error_type))
            .or_insert(0) += 1;
    }

    /// Number of `error_type` errors recorded against `category.name`. Test-only.
    pub fn test_get_num_recorded_errors(
        &self,
        category: &str,
        name: &str,
        error_type: ErrorType,
    ) -> u32 {
        let counts = self.counts.lock().expect("error recorder mutex poisoned");
        counts
            .get(&(category.to_owned(), name.to_owned(), error_type))
            .copied()
            .unwrap_or(0)
    }
}
