//! Anti-forgery `state` values for the authorization redirect.
//!
//! Each authorization attempt gets a fresh state. A returned state is accepted
//! once, only for the app it was issued to, and only before it expires.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Issued state entry
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub app_id: String,
    pub created_at: DateTime<Utc>,
}

/// Outstanding states with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
}

impl StateManager {
    pub fn new(expiry: std::time::Duration) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::from_std(expiry).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, StateEntry>> {
        // Entries are plain data, a panicked holder cannot leave them half-written
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Generate a new state for `app_id` and store it
    pub fn create_state(&self, app_id: &str) -> String {
        let state = Uuid::new_v4().simple().to_string();
        let entry = StateEntry {
            app_id: app_id.to_string(),
            created_at: Utc::now(),
        };

        let mut states = self.states();
        let now = entry.created_at;
        states.retain(|_, e| now - e.created_at <= self.expiry_duration);
        states.insert(state.clone(), entry);

        state
    }

    /// Validate and consume a returned state.
    ///
    /// True only if the state was issued for `app_id` and has not expired.
    /// A known state is removed even when it fails validation.
    pub fn validate_and_consume(&self, app_id: &str, state: &str) -> bool {
        let Some(entry) = self.states().remove(state) else {
            return false;
        };

        entry.app_id == app_id && Utc::now() - entry.created_at <= self.expiry_duration
    }

    /// Forget an issued state without validating it
    pub fn discard(&self, state: &str) {
        self.states().remove(state);
    }

    pub fn count(&self) -> usize {
        self.states().len()
    }
}
