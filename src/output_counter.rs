//! Per-device daily output quota.
//!
//! Counts characters spoken to each device, keyed by local date so the
//! counter resets at local midnight. Process-global, persisted to disk so a
//! restart does not reset the quota.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

const COUNTER_FILE: &str = "data/output_counter.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterState {
    /// Local date the counters belong to (YYYY-MM-DD).
    date: String,
    counts: HashMap<String, u64>,
}

static STATE: Lazy<Mutex<CounterState>> = Lazy::new(|| Mutex::new(load_state()));

fn load_state() -> CounterState {
    match std::fs::read_to_string(COUNTER_FILE) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => CounterState::default(),
    }
}

fn persist(state: &CounterState) {
    if let Some(parent) = PathBuf::from(COUNTER_FILE).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(raw) = serde_json::to_string(state) {
        let tmp = format!("{COUNTER_FILE}.tmp");
        if std::fs::write(&tmp, raw).and_then(|_| std::fs::rename(&tmp, COUNTER_FILE)).is_err() {
            warn!("failed to persist output counter");
        }
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn roll_date(state: &mut CounterState) {
    let today = today();
    if state.date != today {
        state.date = today;
        state.counts.clear();
    }
}

/// Add spoken characters for a device; returns the day's running total.
pub fn add_device_output(device_id: &str, chars: u64) -> u64 {
    let mut state = STATE.lock().unwrap();
    roll_date(&mut state);
    let total = state.counts.entry(device_id.to_string()).or_insert(0);
    *total += chars;
    let result = *total;
    persist(&state);
    result
}

/// Whether a device has exhausted its daily quota.
pub fn check_device_output_limit(device_id: &str, max_output_size: u64) -> bool {
    if max_output_size == 0 {
        return false;
    }
    let mut state = STATE.lock().unwrap();
    roll_date(&mut state);
    state.counts.get(device_id).copied().unwrap_or(0) >= max_output_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_monotonic_within_a_day() {
        let device = format!("test-{}", uuid::Uuid::new_v4());
        let a = add_device_output(&device, 10);
        let b = add_device_output(&device, 5);
        assert!(b > a);
        assert_eq!(b, 15);
        assert!(!check_device_output_limit(&device, 100));
        assert!(check_device_output_limit(&device, 15));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        assert!(!check_device_output_limit("whatever", 0));
    }
}
