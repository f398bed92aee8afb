// ABOUTME: Boundary stress driver: fills the origin near capacity with expired filler,
// ABOUTME: then exercises a normal write and asserts a bounded residual key count.

use std::sync::Arc;

use chrono::{Duration, Utc};
use courtyard_core::{Namespacer, StorageEnvelope};
use courtyard_store::{LocalStore, SetOptions, Substrate};
use serde_json::json;

/// How many expired filler envelopes to plant under the namespace.
pub const FILLER_COUNT: usize = 120;

/// After the exercised write, the namespace must hold fewer keys than this.
pub const RESIDUAL_KEY_LIMIT: usize = 101;

pub struct StressOutcome {
    pub filler_written: usize,
    pub write_ok: bool,
    pub residual_keys: usize,
    pub used_after: usize,
    pub passed: bool,
}

impl StressOutcome {
    pub fn print(&self) {
        println!("filler envelopes written: {}", self.filler_written);
        println!("exercised write ok:       {}", self.write_ok);
        println!(
            "residual keys:            {} (limit {})",
            self.residual_keys, RESIDUAL_KEY_LIMIT
        );
        println!("origin bytes used after:  {}", self.used_after);
        println!("{}", if self.passed { "STRESS PASS" } else { "STRESS FAIL" });
    }
}

/// Plant expired filler envelopes raw through the substrate, sized so the
/// origin ends up near its ceiling, then perform one normal write through
/// the facade. The system must not error and must bound the key count.
pub async fn run(store: &LocalStore, substrate: &Arc<dyn Substrate>, prefix: &str) -> StressOutcome {
    let namespacer = Namespacer::new(prefix);
    let value_len = substrate.capacity() / FILLER_COUNT;
    let expired_at = Utc::now() - Duration::hours(1);

    let mut filler_written = 0;
    for i in 0..FILLER_COUNT {
        let key = format!("stress-filler-{i:03}");
        let envelope = StorageEnvelope::wrap(
            key.as_str(),
            json!("x".repeat(value_len)),
            "0.1.0",
            Some(expired_at),
        );
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "could not encode filler envelope");
                continue;
            }
        };
        match substrate.set(&namespacer.namespaced(&key), &raw) {
            Ok(()) => filler_written += 1,
            Err(e) => {
                tracing::debug!(error = %e, filler_written, "filler rejected; origin is full enough");
                break;
            }
        }
    }
    tracing::info!(filler_written, "origin filled with expired filler");

    let write_ok = store
        .set_item("stress-new-item", json!("v"), SetOptions::default())
        .await
        .is_ok();
    let residual_keys = store.keys().await.len();
    let used_after = substrate.used().unwrap_or(0);

    StressOutcome {
        filler_written,
        write_ok,
        residual_keys,
        used_after,
        passed: write_ok && residual_keys < RESIDUAL_KEY_LIMIT,
    }
}
