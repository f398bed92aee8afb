// ABOUTME: Black-box verification harness driven against the store facade.
// ABOUTME: Round-trip, expiry, stats-sanity, listener and export/import checks with pass/fail reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Duration;
use courtyard_store::{LocalStore, SetOptions};
use serde_json::json;

/// Outcome of a single check.
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Collected results of one harness run.
pub struct Report {
    pub checks: Vec<CheckResult>,
}

impl Report {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn print(&self) {
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            println!("{status}  {:<24} {}", check.name, check.detail);
        }
        let passed = self.checks.iter().filter(|c| c.passed).count();
        println!("{passed}/{} checks passed", self.checks.len());
    }
}

/// Run every check against the store. The store is treated as a black box:
/// only its public operations are exercised.
pub async fn run(store: &LocalStore) -> Report {
    let checks = vec![
        round_trip(store).await,
        expiry(store).await,
        stats_sanity(store).await,
        listener_fires(store).await,
        listener_isolation(store).await,
        export_import(store).await,
    ];
    Report { checks }
}

async fn round_trip(store: &LocalStore) -> CheckResult {
    const NAME: &str = "round-trip";
    let value = json!({"theme": "dark", "columns": [1, 2, 3]});

    if let Err(e) = store.set_item("verify-rt", value.clone(), SetOptions::default()).await {
        return CheckResult::fail(NAME, format!("set failed: {e}"));
    }
    let read = store.get_item("verify-rt").await;
    if read.as_ref() != Some(&value) {
        return CheckResult::fail(NAME, format!("read back {read:?}, expected the written value"));
    }

    if let Err(e) = store.remove_item("verify-rt").await {
        return CheckResult::fail(NAME, format!("remove failed: {e}"));
    }
    if store.get_item("verify-rt").await.is_some() {
        return CheckResult::fail(NAME, "value survived removal".to_string());
    }

    CheckResult::pass(NAME, "set/get/remove behave as expected")
}

async fn expiry(store: &LocalStore) -> CheckResult {
    const NAME: &str = "expiry";

    // Already-expired entry: present to has_key until the stale read occurs
    if let Err(e) = store
        .set_item_with_expiry("verify-exp-now", "x", Duration::milliseconds(-1))
        .await
    {
        return CheckResult::fail(NAME, format!("set failed: {e}"));
    }
    if !store.has_key("verify-exp-now").await {
        return CheckResult::fail(NAME, "has_key should ignore expiry before the stale read".to_string());
    }
    if store.get_item("verify-exp-now").await.is_some() {
        return CheckResult::fail(NAME, "already-expired entry was returned".to_string());
    }
    if store.has_key("verify-exp-now").await {
        return CheckResult::fail(NAME, "stale read should have evicted the entry".to_string());
    }

    // Timed expiry window
    if let Err(e) = store
        .set_item_with_expiry("verify-exp", "y", Duration::milliseconds(80))
        .await
    {
        return CheckResult::fail(NAME, format!("set failed: {e}"));
    }
    if store.get_item("verify-exp").await != Some(json!("y")) {
        return CheckResult::fail(NAME, "value missing before its deadline".to_string());
    }
    tokio::time::sleep(std::time::Duration::from_millis(160)).await;
    if store.get_item("verify-exp").await.is_some() {
        return CheckResult::fail(NAME, "value still readable after its deadline".to_string());
    }

    CheckResult::pass(NAME, "lazy eviction and has_key divergence hold")
}

async fn stats_sanity(store: &LocalStore) -> CheckResult {
    const NAME: &str = "stats-sanity";

    let before = store.stats().await;
    if let Err(e) = store.set_item("verify-stats", json!([1, 2]), SetOptions::default()).await {
        return CheckResult::fail(NAME, format!("set failed: {e}"));
    }
    let after = store.stats().await;

    if after.item_count != before.item_count + 1 {
        return CheckResult::fail(
            NAME,
            format!("item_count {} -> {}, expected +1", before.item_count, after.item_count),
        );
    }
    if after.used_size <= before.used_size {
        return CheckResult::fail(NAME, "used_size did not grow on write".to_string());
    }
    if after.total_size == 0 {
        return CheckResult::fail(NAME, "total_size reported as zero".to_string());
    }

    if let Err(e) = store.remove_item("verify-stats").await {
        return CheckResult::fail(NAME, format!("remove failed: {e}"));
    }
    let restored = store.stats().await;
    if restored.item_count != before.item_count {
        return CheckResult::fail(
            NAME,
            format!("item_count did not return to {} after removal", before.item_count),
        );
    }

    CheckResult::pass(NAME, "counts and sizes move with mutations")
}

async fn listener_fires(store: &LocalStore) -> CheckResult {
    const NAME: &str = "listener-fires";

    let specific = Arc::new(AtomicUsize::new(0));
    let global = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&specific);
    let specific_id = store.add_listener("verify-listen", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&global);
    let global_id = store.add_listener("", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let set = store.set_item("verify-listen", json!(1), SetOptions::default()).await;
    let removed = store.remove_item("verify-listen").await;

    store.remove_listener("verify-listen", specific_id);
    store.remove_listener("", global_id);

    if set.is_err() || removed.is_err() {
        return CheckResult::fail(NAME, "mutations failed during listener check".to_string());
    }
    let specific = specific.load(Ordering::SeqCst);
    let global = global.load(Ordering::SeqCst);
    if specific != 2 {
        return CheckResult::fail(NAME, format!("specific listener fired {specific} times, expected 2"));
    }
    if global < 2 {
        return CheckResult::fail(NAME, format!("global listener fired {global} times, expected at least 2"));
    }

    CheckResult::pass(NAME, "specific and global listeners both fired")
}

async fn listener_isolation(store: &LocalStore) -> CheckResult {
    const NAME: &str = "listener-isolation";

    let survivor = Arc::new(AtomicUsize::new(0));

    let panicking_id = store.add_listener("verify-isolate", |_| panic!("deliberately failing listener"));
    let counter = Arc::clone(&survivor);
    let survivor_id = store.add_listener("verify-isolate", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = store.set_item("verify-isolate", json!("ok"), SetOptions::default()).await;
    let read = store.get_item("verify-isolate").await;

    store.remove_listener("verify-isolate", panicking_id);
    store.remove_listener("verify-isolate", survivor_id);
    let _ = store.remove_item("verify-isolate").await;

    if result.is_err() {
        return CheckResult::fail(NAME, "a failing listener must not fail the mutation".to_string());
    }
    if read != Some(json!("ok")) {
        return CheckResult::fail(NAME, "the mutation did not take effect".to_string());
    }
    if survivor.load(Ordering::SeqCst) != 1 {
        return CheckResult::fail(NAME, "the sibling listener was never invoked".to_string());
    }

    CheckResult::pass(NAME, "a failing listener is isolated from siblings and the write path")
}

async fn export_import(store: &LocalStore) -> CheckResult {
    const NAME: &str = "export-import";

    let set_a = store.set_item("verify-io-a", json!(1), SetOptions::default()).await;
    let set_b = store.set_item("verify-io-b", json!({"k": "v"}), SetOptions::default()).await;
    if set_a.is_err() || set_b.is_err() {
        return CheckResult::fail(NAME, "seed writes failed".to_string());
    }

    let exported = store.export_data().await;
    if let Err(e) = store.import_data(exported.clone(), false).await {
        return CheckResult::fail(NAME, format!("import failed: {e}"));
    }
    let again = store.export_data().await;

    let _ = store.remove_item("verify-io-a").await;
    let _ = store.remove_item("verify-io-b").await;

    if again != exported {
        return CheckResult::fail(NAME, "export/import/export did not reproduce the key set".to_string());
    }
    CheckResult::pass(NAME, format!("{} entries round-tripped", exported.len()))
}
