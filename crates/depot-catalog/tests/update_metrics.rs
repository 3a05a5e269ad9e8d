//! Package update counters under a thread-local recorder.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use depot_catalog::metrics::{OUTCOME_APPLIED, OUTCOME_REJECTED, PACKAGE_UPDATE_TOTAL};
use depot_catalog::{PackageChanges, PackageCoordinator, PipelineError};
use depot_core::audit::StorageAuditLog;
use metrics::{
    Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};

use support::{Harness, PackageFixture};

#[derive(Debug, Default)]
struct Count(AtomicU64);

impl CounterFn for Count {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::SeqCst);
    }

    fn absolute(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct CountingRecorder {
    counters: Mutex<Vec<(Key, Arc<Count>)>>,
}

impl CountingRecorder {
    fn count(&self, name: &str, outcome: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| {
                key.name() == name
                    && key
                        .labels()
                        .any(|l| l.key() == "outcome" && l.value() == outcome)
            })
            .map(|(_, c)| c.0.load(Ordering::SeqCst))
            .sum()
    }
}

impl Recorder for CountingRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let count = Arc::new(Count::default());
        self.counters
            .lock()
            .unwrap()
            .push((key.clone(), Arc::clone(&count)));
        Counter::from_arc(count)
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Runs `body` on a current-thread runtime so the local recorder sees every
/// metric it emits.
fn with_recorder<F>(recorder: &CountingRecorder, body: F)
where
    F: std::future::Future<Output = ()>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    metrics::with_local_recorder(recorder, || runtime.block_on(body));
}

#[test]
fn update_is_counted_once_written_even_when_audit_fails() {
    let recorder = CountingRecorder::default();
    with_recorder(&recorder, async {
        let h = Harness::new();
        h.put_package(PackageFixture::new("foo.dmg", "foo")).await;
        h.backend.fail_puts_under("audit/");
        let mut ctx = h.ctx.clone();
        ctx.audit = Arc::new(StorageAuditLog::new(h.backend.clone()));

        let err = PackageCoordinator::new(ctx)
            .update(
                "admin@example.com",
                "foo.dmg",
                PackageChanges::new().with_catalogs(["testing"]),
                false,
            )
            .await
            .expect_err("audit write fails");
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(h.package("foo.dmg").await.unwrap().catalogs, vec!["testing"]);
    });

    assert_eq!(recorder.count(PACKAGE_UPDATE_TOTAL, OUTCOME_APPLIED), 1);
    assert_eq!(recorder.count(PACKAGE_UPDATE_TOTAL, OUTCOME_REJECTED), 0);
}

#[test]
fn refused_update_is_counted_as_rejected() {
    let recorder = CountingRecorder::default();
    with_recorder(&recorder, async {
        let h = Harness::new();
        let err = PackageCoordinator::new(h.ctx.clone())
            .update("admin@example.com", "nope.dmg", PackageChanges::new(), false)
            .await
            .expect_err("missing record");
        assert!(matches!(err, PipelineError::Validation(_)));
    });

    assert_eq!(recorder.count(PACKAGE_UPDATE_TOTAL, OUTCOME_APPLIED), 0);
    assert_eq!(recorder.count(PACKAGE_UPDATE_TOTAL, OUTCOME_REJECTED), 1);
}
