//! Lock behaviour across threads sharing one job directory.

mod common;

use common::StoreFixture;
use jobstore::lock;
use jobstore::{FieldValue, LockConfig, RejectCode};
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn second_caller_times_out_while_first_holds() {
    let fixture = StoreFixture::new();
    let job_dir = fixture.root.path().join("jobs/JOB_X_Y_00000000");
    let config = LockConfig {
        timeout_ms: 150,
        retry_interval_ms: 10,
        ..LockConfig::default()
    };

    let held = lock::acquire(&job_dir, &config).expect("first acquire");
    let started = Instant::now();
    let err = lock::acquire(&job_dir, &config).expect_err("second must wait");
    assert_eq!(err.reject_code(), Some(RejectCode::LockTimeout));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(held.release());

    lock::acquire(&job_dir, &config).expect("free after release");
}

#[test]
fn concurrent_writers_are_linearized() {
    let fixture = StoreFixture::new();
    let store = Arc::new(fixture.store());
    let (job_dir, _) = store.ensure_job("WO-100", "L1").expect("ensure");
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            let job_dir = job_dir.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..5 {
                    let mut fields = BTreeMap::new();
                    let value = FieldValue::decimal(&round.to_string()).expect("decimal");
                    fields.insert(format!("w{worker}_r{round}"), value);
                    store
                        .with_lock(&job_dir, |lock| {
                            store.record_fields(&job_dir, lock, fields, None)
                        })
                        .expect("locked write");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker thread");
    }

    // Every read-modify-write saw the previous one, so nothing was lost.
    let record = jobstore::record::load(&job_dir).expect("load");
    assert_eq!(record.fields.len(), 20);
    assert!(!job_dir.join(".lock").exists());
}
