//! End-to-end flows through the library API.

mod common;

use common::StoreFixture;
use jobstore::record;
use jobstore::{FieldValue, RejectCode};
use std::collections::BTreeMap;
use std::fs;

fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, FieldValue> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), FieldValue::text(*value)))
        .collect()
}

#[test]
fn remark_leaves_identity_hash_but_changes_full_hash() {
    let fixture = StoreFixture::new();
    let store = fixture.store();
    let (job_dir, _) = store.ensure_job("WO-100", "L1").expect("ensure");

    let before = store
        .with_lock(&job_dir, |lock| {
            store.record_fields(&job_dir, lock, fields(&[("result", "PASS")]), None)
        })
        .expect("record result");
    let h1 = store.compute_identity_hash(&before).expect("h1");
    let f1 = store.compute_full_hash(&before).expect("f1");

    let after = store
        .with_lock(&job_dir, |lock| {
            store.record_fields(&job_dir, lock, fields(&[("remarks", "minor scuff")]), None)
        })
        .expect("record remark");
    assert_eq!(store.compute_identity_hash(&after).expect("h2"), h1);
    assert_ne!(store.compute_full_hash(&after).expect("f2"), f1);

    let reloaded = record::load(&job_dir).expect("reload");
    assert_eq!(reloaded.packet_hash.as_deref(), Some(h1.as_str()));
}

#[test]
fn preferred_extension_wins_and_loser_is_untouched() {
    let fixture = StoreFixture::new();
    let mut store_config = fixture.store().config().clone();
    store_config.slots[0].prefer_order = vec![".jpg".to_string(), ".png".to_string()];
    let store = jobstore::JobStore::with_config(fixture.root.path(), store_config);
    let (job_dir, _) = store.ensure_job("WO-100", "L1").expect("ensure");
    let png = fixture.upload("overview.png", b"png bytes");
    let jpg = fixture.upload("overview.jpg", b"jpg bytes");

    let outcome = store
        .with_lock(&job_dir, |lock| {
            store.ingest_photo(&job_dir, lock, "overview", &[png.clone(), jpg.clone()], &mut None)
        })
        .expect("ingest");

    assert_eq!(outcome.selection.chosen, jpg);
    assert_eq!(outcome.mapping.stored_path, "photos/overview.jpg");
    assert!(outcome.archived.is_empty());
    assert_eq!(fs::read(&png).expect("png still there"), b"png bytes");
    assert!(!job_dir.join("photos/_archive").exists());
}

#[test]
fn two_work_orders_never_share_a_job() {
    let fixture = StoreFixture::new();
    let store = fixture.store();
    let (dir_a, id_a) = store.ensure_job("WO-100", "L1").expect("a");
    let (dir_b, id_b) = store.ensure_job("WO-100", "L2").expect("b");
    assert_ne!(id_a, id_b);
    assert_ne!(dir_a, dir_b);

    // A record moved under the wrong directory is caught on the next ensure.
    fs::copy(dir_a.join("job.json"), dir_b.join("job.json")).expect("copy record");
    let err = store.ensure_job("WO-100", "L2").expect_err("mismatch");
    assert_eq!(err.reject_code(), Some(RejectCode::IdentityMismatch));
}

#[test]
fn reingest_keeps_audit_trail() {
    let fixture = StoreFixture::new();
    let store = fixture.store();
    let (job_dir, _) = store.ensure_job("WO-200", "L3").expect("ensure");
    let first = fixture.upload("first.jpg", b"first");
    let second = fixture.upload("second.jpg", b"second");

    store
        .with_lock(&job_dir, |lock| {
            let mut run = None;
            store.ingest_photo(&job_dir, lock, "overview", &[first.clone()], &mut run)?;
            store.ingest_photo(&job_dir, lock, "overview", &[second.clone()], &mut run)
        })
        .expect("two ingests");

    let record = record::load(&job_dir).expect("load");
    assert_eq!(record.photo_slots["overview"].source_filename, "second.jpg");
    let archived: Vec<_> = fs::read_dir(job_dir.join("photos/_archive"))
        .expect("archive dir")
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(archived.len(), 1);
    assert_eq!(fs::read(archived[0].path()).expect("archived"), b"first");
}
