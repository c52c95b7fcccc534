//! Drives the `jobstore` binary end to end.

mod common;

use common::{stdout_line, StoreFixture};

#[test]
fn ensure_record_hash_status_round_trip() {
    let fixture = StoreFixture::new();
    let job_id = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-100", "--line", "L1"]));
    assert!(job_id.starts_with("JOB_WO_100_L1_"), "{job_id}");

    let again = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-100", "--line", "L1"]));
    assert_eq!(again, job_id);

    let recorded = stdout_line(&fixture.cli(&[
        "record", "--job", &job_id, "--field", "result=PASS", "--decimal", "torque_nm=12.50",
    ]));
    let identity = stdout_line(&fixture.cli(&["hash", "--job", &job_id]));
    assert_eq!(recorded, identity);

    stdout_line(&fixture.cli(&["record", "--job", &job_id, "--field", "remarks=scuffed"]));
    assert_eq!(stdout_line(&fixture.cli(&["hash", "--job", &job_id])), identity);
    let full = stdout_line(&fixture.cli(&["hash", "--job", &job_id, "--full"]));
    assert_ne!(full, identity);

    let status = stdout_line(&fixture.cli(&["status", "--job", &job_id, "--json"]));
    let json: serde_json::Value = serde_json::from_str(&status).expect("status json");
    assert_eq!(json["identity_hash"], identity.as_str());
    assert_eq!(json["record"]["fields"]["torque_nm"]["value"], "12.5");
    assert_eq!(
        json["missing_slots"],
        serde_json::json!(["overview", "label_serial"])
    );
}

#[test]
fn ingest_and_override_cover_required_slots() {
    let fixture = StoreFixture::new();
    let job_id = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-7", "--line", "3"]));
    let png = fixture.upload("a.png", b"png");
    let jpg = fixture.upload("a.jpg", b"jpg");

    let stored = stdout_line(&fixture.cli(&[
        "ingest",
        "--job",
        &job_id,
        "--slot",
        "label_serial",
        png.to_str().expect("utf8 path"),
        jpg.to_str().expect("utf8 path"),
    ]));
    assert_eq!(stored, "photos/label_serial.jpg");
    assert!(png.exists());

    let run_id = stdout_line(&fixture.cli(&[
        "override", "--job", &job_id, "--slot", "overview", "--reason", "lens cracked", "--user",
        "qa-1",
    ]));
    assert!(!run_id.is_empty());

    let status = stdout_line(&fixture.cli(&["status", "--job", &job_id, "--json"]));
    let json: serde_json::Value = serde_json::from_str(&status).expect("status json");
    assert_eq!(json["missing_slots"], serde_json::json!([]));
    // One run from the ambiguous ingest, one from the override.
    assert_eq!(json["runs"].as_array().map(Vec::len), Some(2));
}

#[test]
fn policy_rejects_fail_with_structured_message() {
    let fixture = StoreFixture::new();
    let job_id = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-1", "--line", "L1"]));
    let output = fixture.cli(&["record", "--job", &job_id, "--decimal", "gap=NaN"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid_number"), "{stderr}");

    let output = fixture.cli(&[
        "override", "--job", &job_id, "--slot", "label_serial", "--reason", "x", "--user", "y",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid_slot"));
}

#[test]
fn sessions_bind_and_resolve() {
    let fixture = StoreFixture::new();
    let job_id = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-9", "--line", "L2"]));
    stdout_line(&fixture.cli(&["bind-session", "--session", "chat-1", "--job", &job_id]));
    assert_eq!(
        stdout_line(&fixture.cli(&["resolve-session", "--session", "chat-1"])),
        job_id
    );
    let output = fixture.cli(&["resolve-session", "--session", "chat-2"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown_session"));
}

#[test]
fn warn_appends_to_named_run() {
    let fixture = StoreFixture::new();
    let job_id = stdout_line(&fixture.cli(&["ensure", "--wo", "WO-5", "--line", "L1"]));
    let warn = |run: Option<&str>| {
        let mut args = vec![
            "warn",
            "--job",
            job_id.as_str(),
            "--code",
            "unit_guess",
            "--action",
            "extract",
            "--subject",
            "torque_nm",
            "--original",
            "12.5 Nm",
            "--resolved",
            "12.5",
            "--message",
            "unit stripped",
        ];
        if let Some(run) = run {
            args.extend(["--run", run]);
        }
        stdout_line(&fixture.cli(&args))
    };
    let run_id = warn(None);
    assert_eq!(warn(Some(run_id.as_str())), run_id);

    let path = fixture
        .root
        .path()
        .join("jobs")
        .join(&job_id)
        .join("runs")
        .join(format!("{run_id}.json"));
    let run: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).expect("run file")).expect("json");
    assert_eq!(run["events"].as_array().map(Vec::len), Some(2));
}
