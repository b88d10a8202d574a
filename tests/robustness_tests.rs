use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_malformed_rows_do_not_stop_ingest() {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "event_id, processor_type, event_type, payment_attempt_id, payload").unwrap();
    writeln!(csv, "evt_1, stripe, invoice.paid").unwrap();
    writeln!(csv, "evt_2, not a processor, invoice.paid").unwrap();
    writeln!(csv, "evt_3, stripe, invoice.paid, not-a-uuid").unwrap();
    writeln!(csv, ", stripe, invoice.paid").unwrap();
    writeln!(csv, "evt_4, stripe, invoice.paid").unwrap();

    let mut cmd = Command::new(cargo_bin!("paycycle"));
    cmd.arg("ingest-webhooks").arg(csv.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error reading webhook event"))
        .stdout(predicate::str::contains("2,0"));
}

#[test]
fn test_missing_input_file_fails() {
    Command::new(cargo_bin!("paycycle"))
        .arg("ingest-webhooks")
        .arg("tests/fixtures/does_not_exist.csv")
        .assert()
        .failure();
}

#[test]
fn test_corrupt_ledger_snapshot_fails() {
    let mut ledger = tempfile::NamedTempFile::new().unwrap();
    writeln!(ledger, "{{ not json").unwrap();

    Command::new(cargo_bin!("paycycle"))
        .arg("--ledger")
        .arg(ledger.path())
        .args(["generate-instalments", "--processor", "stripe"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Serialization error"));
}

#[test]
fn test_missing_ledger_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = dir.path().join("fresh.json");

    Command::new(cargo_bin!("paycycle"))
        .arg("--ledger")
        .arg(&ledger)
        .args(["generate-instalments", "--processor", "stripe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0,0,0"));

    assert!(ledger.exists());
}
