//! Integration tests for the float engine CLI.
//!
//! These tests run the actual binary against request envelopes and a seed
//! ledger under tests/data.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;

/// Get path to test data file
fn test_data_path(filename: &str) -> String {
    format!("tests/data/{}", filename)
}

fn engine_cmd() -> Command {
    let mut cmd = Command::cargo_bin("float-engine").unwrap();
    cmd.env("FLOAT_ENGINE_CONFIG", test_data_path("float-engine.toml"));
    cmd
}

/// Run the binary with a request and the seed ledger, returning the response
fn run_engine(request_file: &str) -> Value {
    let assert = engine_cmd()
        .arg(test_data_path(request_file))
        .arg(test_data_path("ledger.csv"))
        .assert()
        .success();
    serde_json::from_slice(&assert.get_output().stdout).unwrap()
}

#[test]
fn test_accrual_against_seed_ledger() {
    let response = run_engine("accrual_request.json");

    assert_eq!(response["statusCode"], 200);
    let body = &response["body"];
    assert_eq!(body["newBalance"], 110_000);
    assert_eq!(body["entityAllocations"]["BONUS_FEE"]["amount"], 1_000);
    assert_eq!(body["entityAllocations"]["CLIENT_FEE"]["amount"], 500);
    assert_eq!(body["entityAllocations"]["BONUS_SHARE"]["amount"], 850);
    assert_eq!(body["entityAllocations"]["CLIENT_SHARE"]["amount"], 425);
    assert!(body["entityAllocations"].get("BONUS_EXCESS").is_none());
    assert_eq!(
        body["userAllocationTransactions"]["accountTxIds"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn test_transfer_batch_reports_each_instruction() {
    let response = run_engine("transfer_request.json");

    assert_eq!(response["statusCode"], 200);
    let body = &response["body"];
    assert_eq!(body["bonus-to-user"]["result"], "SUCCESS");
    assert_eq!(body["bonus-to-user"]["floatTxIds"].as_array().unwrap().len(), 2);
    assert_eq!(body["from-accrual-event"]["result"], "ERROR");
    assert!(body["from-accrual-event"]["message"]
        .as_str()
        .unwrap()
        .contains("ACCRUAL_EVENT"));
}

#[test]
fn test_capitalization_requires_admin() {
    engine_cmd()
        .arg(test_data_path("capitalization_preview.json"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"statusCode\": 403"));
}

#[test]
fn test_fractional_amount_is_bad_request() {
    engine_cmd()
        .arg(test_data_path("fractional_request.json"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("\"statusCode\": 400"));
}

#[test]
fn test_request_without_ledger_file() {
    let assert = engine_cmd()
        .arg(test_data_path("accrual_request.json"))
        .assert()
        .success();
    let response: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

    // empty float: no prior stake, everything after fees is bonus excess
    assert_eq!(response["body"]["newBalance"], 10_000);
    assert_eq!(response["body"]["entityAllocations"]["BONUS_EXCESS"]["amount"], 8_500);
}

#[test]
fn test_missing_argument() {
    let mut cmd = Command::cargo_bin("float-engine").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Missing request file argument"));
}

#[test]
fn test_nonexistent_request_file() {
    engine_cmd()
        .arg("nonexistent_file.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_unconfigured_float_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("empty.toml");
    fs::write(&settings, "preview_sample_size = 1\n").unwrap();

    let mut cmd = Command::cargo_bin("float-engine").unwrap();
    cmd.env("FLOAT_ENGINE_CONFIG", &settings)
        .arg(test_data_path("accrual_request.json"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("No configuration for float"));
}

#[test]
fn test_archive_dir_from_environment() {
    let dir = tempfile::tempdir().unwrap();

    let assert = engine_cmd()
        .env("FLOAT_ENGINE__ARCHIVE_DIR", dir.path())
        .arg(test_data_path("accrual_request.json"))
        .arg(test_data_path("ledger.csv"))
        .assert()
        .success();
    let response: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

    let location = response["body"]["auditLocation"].as_str().unwrap();
    assert!(location.starts_with(dir.path().to_str().unwrap()));
    let audit = fs::read_to_string(location).unwrap();
    assert!(audit.contains("acc-1"));
}
