//! Tests for the `imgsig` command line: flags, exit codes and diagnostics.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn imgsig() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_imgsig"));

    command
        .env_remove("SOURCE_DATE_EPOCH")
        .env_remove("OPENSSL")
        .env_remove("RUST_LOG");

    command
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn no_arguments_prints_usage() {
    let output = imgsig().output().unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Usage"));
}

#[test]
fn help_exits_successfully() {
    let output = imgsig().arg("-h").output().unwrap();

    assert!(output.status.success());

    let usage = String::from_utf8_lossy(&output.stdout);
    for flag in ["-i", "-o", "-k", "-H", "-v"] {
        assert!(usage.contains(flag), "usage should mention `{flag}`");
    }
}

#[test]
fn unknown_flag_fails() {
    let output = imgsig()
        .args(["-i", "image.bin", "-o", "out.sig", "-x"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn output_is_required_for_generate() {
    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn generate_uses_source_date_epoch() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let output = imgsig()
        .env("SOURCE_DATE_EPOCH", "1234567890")
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-o")
        .arg(&sig)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", stderr(&output));

    let digest = fs::read_to_string(data("pieeprom.sha256")).unwrap();

    assert_eq!(
        fs::read_to_string(&sig).unwrap(),
        format!("{}\nts: 1234567890\n", digest.trim())
    );
}

#[test]
fn generate_defaults_to_current_time() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-o")
        .arg(&sig)
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", stderr(&output));

    let record = imgsig::SignatureRecord::load(&sig).unwrap();

    // Some time after this test was written
    assert!(record.timestamp() > 1_700_000_000);
}

#[test]
fn missing_image_fails_without_output() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("missing.sig");

    let output = imgsig()
        .arg("-i")
        .arg(dir.path().join("missing.bin"))
        .arg("-o")
        .arg(&sig)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("missing.bin"));
    assert!(!sig.exists());
}

#[test]
fn sign_and_verify() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-o")
        .arg(&sig)
        .arg("-k")
        .arg(data("private.pem"))
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", stderr(&output));

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-v")
        .arg(&sig)
        .arg("-k")
        .arg(data("public.pem"))
        .output()
        .unwrap();

    assert!(output.status.success(), "{}", stderr(&output));
    // Successful verification is silent
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-v")
        .arg(&sig)
        .arg("-k")
        .arg(data("other-public.pem"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Invalid signature"));
}

#[test]
fn verify_requires_key() {
    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-v")
        .arg(data("pieeprom.sig.hex"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("-k"));
}

#[test]
fn verify_reports_missing_signature_field() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let digest = fs::read_to_string(data("pieeprom.sha256")).unwrap();
    fs::write(&sig, format!("{}\nts: 1\n", digest.trim())).unwrap();

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-v")
        .arg(&sig)
        .arg("-k")
        .arg(data("public.pem"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("rsa2048:"));
}

#[test]
fn invalid_key_reference_fails() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let output = imgsig()
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-o")
        .arg(&sig)
        .arg("-k")
        .arg("pkcs11")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("PKCS#11"));
    assert!(!sig.exists());
}

#[test]
fn missing_pkcs11_backend_fails() {
    let dir = TempDir::new().unwrap();
    let sig = dir.path().join("pieeprom.sig");

    let output = imgsig()
        .env("OPENSSL", "imgsig-no-such-backend")
        .arg("-i")
        .arg(data("pieeprom.bin"))
        .arg("-o")
        .arg(&sig)
        .arg("-k")
        .arg("pkcs11:object=signing")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("imgsig-no-such-backend"));
    assert!(!sig.exists());
}
