//! Smoke tests for the `brkt-imager` binary surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn bin() -> Command {
    Command::cargo_bin("brkt-imager").expect("binary builds")
}

#[test]
fn no_arguments_prints_help() {
    bin()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn help_lists_subcommands() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("encrypt"))
        .stdout(predicate::str::contains("update"))
        .stdout(predicate::str::contains("launch"));
}

#[test]
fn encrypt_requires_image_arguments() {
    bin()
        .arg("encrypt")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}

#[test]
fn unknown_provider_is_a_handled_failure() {
    bin()
        .args([
            "encrypt",
            "--image",
            "guest-1",
            "--encryptor-image",
            "enc-1",
            "--provider",
            "gce",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown provider"));
}

#[test]
fn encrypt_against_empty_fake_provider_fails_validation() {
    bin()
        .args([
            "encrypt",
            "--image",
            "guest-1",
            "--encryptor-image",
            "enc-1",
            "--provider",
            "fake",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("could not find image"));
}

#[test]
fn malformed_tag_is_rejected() {
    bin()
        .args([
            "encrypt",
            "--image",
            "guest-1",
            "--encryptor-image",
            "enc-1",
            "--tag",
            "missing-separator",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid tag"));
}

#[test]
fn reserved_status_port_is_rejected() {
    bin()
        .args([
            "encrypt",
            "--image",
            "guest-1",
            "--encryptor-image",
            "enc-1",
            "--status-port",
            "81",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("reserved"));
}
