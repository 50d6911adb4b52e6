use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use sitesync_core::{ContentItem, ContentStore, FileStore, SiteName};

fn sitesync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("sitesync"));
    cmd.env("HOME", home).env("USERPROFILE", home).env("NO_COLOR", "1");
    cmd
}

#[test]
fn site_add_then_list() {
    let home = TempDir::new().expect("home");

    sitesync_cmd(home.path())
        .args(["site", "add", "Agency Site"])
        .assert()
        .success()
        .stdout(contains("Added site 'Agency Site'"));

    // Adding twice is idempotent.
    sitesync_cmd(home.path())
        .args(["site", "add", "Agency Site"])
        .assert()
        .success();

    sitesync_cmd(home.path())
        .args(["site", "list"])
        .assert()
        .success()
        .stdout(contains("Agency Site (agency-site-"));
}

#[test]
fn status_counts_never_synced_items() {
    let home = TempDir::new().expect("home");
    sitesync_cmd(home.path())
        .args(["site", "add", "docs"])
        .assert()
        .success();

    let store = FileStore::open_at(home.path()).expect("store");
    let mut item = ContentItem::new("docs", "intro", "page");
    item.filename = "intro".into();
    item.title = "Intro".into();
    item.body = "Start here.\n".into();
    store.save_item(&item).expect("save item");
    sitesync_sync::ChecksumTracker::new(std::sync::Arc::new(
        FileStore::open_at(home.path()).expect("store"),
    ))
    .upsert(&item)
    .expect("track item");

    let assert = sitesync_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("status json");
    assert_eq!(json["summary"]["sites"], 1);
    assert_eq!(json["summary"]["pending_items"], 1);
    assert_eq!(json["sites"][0]["site"], "docs");
    assert_eq!(json["sites"][0]["counts"]["never_synced"], 1);

    sitesync_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("1 pending items"))
        .stdout(contains("sitesync sync --all"));

    assert!(store.get_site(&SiteName::from("docs")).is_ok());
}

#[test]
fn publish_rejects_unknown_version() {
    let home = TempDir::new().expect("home");
    let config_dir = home.path().join(".sitesync");
    std::fs::create_dir_all(&config_dir).expect("config dir");
    std::fs::write(
        config_dir.join("config.yaml"),
        "github:\n  organization: agency-sites\n",
    )
    .expect("write config");

    sitesync_cmd(home.path())
        .args(["publish", "docs", "staging"])
        .assert()
        .failure()
        .stderr(contains("unknown version 'staging'"));
}

#[test]
fn daemon_status_when_not_running() {
    let home = TempDir::new().expect("home");
    sitesync_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}
