//! Daemon registry persistence, discovery and stale-entry integration tests.
//! Storage: <registry_dir>/daemon-<id>.yaml

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use assert_fs::prelude::*;
use chrono::Utc;
use ember_core::{
    registry::{self, DaemonRegistry},
    AuthToken, ContextFingerprint, DaemonId, DaemonRegistryEntry, RegistryError,
};
use predicates::prelude::predicate;

fn fp(s: &str) -> ContextFingerprint {
    ContextFingerprint(s.to_string())
}

fn entry(address: SocketAddr, fingerprint: &str) -> DaemonRegistryEntry {
    DaemonRegistryEntry {
        daemon_id: DaemonId::generate(),
        address,
        fingerprint: fp(fingerprint),
        registry_dir: PathBuf::from("/code/registry"),
        pid: Some(4242),
        token: AuthToken::generate(),
        started_at: Utc::now(),
    }
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// ---------------------------------------------------------------------------
// 1. Store / load / remove
// ---------------------------------------------------------------------------

#[test]
fn stored_entry_is_readable_yaml_with_address() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let e = entry(local(40100), "abc");
    let path = registry.store(&e).expect("store");

    let file = dir.child(path.file_name().unwrap());
    file.assert(predicate::path::exists());
    file.assert(predicate::str::contains("127.0.0.1:40100"));
    file.assert(predicate::str::contains("fingerprint: abc"));

    let loaded = registry.load(&e.daemon_id).expect("load").expect("present");
    assert_eq!(loaded, e);
}

#[test]
fn remove_by_address_only_touches_matching_entries() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let a = entry(local(40101), "abc");
    let b = entry(local(40102), "abc");
    registry.store(&a).expect("store a");
    registry.store(&b).expect("store b");

    let removed = registry.remove(&a.address).expect("remove");
    assert_eq!(removed, 1);

    let remaining = registry.all().expect("all");
    assert_eq!(remaining, vec![b]);
}

#[test]
fn remove_missing_address_is_noop() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    assert_eq!(registry.remove(&local(1)).expect("remove"), 0);
    assert!(!registry.remove_daemon(&DaemonId::generate()).expect("remove"));
}

#[test]
fn corrupt_entry_is_skipped_by_listing() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let good = entry(local(40105), "abc");
    registry.store(&good).expect("store");
    fs::write(dir.path().join("daemon-foreign.yaml"), b"not: [valid").expect("write");

    assert_eq!(registry.all().expect("all"), vec![good.clone()]);
    assert_eq!(registry.find_compatible(&fp("abc")).expect("find"), vec![good]);
}

#[test]
fn corrupt_entry_load_reports_path() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let id = DaemonId::generate();
    fs::create_dir_all(dir.path()).expect("mkdir");
    fs::write(registry.entry_path(&id), b": : not : yaml : [").expect("write");

    let err = registry.load(&id).unwrap_err();
    assert!(matches!(err, RegistryError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains(&id.0.simple().to_string()));
}

#[test]
fn prune_stale_removes_unreadable_entry_files() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let live = entry(listener.local_addr().unwrap(), "abc");
    registry.store(&live).expect("store");
    dir.child("daemon-foreign.yaml").write_str("not: [valid").expect("write");

    let pruned = registry.prune_stale(Duration::from_millis(500)).expect("prune");
    assert!(pruned.is_empty());
    dir.child("daemon-foreign.yaml").assert(predicate::path::missing());
    assert_eq!(registry.all().expect("all"), vec![live]);
}

#[test]
fn unrelated_files_are_ignored() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    dir.child("notes.txt").write_str("hello").expect("write");
    dir.child("daemon-x.yaml.tmp").write_str("partial").expect("write");
    assert!(DaemonRegistry::new(dir.path()).all().expect("all").is_empty());
}

// ---------------------------------------------------------------------------
// 2. Discovery
// ---------------------------------------------------------------------------

#[test]
fn find_compatible_filters_by_fingerprint() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());
    let wanted = entry(local(40103), "wanted");
    registry.store(&wanted).expect("store");
    registry.store(&entry(local(40104), "other")).expect("store");

    let found = registry.find_compatible(&fp("wanted")).expect("find");
    assert_eq!(found, vec![wanted]);
}

#[test]
fn probe_distinguishes_live_and_stale_entries() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let live = entry(listener.local_addr().unwrap(), "abc");

    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().unwrap()
    };
    let stale = entry(closed_port, "abc");

    assert!(registry::probe(&live, Duration::from_millis(500)));
    assert!(!registry::probe(&stale, Duration::from_millis(500)));
}

#[test]
fn prune_stale_removes_only_unreachable_entries() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let registry = DaemonRegistry::new(dir.path());

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let live = entry(listener.local_addr().unwrap(), "abc");
    let stale_addr = {
        let l = TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().unwrap()
    };
    let stale = entry(stale_addr, "abc");
    registry.store(&live).expect("store live");
    registry.store(&stale).expect("store stale");

    let pruned = registry.prune_stale(Duration::from_millis(500)).expect("prune");
    assert_eq!(pruned, vec![stale]);
    assert_eq!(registry.all().expect("all"), vec![live]);
}
