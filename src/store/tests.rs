//! Tests for the JSON fleet store.

use std::sync::Arc;
use std::thread;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use super::*;
use crate::fleet::{ALL_TOKEN, Instance, match_instances};

fn temp_store() -> (TempDir, JsonFleetStore) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let dir = Utf8PathBuf::from_path_buf(tmp.path().join("overcast"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    (tmp, JsonFleetStore::new(dir))
}

#[test]
fn missing_documents_read_as_empty() {
    let (_tmp, store) = temp_store();
    assert!(store.clusters().expect("read clusters").is_empty());
    assert!(store.variables().expect("read variables").is_empty());
}

#[test]
fn update_persists_changes() {
    let (_tmp, store) = temp_store();
    store
        .update(&mut |clusters| clusters.insert("db", Instance::new("db.01", "10.0.0.1")))
        .expect("insert");

    let reread = store.clusters().expect("read back");
    let (cluster, instance) = reread.find("db.01").expect("stored");
    assert_eq!(cluster, "db");
    assert_eq!(instance.ip, "10.0.0.1");
}

#[test]
fn update_rejects_duplicate_names_without_writing() {
    let (_tmp, store) = temp_store();
    store
        .update(&mut |clusters| clusters.insert("db", Instance::new("db.01", "10.0.0.1")))
        .expect("seed");

    let err = store
        .update(&mut |clusters| clusters.insert("web", Instance::new("db.01", "10.0.0.9")))
        .expect_err("duplicate should fail");
    assert!(matches!(err, StoreError::Invalid(FleetError::DuplicateInstance { .. })));
    assert!(store.clusters().expect("read").cluster("web").is_none());
}

#[test]
fn malformed_documents_are_parse_errors() {
    let (_tmp, store) = temp_store();
    Dir::create_ambient_dir_all(store.dir(), ambient_authority()).expect("create dir");
    let dir = Dir::open_ambient_dir(store.dir(), ambient_authority()).expect("open dir");
    dir.write(CLUSTERS_FILE, "{not json").expect("write");
    dir.write(VARIABLES_FILE, "[1, 2]").expect("write");

    assert!(matches!(store.clusters(), Err(StoreError::Parse { .. })));
    assert!(matches!(store.variables(), Err(StoreError::Parse { .. })));
}

#[test]
fn variables_are_read_as_string_map() {
    let (_tmp, store) = temp_store();
    Dir::create_ambient_dir_all(store.dir(), ambient_authority()).expect("create dir");
    let dir = Dir::open_ambient_dir(store.dir(), ambient_authority()).expect("open dir");
    dir.write(VARIABLES_FILE, r#"{"SCW_SECRET_KEY": "secret"}"#)
        .expect("write");

    let variables = store.variables().expect("read");
    assert_eq!(variables.get("SCW_SECRET_KEY").map(String::as_str), Some("secret"));
}

#[test]
fn concurrent_updates_merge_instead_of_overwriting() {
    let (_tmp, json_store) = temp_store();
    let store = Arc::new(json_store);
    store
        .update(&mut |clusters| {
            for index in 0..8 {
                clusters.insert("web", Instance::new(format!("web-{index}"), "0.0.0.0"))?;
            }
            Ok(())
        })
        .expect("seed");

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let shared = Arc::clone(&store);
            thread::spawn(move || {
                shared
                    .update(&mut |clusters| {
                        let mut updated = Instance::new(format!("web-{index}"), format!("10.0.0.{index}"));
                        updated.user = String::from("ubuntu");
                        clusters.replace(updated)
                    })
                    .expect("update");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    let clusters = store.clusters().expect("read");
    for index in 0..8 {
        let (_, instance) = clusters.find(&format!("web-{index}")).expect("present");
        assert_eq!(instance.ip, format!("10.0.0.{index}"));
    }
}

#[test]
fn document_order_survives_read_and_rewrite() {
    let (_tmp, store) = temp_store();
    Dir::create_ambient_dir_all(store.dir(), ambient_authority()).expect("create dir");
    let dir = Dir::open_ambient_dir(store.dir(), ambient_authority()).expect("open dir");
    dir.write(
        CLUSTERS_FILE,
        r#"{
            "web": {"instances": {
                "web-9": {"name": "web-9", "ip": "10.0.0.9"},
                "web-10": {"name": "web-10", "ip": "10.0.0.10"}
            }},
            "db": {"instances": {"db.01": {"name": "db.01", "ip": "10.0.1.1"}}}
        }"#,
    )
    .expect("write");

    let order = |clusters: &Clusters| -> Vec<String> {
        match_instances(clusters, ALL_TOKEN)
            .expect("match all")
            .into_iter()
            .map(|instance| instance.name)
            .collect()
    };
    assert_eq!(order(&store.clusters().expect("read")), ["web-9", "web-10", "db.01"]);

    store.update(&mut |_| Ok(())).expect("no-op update");

    let rewritten = dir.read_to_string(CLUSTERS_FILE).expect("read back");
    let web_at = rewritten.find("\"web\"").expect("web cluster written");
    let db_at = rewritten.find("\"db\"").expect("db cluster written");
    assert!(web_at < db_at, "{rewritten}");
    assert!(
        rewritten.find("web-9").expect("web-9") < rewritten.find("web-10").expect("web-10"),
        "{rewritten}"
    );
    assert_eq!(order(&store.clusters().expect("reread")), ["web-9", "web-10", "db.01"]);
}
