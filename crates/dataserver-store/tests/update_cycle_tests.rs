use dataserver_store::{
    ChangeEvent, DataServer, DataServerConfig, DataServerError, Hook, LogicalFile, Query, Result,
    Store, SubsetOptions, VariantFilter,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    data: TempDir,
    _work: TempDir,
    server: DataServer,
}

fn write(root: &Path, rel: &str, content: Value) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_vec(&content).unwrap()).unwrap();
}

fn fixture(files: &[(&str, Value)]) -> Fixture {
    let data = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    for (rel, content) in files {
        write(data.path(), rel, content.clone());
    }
    let server = DataServer::open(DataServerConfig::new(data.path(), work.path())).unwrap();
    server.load().unwrap();
    Fixture {
        data,
        _work: work,
        server,
    }
}

fn set(paths: &[&str]) -> BTreeSet<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

#[test]
fn load_resolves_entity_includes_and_serves_subsets() {
    let fx = fixture(&[
        ("en/page/home.json", json!({"data": {"entityInclude": "en/node/1.json"}})),
        ("en/node/1.json", json!({"data": {"content": {"title": "X"}}})),
        ("en/node/1--teaser.json", json!({"data": {"content": {"title": "short"}}})),
    ]);

    let home = fx.server.get("en/page/home.json").unwrap();
    assert_eq!(home.to_value(), json!({"data": {"title": "X"}}));
    assert!(fx.server.get("missing.json").is_none());

    assert_eq!(
        fx.server.subset(&SubsetOptions::in_dir("en")),
        vec!["en/node/1.json".to_string(), "en/page/home.json".to_string()]
    );
    assert_eq!(
        fx.server.subset(
            &SubsetOptions::in_dir("en/node").with_variant(VariantFilter::Named("teaser".into()))
        ),
        vec!["en/node/1--teaser.json".to_string()]
    );
}

#[test]
fn changed_include_target_updates_its_hosts() {
    let fx = fixture(&[
        ("page.json", json!({"data": {"menuInclude": "menu.json"}})),
        ("menu.json", json!({"title": "Old"})),
    ]);
    assert_eq!(
        fx.server.get("page.json").unwrap().to_value(),
        json!({"data": {"menu": {"title": "Old"}}})
    );

    write(fx.data.path(), "menu.json", json!({"title": "New"}));
    let report = fx
        .server
        .apply(vec![ChangeEvent::Modified("menu.json".into())])
        .unwrap();

    assert_eq!(report.updated, set(&["menu.json"]));
    assert_eq!(report.invalidated, vec!["page.json".to_string()]);
    assert_eq!(report.unique_ids.len(), 1);
    assert_eq!(
        fx.server.get("page.json").unwrap().to_value(),
        json!({"data": {"menu": {"title": "New"}}})
    );

    let logged = fx.server.operation_log().scan(None, None);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].relative_path, "menu.json");
    assert_eq!(logged[0].label, "New");
    assert_eq!(logged[0].unique_id, report.unique_ids[0]);

    for incremental in [true, false] {
        let diff = fx.server.get_diff(incremental);
        assert_eq!(diff.updated, set(&["menu.json", "page.json"]));
        assert!(diff.deleted.is_empty());
    }
}

#[test]
fn invalidation_snapshot_precedes_the_mutation() {
    let fx = fixture(&[
        ("page.json", json!({"data": {"menuInclude": "menu.json"}})),
        ("menu.json", json!({"title": "Old"})),
    ]);
    assert_eq!(
        fx.server.tag_graph().dependents_of("menu.json"),
        set(&["page.json"])
    );

    write(fx.data.path(), "page.json", json!({"data": {"title": "standalone"}}));
    write(fx.data.path(), "menu.json", json!({"title": "New"}));
    let report = fx
        .server
        .apply(vec![
            ChangeEvent::Modified("page.json".into()),
            ChangeEvent::Modified("menu.json".into()),
        ])
        .unwrap();

    assert_eq!(report.invalidated, vec!["page.json".to_string()]);
    assert!(fx.server.tag_graph().dependents_of("menu.json").is_empty());
    assert_eq!(fx.server.tag_graph().get_invalidated_filepaths(), vec!["page.json".to_string()]);
}

#[test]
fn entity_tags_flow_into_the_diff() {
    let fx = fixture(&[
        ("page.json", json!({"data": {}, "metadata": {"tags": ["entity/5"]}})),
        ("other.json", json!({"data": {}})),
    ]);

    assert_eq!(fx.server.invalidate_tags(["entity/5"]), vec!["page.json".to_string()]);
    assert_eq!(fx.server.tag_graph().get_invalidated_filepaths(), vec!["page.json".to_string()]);
    assert_eq!(fx.server.get_diff(true).updated, set(&["page.json"]));
}

#[test]
fn deletes_and_vanished_writes_are_recorded_as_deletions() {
    let fx = fixture(&[("a.json", json!({})), ("b.json", json!({}))]);
    fs::remove_file(fx.data.path().join("a.json")).unwrap();
    fs::remove_file(fx.data.path().join("b.json")).unwrap();

    let report = fx
        .server
        .apply(vec![
            ChangeEvent::Deleted("a.json".into()),
            ChangeEvent::Modified("b.json".into()),
            ChangeEvent::Deleted("never-stored.json".into()),
            ChangeEvent::Modified("notes.txt".into()),
        ])
        .unwrap();

    assert_eq!(report.deleted, set(&["a.json", "b.json"]));
    assert!(fx.server.snapshot().is_empty());
    assert_eq!(fx.server.get_diff(false).deleted, set(&["a.json", "b.json"]));
}

struct RejectPath(&'static str);

impl Hook for RejectPath {
    fn on_process_file(&self, path: &str, content: Value) -> Result<Value> {
        if path == self.0 {
            return Err(DataServerError::InvalidOperation("rejected".into()));
        }
        Ok(content)
    }
}

struct Stamp;

impl Hook for Stamp {
    fn on_process_file(&self, _path: &str, mut content: Value) -> Result<Value> {
        content["stamped"] = json!(true);
        Ok(content)
    }
}

struct FailOnAdd;

impl Hook for FailOnAdd {
    fn on_store_add(&self, _data_dir: &Path, file: &LogicalFile, _store: &mut Store) -> Result<()> {
        if file.path == "late.json" {
            return Err(DataServerError::InvalidOperation("no room".into()));
        }
        Ok(())
    }
}

#[test]
fn failing_hooks_exclude_only_their_file() {
    let fx = fixture(&[("good.json", json!({"v": 1}))]);
    fx.server.hooks().register("reject", Arc::new(RejectPath("bad.json")));
    fx.server.hooks().register("stamp", Arc::new(Stamp));
    fx.server.hooks().register("fail-on-add", Arc::new(FailOnAdd));

    write(fx.data.path(), "good.json", json!({"v": 2}));
    write(fx.data.path(), "bad.json", json!({"v": 3}));
    write(fx.data.path(), "late.json", json!({"v": 4}));
    let report = fx
        .server
        .apply(vec![
            ChangeEvent::Modified("good.json".into()),
            ChangeEvent::Created("bad.json".into()),
            ChangeEvent::Created("late.json".into()),
        ])
        .unwrap();

    assert_eq!(report.updated, set(&["good.json"]));
    let failed: BTreeSet<String> = report.failed.iter().map(|(p, _)| p.clone()).collect();
    assert_eq!(failed, set(&["bad.json", "late.json"]));

    let store = fx.server.snapshot();
    assert!(!store.contains("bad.json"));
    assert!(!store.contains("late.json"));
    assert_eq!(
        fx.server.get_file("good.json").unwrap().content,
        json!({"v": 2, "stamped": true})
    );
    assert_eq!(fx.server.operation_log().scan(None, None).len(), 1);
}

struct CountNews;

impl Query for CountNews {
    fn execute(&self, store: &Store, _args: &BTreeMap<String, String>) -> Result<Value> {
        Ok(json!(store.subset(&SubsetOptions::in_dir("news"), "json").len()))
    }
}

#[test]
fn query_results_mark_their_hosts_changed() {
    let fx = fixture(&[
        ("page.json", json!({"data": {"newsCountQueryInclude": "count?dir=news"}})),
        ("news/1.json", json!({"title": "one"})),
    ]);
    fx.server.queries().register("count", Arc::new(CountNews));

    assert!(fx.server.get_diff(true).is_empty());
    assert_eq!(fx.server.get("page.json").unwrap().field("data.newsCountQuery"), Some(json!(1)));

    write(fx.data.path(), "news/2.json", json!({"title": "two"}));
    fx.server
        .apply(vec![ChangeEvent::Created("news/2.json".into())])
        .unwrap();

    let diff = fx.server.get_diff(true);
    assert_eq!(diff.updated, set(&["news/2.json", "page.json"]));
    assert_eq!(fx.server.get("page.json").unwrap().field("data.newsCountQuery"), Some(json!(2)));
}

#[test]
fn queries_in_included_files_reach_the_includer() {
    let fx = fixture(&[
        ("page.json", json!({"data": {"menuInclude": "menu.json"}})),
        ("menu.json", json!({"newsCountQueryInclude": "count"})),
        ("news/1.json", json!({"title": "one"})),
    ]);
    fx.server.queries().register("count", Arc::new(CountNews));

    assert_eq!(
        fx.server.get("page.json").unwrap().to_value(),
        json!({"data": {"menu": {"newsCountQuery": 1}}})
    );
    assert!(fx.server.get_diff(true).is_empty());

    write(fx.data.path(), "news/2.json", json!({"title": "two"}));
    fx.server
        .apply(vec![ChangeEvent::Created("news/2.json".into())])
        .unwrap();

    assert_eq!(
        fx.server.get_diff(true).updated,
        set(&["menu.json", "news/2.json", "page.json"])
    );
    assert_eq!(
        fx.server.get("page.json").unwrap().field("data.menu.newsCountQuery"),
        Some(json!(2))
    );
}

#[test]
fn unparseable_files_are_reported_as_failed() {
    let fx = fixture(&[]);
    fs::write(fx.data.path().join("broken.json"), b"{not json").unwrap();

    let report = fx
        .server
        .apply(vec![ChangeEvent::Created("broken.json".into())])
        .unwrap();

    assert!(report.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken.json");
    assert!(report.failed[0].1.starts_with("Parse error"));
}

#[test]
fn event_loop_applies_queued_changes_until_the_channel_closes() {
    let fx = fixture(&[]);
    write(fx.data.path(), "a.json", json!({"title": "A"}));
    write(fx.data.path(), "b.json", json!({"title": "B"}));

    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(ChangeEvent::Created("a.json".into())).unwrap();
    tx.send(ChangeEvent::Created("b.json".into())).unwrap();
    drop(tx);

    fx.server.run_event_loop(rx).unwrap();
    assert_eq!(fx.server.snapshot().len(), 2);
    assert_eq!(fx.server.operation_log().scan(None, None).len(), 2);
}

#[tokio::test]
async fn subscribers_receive_cycle_reports() {
    let fx = fixture(&[]);
    let mut updates = fx.server.subscribe();

    write(fx.data.path(), "a.json", json!({}));
    let report = fx
        .server
        .apply(vec![ChangeEvent::Created("a.json".into())])
        .unwrap();

    let received = updates.recv().await.unwrap();
    assert_eq!(received, report);
    assert_eq!(received.updated, set(&["a.json"]));
}

#[test]
fn work_dir_inside_data_dir_is_not_ingested() {
    let data = TempDir::new().unwrap();
    write(data.path(), "page.json", json!({}));
    let config = DataServerConfig::new(data.path(), data.path().join("work"));
    let server = DataServer::open(config).unwrap();
    write(data.path(), "work/stray.json", json!({}));

    assert_eq!(server.load().unwrap(), 1);
    let report = server
        .apply(vec![ChangeEvent::Created("work/stray.json".into())])
        .unwrap();
    assert!(report.is_empty());
}

#[test]
fn reload_rebuilds_from_disk() {
    let fx = fixture(&[("a.json", json!({"metadata": {"tags": ["t"]}}))]);
    fx.server.tag_graph().set_dependency("external", ["t"]);
    write(fx.data.path(), "b.json", json!({}));

    assert_eq!(fx.server.reload().unwrap(), 2);
    assert!(!fx.server.tag_graph().has_tag("external"));
    assert!(fx.server.tag_graph().has_tag("a.json"));
    assert!(fx.server.operation_log().scan(None, None).is_empty());
}
