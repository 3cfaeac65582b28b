use dataserver_cache::{
    Cache, CacheInvalidationListener, DependencyTagGraph, InvalidationConfig, PropagationDepth,
    TagIdentity,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;

#[test]
fn bins_stay_isolated_under_concurrent_writers() {
    let cache: Arc<Cache> = Arc::new(Cache::new());
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let cache = cache.clone();
            thread::spawn(move || {
                let bin = cache.bin(&format!("bin-{}", n));
                for i in 0..100 {
                    bin.set(format!("k{}", i), json!(n));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.keys().len(), 4);
    for n in 0..4 {
        let bin = cache.bin(&format!("bin-{}", n));
        assert_eq!(bin.count(), 100);
        assert_eq!(bin.get("k7"), Some(json!(n)));
    }
    assert_eq!(cache.bin("fresh").count(), 0);
    assert_eq!(cache.stats().bins, 5);
}

#[test]
fn tag_invalidation_evicts_dependent_cache_entries() {
    let cache: Arc<Cache> = Arc::new(Cache::new());
    let graph = DependencyTagGraph::new(InvalidationConfig {
        propagation: PropagationDepth::Transitive,
        tag_identity: TagIdentity::Any,
    });
    graph.add_listener(Arc::new(CacheInvalidationListener::new(
        cache.clone(),
        vec!["pages".to_string()],
    )));

    graph.set_dependency("page/a", ["menu/main"]);
    graph.set_dependency("menu/main", ["entity/5"]);
    cache.bin("pages").set("entity/5", json!("stale"));
    cache.bin("pages").set("page/a", json!("rendered"));

    graph.invalidate_tags(["entity/5"]);
    let affected = graph.track_invalidated_filepaths();
    assert_eq!(affected, vec!["menu/main".to_string(), "page/a".to_string()]);

    let pages = cache.bin("pages");
    for tag in &affected {
        pages.delete(tag);
    }
    assert_eq!(pages.count(), 0);
}

#[test]
fn concurrent_declarations_keep_both_directions_consistent() {
    let graph = Arc::new(DependencyTagGraph::default());
    let handles: Vec<_> = (0..8)
        .map(|n| {
            let graph = graph.clone();
            thread::spawn(move || {
                let tag = format!("page/{}", n);
                graph.set_dependency(&tag, ["shared", "other"]);
                if n % 2 == 0 {
                    graph.delete_dependency(&tag, ["shared", "other"]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(graph.dependents_of("shared").len(), 4);
    assert_eq!(graph.stats().dependent_tags, 4);
    assert_eq!(graph.stats().edges, 8);
}
