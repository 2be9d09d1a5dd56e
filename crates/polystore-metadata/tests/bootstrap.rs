mod common;

use common::{cluster, config, single_unit_plan};
use polystore_common::{ColumnsRange, KEY_MAX, KeyInterval, StorageUnitId};
use polystore_meta_store::StorageUnitMeta;
use polystore_metadata::BootstrapOutcome;
use polystore_metadata::validate::check_initial_tiling;
use polystore_placement::{FragmentPlan, InitialLayoutPlanner, StorageUnitPlan};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn paths(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn test_single_unit_bootstrap() {
    let managers = cluster(1, &config(1, 0));
    let manager = &managers[0];
    assert!(!manager.has_fragment());

    let outcome = manager.create_initial_fragments_and_storage_units(&single_unit_plan(manager));
    assert_eq!(outcome, BootstrapOutcome::InitializedByMe);
    assert!(manager.has_fragment());

    let fragment = manager
        .latest_fragment(&ColumnsRange::bounded("root.a", "root.b"))
        .unwrap();
    assert_eq!(fragment.keys, KeyInterval::full());
    assert_ne!(fragment.master_storage_unit_id, StorageUnitId::new("u0"));
    let unit = fragment.master_storage_unit.unwrap();
    assert_eq!(unit.id, fragment.master_storage_unit_id);
    assert!(unit.is_master);
    assert!(manager.storage_unit(&unit.id).is_some());
}

#[test]
fn test_bootstrap_at_most_once() {
    let managers = cluster(4, &config(3, 1));
    let outcomes: Vec<BootstrapOutcome> = std::thread::scope(|s| {
        let handles: Vec<_> = managers
            .iter()
            .map(|manager| {
                s.spawn(move || {
                    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
                    let plan = InitialLayoutPlanner::new(1).plan_initial(
                        &paths(&["root.a", "root.m", "root.z"]),
                        KeyInterval::full(),
                        &engines,
                        manager.id_generator(),
                    );
                    manager.create_initial_fragments_and_storage_units(&plan)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = outcomes
        .iter()
        .filter(|o| **o == BootstrapOutcome::InitializedByMe)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == BootstrapOutcome::AlreadyInitialized)
            .count(),
        3
    );

    let view = |i: usize| -> BTreeSet<(ColumnsRange, i64, StorageUnitId)> {
        managers[i]
            .fragments_by_columns(&ColumnsRange::unbounded(), None, false)
            .into_values()
            .flatten()
            .map(|f| (f.columns, f.keys.start(), f.master_storage_unit_id))
            .collect()
    };
    let first = view(0);
    assert!(!first.is_empty());
    for i in 1..managers.len() {
        assert_eq!(view(i), first);
        assert_eq!(
            managers[i].storage_unit_list().len(),
            managers[0].storage_unit_list().len()
        );
    }
}

#[test]
fn test_bootstrap_layout_tiles_space() {
    let managers = cluster(1, &config(2, 0));
    let manager = &managers[0];
    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
    let plan = InitialLayoutPlanner::new(0).plan_initial(
        &paths(&["root.b", "root.k", "root.t"]),
        KeyInterval::from_start(1_000),
        &engines,
        manager.id_generator(),
    );
    assert_eq!(
        manager.create_initial_fragments_and_storage_units(&plan),
        BootstrapOutcome::InitializedByMe
    );

    let fragments: Vec<_> = manager
        .fragments_by_columns(&ColumnsRange::unbounded(), None, false)
        .into_values()
        .flatten()
        .collect();
    assert!(check_initial_tiling(&fragments).is_ok());
    assert!(fragments.iter().any(|f| f.keys == KeyInterval::new(0, 1_000)));
}

#[test]
fn test_gapped_layout_rejected() {
    let managers = cluster(1, &config(1, 0));
    let manager = &managers[0];
    let mut plan = single_unit_plan(manager);
    plan.fragments[0].columns = ColumnsRange::new(Some("root.a"), None::<String>);

    assert_eq!(
        manager.create_initial_fragments_and_storage_units(&plan),
        BootstrapOutcome::Failed
    );
    assert!(!manager.has_fragment());
    assert!(!manager.has_storage_unit());
}

#[test]
fn test_overlapping_layout_rejected() {
    let managers = cluster(1, &config(1, 0));
    let manager = &managers[0];
    let mut plan = single_unit_plan(manager);
    let covering = |start: Option<&str>, end: Option<&str>| FragmentPlan {
        columns: ColumnsRange::new(start, end),
        keys: KeyInterval::full(),
        storage_unit: "u0".to_string(),
    };
    plan.fragments = vec![
        covering(None, Some("m")),
        covering(Some("m"), None),
        covering(None, Some("c")),
        covering(Some("c"), None),
    ];

    assert_eq!(
        manager.create_initial_fragments_and_storage_units(&plan),
        BootstrapOutcome::Failed
    );
    assert!(!manager.has_fragment());
    assert!(manager.fragments_by_column_and_keys("d", &KeyInterval::new(5, 6)).is_empty());
}

#[test]
fn test_hooks_fire_per_created_unit() {
    let managers = cluster(1, &config(2, 1));
    let manager = &managers[0];
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    manager.register_storage_unit_hook(Arc::new(
        move |before: Option<&StorageUnitMeta>, _: &StorageUnitMeta| {
            if before.is_none() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        },
    ));

    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
    let plan = InitialLayoutPlanner::new(1).plan_initial(&[], KeyInterval::full(), &engines, manager.id_generator());
    manager.create_initial_fragments_and_storage_units(&plan);

    // one master plus one replica
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(manager.storage_unit_list().len(), 2);
}

#[test]
fn test_split_routes_by_key() {
    let managers = cluster(1, &config(2, 0));
    let manager = &managers[0];
    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
    let plan = InitialLayoutPlanner::new(0).plan_initial(
        &paths(&["a", "z"]),
        KeyInterval::full(),
        &engines,
        manager.id_generator(),
    );
    manager.create_initial_fragments_and_storage_units(&plan);

    let old = manager.latest_fragment_by_column("b").unwrap();
    assert_eq!(old.columns, ColumnsRange::bounded("a", "z"));

    let unit = StorageUnitPlan {
        fake_id: "split".to_string(),
        storage_engine_id: engines[1],
        replicas: vec![],
    };
    let new_fragment = FragmentPlan {
        columns: ColumnsRange::bounded("a", "m"),
        keys: KeyInterval::from_start(100),
        storage_unit: "split".to_string(),
    };
    let ended = manager
        .split_fragment_and_storage_unit(&unit, &new_fragment, &old)
        .unwrap();
    assert_eq!(ended.keys, KeyInterval::new(0, 100));

    let at_150 = manager.fragments_by_column_and_keys("b", &KeyInterval::new(150, 151));
    assert_eq!(at_150.len(), 1);
    assert_eq!(at_150[0].columns, ColumnsRange::bounded("a", "m"));
    assert_eq!(at_150[0].keys.end(), KEY_MAX);
    assert_ne!(at_150[0].master_storage_unit_id, old.master_storage_unit_id);

    let at_50 = manager.fragments_by_column_and_keys("b", &KeyInterval::new(50, 51));
    assert_eq!(at_50.len(), 1);
    assert_eq!(at_50[0].columns, ColumnsRange::bounded("a", "z"));
    assert_eq!(at_50[0].keys, KeyInterval::new(0, 100));
}

#[test]
fn test_split_outside_fragment_rejected() {
    let managers = cluster(1, &config(1, 0));
    let manager = &managers[0];
    manager.create_initial_fragments_and_storage_units(&single_unit_plan(manager));
    let fragment = manager.latest_fragment_by_column("x").unwrap();

    let unit = StorageUnitPlan {
        fake_id: "split".to_string(),
        storage_engine_id: manager.storage_engines()[0].id,
        replicas: vec![],
    };
    let new_fragment = FragmentPlan {
        columns: ColumnsRange::unbounded(),
        keys: KeyInterval::from_start(0),
        storage_unit: "split".to_string(),
    };
    assert!(manager
        .split_fragment_and_storage_unit(&unit, &new_fragment, &fragment)
        .is_none());
    assert_eq!(manager.storage_unit_list().len(), 1);
}

#[test]
fn test_new_generation_closes_latest() {
    let managers = cluster(1, &config(2, 0));
    let manager = &managers[0];
    manager.create_initial_fragments_and_storage_units(&single_unit_plan(manager));

    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
    let generation = InitialLayoutPlanner::new(0).plan_generation(
        &paths(&["root.a", "root.z"]),
        5_000,
        &engines,
        manager.id_generator(),
    );
    assert!(manager.create_fragments_and_storage_units(&generation));

    let fragments = manager.fragments_by_column("root.c");
    assert_eq!(fragments.len(), 2);
    assert!(fragments.iter().any(|f| f.keys == KeyInterval::new(0, 5_000)));
    assert!(fragments.iter().any(|f| f.keys == KeyInterval::from_start(5_000)));
    for (_, latest) in manager.latest_fragment_map() {
        assert_eq!(latest.keys.start(), 5_000);
    }

    // an older generation cannot be appended behind the new one
    let stale = InitialLayoutPlanner::new(0).plan_generation(&[], 4_000, &engines, manager.id_generator());
    assert!(!manager.create_fragments_and_storage_units(&stale));
}

#[test]
fn test_routing_reads_evicted_fragments_from_store() {
    let mut config = config(1, 0);
    config.cache.enable_fragment_cache_control = true;
    config.cache.fragment_cache_threshold_kb = 1;
    let managers = cluster(1, &config);
    let manager = &managers[0];
    manager.create_initial_fragments_and_storage_units(&single_unit_plan(manager));

    let engines: Vec<_> = manager.storage_engines().iter().map(|e| e.id).collect();
    for i in 1..=40 {
        let generation =
            InitialLayoutPlanner::new(0).plan_generation(&[], i * 10, &engines, manager.id_generator());
        assert!(manager.create_fragments_and_storage_units(&generation));
    }

    let fragments = manager.fragments_by_column("x");
    assert_eq!(fragments.len(), 41);
    let starts: Vec<i64> = fragments.iter().take(3).map(|f| f.keys.start()).collect();
    assert_eq!(starts, vec![0, 10, 20]);
    assert!(fragments.iter().all(|f| f
        .master_storage_unit
        .as_ref()
        .is_some_and(|u| u.id == f.master_storage_unit_id)));

    let oldest = manager.fragments_by_column_and_keys("x", &KeyInterval::new(5, 6));
    assert_eq!(oldest.len(), 1);
    assert_eq!(oldest[0].keys, KeyInterval::new(0, 10));
    assert!(oldest[0].master_storage_unit.is_some());

    let by_columns: usize = manager
        .fragments_by_columns(&ColumnsRange::unbounded(), Some(&KeyInterval::new(0, 400)), false)
        .values()
        .map(Vec::len)
        .sum();
    assert_eq!(by_columns, 40);
}
