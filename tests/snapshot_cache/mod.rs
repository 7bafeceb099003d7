use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clusterbed::ClusterBuilder;
use clusterbed::SnapshotStore;
use futures::FutureExt;
use futures::TryFutureExt;

use crate::commons;

#[test]
fn racing_threads_build_a_snapshot_exactly_once() {
    crate::enable_logger();
    let cache = tempfile::tempdir().unwrap();
    let store = Arc::new(SnapshotStore::new(cache.path()));
    let builds = Arc::new(AtomicUsize::new(0));
    let tag = "storage=1 wal=1 auth=trust remote=local_fs";

    let mut workers = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let builds = Arc::clone(&builds);
        workers.push(std::thread::spawn(move || {
            let dir = store.snapshot_dir("raced");
            let locked = dir.lock().unwrap();
            if !locked.is_initialized(tag) {
                locked.clear().unwrap();
                std::fs::create_dir_all(locked.path()).unwrap();
                std::fs::write(locked.path().join("config"), "built").unwrap();
                builds.fetch_add(1, Ordering::SeqCst);
                locked.set_initialized(tag).unwrap();
            }
            // every thread sees a usable snapshot once it holds the lock
            assert!(locked.path().join("config").exists());
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn snapshot_is_built_once_and_cloned_for_later_builders() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 4);
    let store = SnapshotStore::new(ctx.snapshot_cache_dir());

    // first use: the constructor runs, then the clone is re-initialized,
    // so two `init` invocations land on the control binary
    let mut first = ClusterBuilder::new(&ctx, "snap_first");
    let cluster = first
        .build_and_use_snapshot(&store, "cached_base", |b: &mut ClusterBuilder| {
            b.init().map_ok(|_| ()).boxed()
        })
        .await
        .unwrap();
    let first_tenant = cluster.config.initial_tenant.clone();
    first.teardown(false).await.unwrap();
    assert_eq!(count_inits(&bin_dir), 2);

    // second use: no constructor run, just a clone
    let mut second = ClusterBuilder::new(&ctx, "snap_second");
    let cluster = second
        .build_and_use_snapshot(&store, "cached_base", |b: &mut ClusterBuilder| {
            b.init().map_ok(|_| ()).boxed()
        })
        .await
        .unwrap();
    assert_eq!(count_inits(&bin_dir), 3);
    // the clone carries the cached cluster's identifiers
    assert_eq!(cluster.config.initial_tenant, first_tenant);
    second.teardown(false).await.unwrap();
}

fn count_inits(bin_dir: &std::path::Path) -> usize {
    commons::invocations(bin_dir)
        .iter()
        .filter(|call| call.starts_with("init "))
        .count()
}
