use super::*;
use crate::worker::WorkerSettings;

fn test_context(output_root: &Path) -> WorkerContext {
    let settings = WorkerSettings {
        output_root: output_root.to_path_buf(),
        ..Default::default()
    };
    WorkerContext::new(settings)
}

#[tokio::test]
async fn start_requires_init_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    let mut builder = ClusterBuilder::new(&ctx, "start_without_init");

    assert!(builder.cluster().is_err());
    assert!(builder.start().await.is_err());
}

#[test]
fn scrub_needs_an_object_store_backend() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());

    let local = ClusterBuilder::new(&ctx, "scrub_local");
    assert!(local.enable_scrub_on_exit().is_err());

    let mock = ClusterBuilder::new(&ctx, "scrub_mock")
        .enable_storage_remote_storage(RemoteStorageKind::MockS3);
    assert!(mock.enable_scrub_on_exit().is_ok());
}

#[tokio::test]
async fn teardown_is_idempotent_without_a_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    let mut builder = ClusterBuilder::new(&ctx, "teardown_twice");

    builder.teardown(false).await.unwrap();
    builder.teardown(false).await.unwrap();
}

#[test]
fn local_cleanup_keeps_config_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cluster");
    let node_dir = root.join("storage_1");
    std::fs::create_dir_all(&node_dir).unwrap();
    std::fs::write(root.join("config"), "[broker]\nhttp_port = 1\n").unwrap();
    std::fs::write(node_dir.join("storage.log"), "started\n").unwrap();
    std::fs::write(node_dir.join("data.layer"), vec![0u8; 4096]).unwrap();

    cleanup_local_storage(&root).unwrap();

    assert!(root.join("config").exists());
    assert!(node_dir.join("storage.log").exists());
    assert!(!node_dir.join("data.layer").exists());
}

#[test]
fn directory_copy_preserves_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("nested")).unwrap();
    std::fs::write(src.join("config"), "top").unwrap();
    std::fs::write(src.join("nested/file"), "deep").unwrap();

    let dst = dir.path().join("dst");
    copy_dir_all(&src, &dst).unwrap();

    assert_eq!(std::fs::read_to_string(dst.join("config")).unwrap(), "top");
    assert_eq!(std::fs::read_to_string(dst.join("nested/file")).unwrap(), "deep");
}

#[test]
fn cluster_file_config_round_trips_through_toml() {
    let file_config = ClusterFileConfig {
        default_branch_name: "main".to_owned(),
        initial_tenant: TenantId::generate(),
        initial_timeline: TimelineId::generate(),
        auth: "trust".to_owned(),
        wal_fsync: false,
        broker: BrokerFileConfig { http_port: 15003 },
        coordinator: CoordinatorFileConfig {
            http_port: 15001,
            db_port: 15002,
        },
        storage_nodes: vec![StorageNodeFileConfig {
            id: 1,
            data_port: 15004,
            http_port: 15005,
            remote_storage: Some("{ local_path = \"/tmp/mirror\" }".to_owned()),
        }],
        wal_nodes: vec![WalNodeFileConfig {
            id: 1,
            data_port: 15006,
            http_port: 15007,
            remote_storage: None,
        }],
    };

    let rendered = toml::to_string_pretty(&file_config).unwrap();
    let parsed: ClusterFileConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.initial_tenant, file_config.initial_tenant);
    assert_eq!(parsed.storage_nodes.len(), 1);
    assert_eq!(
        parsed.storage_nodes[0].remote_storage,
        file_config.storage_nodes[0].remote_storage
    );
    assert_eq!(parsed.wal_nodes[0].remote_storage, None);
}
