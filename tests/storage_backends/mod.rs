use std::os::unix::fs::PermissionsExt;

use clusterbed::ClusterBuilder;
use clusterbed::RemoteStorage;
use clusterbed::RemoteStorageKind;
use clusterbed::RemoteStorageUser;
use clusterbed::TenantId;
use clusterbed::TimelineId;

use crate::commons;

#[tokio::test]
async fn local_fs_round_trips_layer_bytes() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let remote = RemoteStorageKind::LocalFs
        .configure(
            dir.path(),
            None,
            "run",
            "storage_backends_round_trip",
            RemoteStorageUser::Storage,
            None,
        )
        .await
        .unwrap();
    let RemoteStorage::LocalFs(local) = &remote else {
        panic!("expected a local_fs backend");
    };

    let tenant = TenantId::generate();
    let timeline = TimelineId::generate();
    let layer_path = local.timeline_path(&tenant, &timeline).join("000001-000002");
    std::fs::create_dir_all(layer_path.parent().unwrap()).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
    std::fs::write(&layer_path, &payload).unwrap();

    assert_eq!(local.list_layers(&tenant, &timeline).unwrap(), vec!["000001-000002"]);
    assert_eq!(std::fs::read(&layer_path).unwrap(), payload);

    // local_fs cleanup is a no-op; directory-tree cleanup owns deletion
    remote.cleanup().await.unwrap();
    assert!(layer_path.exists());
}

#[tokio::test]
async fn local_fs_inline_table_points_into_the_cluster_root() {
    let dir = tempfile::tempdir().unwrap();
    let remote = RemoteStorageKind::LocalFs
        .configure(
            dir.path(),
            None,
            "run",
            "storage_backends_inline",
            RemoteStorageUser::Wal,
            None,
        )
        .await
        .unwrap();

    let table = remote.to_toml_inline_table();
    assert!(table.starts_with("{ local_path = \""));
    assert!(table.contains("local_fs_remote_storage/wal"));
}

#[tokio::test]
async fn real_s3_without_credentials_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let vars: Vec<(&str, Option<&str>)> = vec![
        ("REMOTE_STORAGE_S3_BUCKET", Some("test-bucket")),
        ("REMOTE_STORAGE_S3_REGION", Some("eu-central-1")),
        ("AWS_PROFILE", None),
        ("AWS_ACCESS_KEY_ID", None),
        ("AWS_SECRET_ACCESS_KEY", None),
    ];
    let result = temp_env::async_with_vars(vars, async {
        RemoteStorageKind::RealS3
            .configure(
                dir.path(),
                None,
                "run",
                "storage_backends_no_creds",
                RemoteStorageUser::Storage,
                None,
            )
            .await
    })
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn mock_bucket_cleanup_is_opt_in_through_the_builder() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    // stand-in mock object-store launcher; the stub endpoints below answer
    // the actual requests
    let mock_cmd = bin_dir.join("mock-store");
    std::fs::write(&mock_cmd, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(&mock_cmd, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut ctx = commons::test_context(dir.path(), &bin_dir, 7);
    ctx.settings.mock_s3_command = Some(mock_cmd.display().to_string());

    // the mock store port is the first allocation a builder makes; the
    // second builder's comes after the first one's seven node ports
    let base = ctx.ports.range().base;
    let stores = vec![
        commons::serve_http_ok(base).await,
        commons::serve_http_ok(base + 8).await,
    ];

    let mut kept = ClusterBuilder::new(&ctx, "storage_backends_mock_kept")
        .enable_storage_remote_storage(RemoteStorageKind::MockS3);
    kept.init().await.unwrap();
    assert!(!kept.storage_remote().unwrap().as_s3().unwrap().cleanup);

    let mut cleaned = ClusterBuilder::new(&ctx, "storage_backends_mock_cleaned")
        .enable_storage_remote_storage(RemoteStorageKind::MockS3)
        .cleanup_mock_buckets();
    cleaned.init().await.unwrap();
    assert!(cleaned.storage_remote().unwrap().as_s3().unwrap().cleanup);

    for store in stores {
        store.abort();
    }
}

#[tokio::test]
async fn mock_s3_without_a_server_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = RemoteStorageKind::MockS3
        .configure(
            dir.path(),
            None,
            "run",
            "storage_backends_no_server",
            RemoteStorageUser::Storage,
            None,
        )
        .await;
    assert!(result.is_err());
}
