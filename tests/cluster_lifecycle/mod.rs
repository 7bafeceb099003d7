use clusterbed::Cluster;
use clusterbed::ClusterBuilder;
use clusterbed::TenantId;
use clusterbed::TimelineId;

use crate::commons;

/// Every node HTTP port of the cluster, for spinning up stub endpoints.
fn http_ports(cluster: &Cluster) -> Vec<u16> {
    let mut ports = vec![
        cluster.coordinator.desc.ports.http,
        cluster.broker.desc.ports.http,
    ];
    ports.extend(cluster.storage_nodes.iter().map(|n| n.desc.ports.http));
    ports.extend(cluster.wal_nodes.iter().map(|n| n.desc.ports.http));
    ports
}

#[tokio::test]
async fn init_start_stop_round_trip() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 0);

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_round_trip");
    builder.init().await.unwrap();

    let ports = {
        let cluster = builder.cluster().unwrap();
        assert!(cluster.root().join("config").exists());
        assert_eq!(cluster.storage_nodes.len(), 1);
        assert_eq!(cluster.wal_nodes.len(), 1);
        http_ports(cluster)
    };
    let mut responders = Vec::new();
    for port in ports {
        responders.push(commons::serve_http_ok(port).await);
    }

    builder.start().await.unwrap();
    {
        let cluster = builder.cluster().unwrap();
        assert!(cluster.coordinator.running());
        assert!(cluster.broker.running());
        assert!(cluster.the_storage_node().unwrap().running());
        assert!(cluster.the_wal_node().unwrap().running());
        assert!(!cluster.wal_connstrs().is_empty());
    }

    builder.stop(true).await.unwrap();
    assert!(!builder.cluster().unwrap().coordinator.running());

    builder.teardown(false).await.unwrap();
    for responder in responders {
        responder.abort();
    }

    let calls = commons::invocations(&bin_dir);
    assert!(calls.iter().any(|c| c.starts_with("init --config")));
    assert!(calls.iter().any(|c| c == "coordinator start"));
    assert!(calls.iter().any(|c| c.starts_with("storage start --id 1")));
    assert!(calls.iter().any(|c| c == "wal start --id 1"));
    assert!(calls.iter().any(|c| c == "storage stop -m immediate --id 1"));
}

#[tokio::test]
async fn init_start_creates_the_initial_tenant() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 1);

    // init_start allocates ports and immediately waits for readiness, so the
    // stub endpoints are bound up front on the worker's (deterministic)
    // first few ports.
    let base = ctx.ports.range().base;
    let mut responders = Vec::new();
    for port in base..base + 12 {
        responders.push(commons::serve_http_ok(port).await);
    }

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_init_start");
    let cluster = builder.init_start().await.unwrap();
    let tenant = cluster.config.initial_tenant.clone();
    assert!(cluster.coordinator.running());

    // a builder is single-use
    assert!(builder.init().await.is_err());

    builder.teardown(false).await.unwrap();
    for responder in responders {
        responder.abort();
    }

    let calls = commons::invocations(&bin_dir);
    assert!(calls
        .iter()
        .any(|c| c.starts_with(&format!("tenant create --tenant-id {tenant}"))));
}

#[tokio::test]
async fn teardown_runs_every_phase_and_reports_the_first_error() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_FAILING_STOP);
    let ctx = commons::test_context(dir.path(), &bin_dir, 2);

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_teardown_errors");
    builder.init().await.unwrap();
    let (ports, data_marker) = {
        let cluster = builder.cluster().unwrap();
        let marker = cluster.root().join("storage_1").join("data.layer");
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, vec![0u8; 1024]).unwrap();
        (http_ports(cluster), marker)
    };
    let mut responders = Vec::new();
    for port in ports {
        responders.push(commons::serve_http_ok(port).await);
    }
    builder.start().await.unwrap();

    // every stop fails, yet teardown must push through all phases
    let result = builder.teardown(false).await;
    assert!(result.is_err());
    // later phases still ran: bulky local files were pruned
    assert!(!data_marker.exists());

    // and teardown stays idempotent after a failed pass
    builder.teardown(false).await.unwrap();
    for responder in responders {
        responder.abort();
    }
}

#[tokio::test(start_paused = true)]
async fn nodes_that_fail_readiness_still_get_stopped_at_teardown() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 5);

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_half_started");
    builder.init().await.unwrap();
    let (ports, storage_http) = {
        let cluster = builder.cluster().unwrap();
        let storage_http = cluster.the_storage_node().unwrap().desc.ports.http;
        (http_ports(cluster), storage_http)
    };
    // every node answers except the storage node, whose process was spawned
    // but never comes up
    let mut responders = Vec::new();
    for port in ports {
        if port != storage_http {
            responders.push(commons::serve_http_ok(port).await);
        }
    }

    assert!(builder.start().await.is_err());
    assert!(builder.cluster().unwrap().the_storage_node().unwrap().running());

    let _ = builder.teardown(false).await;
    for responder in responders {
        responder.abort();
    }

    // the spawned-but-unready node still got its stop
    let calls = commons::invocations(&bin_dir);
    assert!(calls.iter().any(|c| c == "storage stop -m immediate --id 1"));
    assert!(calls.iter().any(|c| c == "wal stop -m immediate --id 1"));
    assert!(calls.iter().any(|c| c == "coordinator stop -m immediate"));
}

#[tokio::test]
async fn timelines_are_created_through_the_control_cli() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 6);

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_timelines");
    builder.init().await.unwrap();

    let tenant = TenantId::generate();
    let timeline = TimelineId::generate();
    {
        let cli = builder.cluster().unwrap().cli();
        cli.timeline_create(&tenant, &timeline).await.unwrap();
        cli.timeline_branch(&tenant, "feature", Some("main"))
            .await
            .unwrap();
    }
    builder.teardown(false).await.unwrap();

    let calls = commons::invocations(&bin_dir);
    assert!(calls.iter().any(|c| {
        c == &format!("timeline create --tenant-id {tenant} --timeline-id {timeline}")
    }));
    assert!(calls.iter().any(|c| {
        c == &format!(
            "timeline branch --tenant-id {tenant} --branch-name feature --ancestor-branch-name main"
        )
    }));
}

#[tokio::test]
async fn compute_endpoints_are_created_and_stopped_with_the_cluster() {
    crate::enable_logger();
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    commons::write_fake_storctl(&bin_dir, commons::STORCTL_OK);
    let ctx = commons::test_context(dir.path(), &bin_dir, 3);

    let mut builder = ClusterBuilder::new(&ctx, "lifecycle_compute");
    builder.init().await.unwrap();
    let ports = http_ports(builder.cluster().unwrap());
    let mut responders = Vec::new();
    for port in ports {
        responders.push(commons::serve_http_ok(port).await);
    }
    builder.start().await.unwrap();

    let compute = {
        let cluster = builder.cluster().unwrap();
        let tenant = cluster.config.initial_tenant.clone();
        let compute = cluster
            .create_compute(&ctx.ports, "main", &tenant, "main")
            .await
            .unwrap();
        compute.start().await.unwrap();
        assert!(compute.running());
        compute
    };

    builder.teardown(false).await.unwrap();
    assert!(!compute.running());
    for responder in responders {
        responder.abort();
    }

    let calls = commons::invocations(&bin_dir);
    assert!(calls.iter().any(|c| c.starts_with("compute create main")));
    assert!(calls.iter().any(|c| c == "compute start main"));
    assert!(calls.iter().any(|c| c == "compute stop -m immediate main"));
}
