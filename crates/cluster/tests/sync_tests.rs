mod common;

use common::{task, wait_until, TestHost};
use fleet_cluster::test_utils::{FaultyCoordination, MockCodeRunner};
use fleet_core::ClusterError;
use fleet_domain::{reasons, DiffKind, Different, FileInfo, Task, TaskStatus};
use fleet_infrastructure::{CoordinationService, MemoryTree};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_fresh_group_is_seeded_with_local_content() {
    let tree = MemoryTree::new();
    let host = TestHost::start(
        &tree,
        "10.0.0.1:9095",
        vec![task("billing", "Invoice", "v1"), task("billing", "Refund", "r1")],
    )
    .await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.write_file("billing", "/resources/conf/app.yml", "port: 1");
    host.write_file("billing", "/manifest.json", "{}");

    let diffs = host.engine.join_cluster("billing", true).await.unwrap();
    assert!(diffs.is_empty());

    let children = host.client.children("/fleet/group/billing").await.unwrap();
    assert_eq!(children, vec!["Invoice", "Refund", "file"]);

    let invoice: Task = host
        .client
        .read_json("/fleet/group/billing/Invoice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.code, "v1");

    let leaves = host.client.walk_leaves("/fleet/group/billing/file").await.unwrap();
    assert_eq!(
        leaves,
        vec![
            "/fleet/group/billing/file/lib/a.jar",
            "/fleet/group/billing/file/manifest.json",
            "/fleet/group/billing/file/resources/conf/app.yml",
        ]
    );

    let local = host
        .engine
        .local_files()
        .list_file_infos_by_group("billing")
        .unwrap();
    let root: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.hash, local.root.hash);

    let record = host.publisher.last_published("billing").await.unwrap();
    assert!(record.current);

    // 再次同步仍然一致
    assert!(host.engine.join_cluster("billing", false).await.unwrap().is_empty());
    host.close().await;
}

#[tokio::test]
async fn test_code_differs_is_the_only_reason() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();

    host.store.insert(task("billing", "Invoice", "v2"));
    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![Different::task("billing", "Invoice").with_reason(reasons::CODE_DIFFERS)]
    );

    let record = host.publisher.last_published("billing").await.unwrap();
    assert!(!record.current);
    assert_eq!(record.weight, 0);
    host.close().await;
}

#[tokio::test]
async fn test_description_only_difference() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();

    let mut cluster = task("billing", "Invoice", "v1");
    cluster.description = "monthly invoices".to_string();
    host.client
        .write_json("/fleet/group/billing/Invoice", &cluster)
        .await
        .unwrap();

    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].kind, DiffKind::Task);
    assert_eq!(diffs[0].reasons, vec![reasons::DESCRIPTION_DIFFERS.to_string()]);
    host.close().await;
}

#[tokio::test]
async fn test_tasks_missing_on_either_side() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();

    host.store.insert(task("billing", "Refund", "r1"));
    host.client
        .write_json("/fleet/group/billing/Ledger", &task("billing", "Ledger", "l1"))
        .await
        .unwrap();

    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![
            Different::task("billing", "Refund").with_reason(reasons::MISSING_IN_CLUSTER),
            Different::task("billing", "Ledger").with_reason(reasons::MISSING_LOCALLY),
        ]
    );
    host.close().await;
}

#[tokio::test]
async fn test_new_local_file_is_missing_in_cluster() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();
    let seeded_root: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();

    host.write_file("billing", "/lib/a.jar", "jar-a");
    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![Different::file("billing", "/lib/a.jar").with_reason(reasons::MISSING_IN_CLUSTER)]
    );

    let cluster_root: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster_root.hash, seeded_root.hash);
    host.close().await;
}

#[tokio::test]
async fn test_file_content_and_missing_locally() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![]).await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.write_file("billing", "/lib/b.jar", "jar-b");
    host.engine.join_cluster("billing", false).await.unwrap();

    host.write_file("billing", "/lib/a.jar", "jar-a-2");
    host.remove_file("billing", "/lib/b.jar");

    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![
            Different::file("billing", "/lib/a.jar").with_reason(reasons::CONTENT_DIFFERS),
            Different::file("billing", "/lib/b.jar").with_reason(reasons::MISSING_LOCALLY),
        ]
    );
    host.close().await;
}

#[tokio::test]
async fn test_root_hash_match_skips_file_comparison() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![]).await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.engine.join_cluster("billing", false).await.unwrap();

    // 单个文件记录与本机不一致，但根哈希仍然一致
    let mut tampered: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file/lib/a.jar")
        .await
        .unwrap()
        .unwrap();
    tampered.hash = "0000".to_string();
    host.client
        .write_json("/fleet/group/billing/file/lib/a.jar", &tampered)
        .await
        .unwrap();
    host.client
        .write_json("/fleet/group/billing/file/lib/stale.jar", &tampered)
        .await
        .unwrap();

    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert!(diffs.is_empty());

    // 根哈希不一致时才逐个比较
    let mut root: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();
    root.hash = "changed".to_string();
    host.client
        .write_json("/fleet/group/billing/file", &root)
        .await
        .unwrap();

    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![
            Different::file("billing", "/lib/a.jar").with_reason(reasons::CONTENT_DIFFERS),
            Different::file("billing", "/lib/stale.jar").with_reason(reasons::MISSING_LOCALLY),
        ]
    );
    host.close().await;
}

#[tokio::test]
async fn test_root_hash_refreshed_when_files_match() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![]).await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.engine.join_cluster("billing", false).await.unwrap();

    let mut root: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();
    let expected = root.hash.clone();
    root.hash = "outdated".to_string();
    host.client
        .write_json("/fleet/group/billing/file", &root)
        .await
        .unwrap();

    assert!(host.engine.join_cluster("billing", false).await.unwrap().is_empty());
    let refreshed: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.hash, expected);
    host.close().await;
}

#[tokio::test]
async fn test_unchanged_files_are_not_rehashed() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![]).await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.write_file("billing", "/resources/x.txt", "x");

    host.engine.join_cluster("billing", false).await.unwrap();
    let calls = host.hasher.calls();
    assert_eq!(calls, 2);

    host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(host.hasher.calls(), calls);
    host.close().await;
}

#[tokio::test]
async fn test_corrupt_cluster_record_counts_as_missing() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();

    host.client
        .write("/fleet/group/billing/Invoice", b"not json")
        .await
        .unwrap();
    let diffs = host.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(
        diffs,
        vec![Different::task("billing", "Invoice").with_reason(reasons::MISSING_IN_CLUSTER)]
    );
    host.close().await;
}

#[tokio::test]
async fn test_flush_does_not_republish_unchanged_status() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.write_file("billing", "/lib/a.jar", "jar-a");
    host.engine.join_cluster("billing", false).await.unwrap();

    let mut cluster = task("billing", "Invoice", "v1");
    cluster.status = TaskStatus::Inactive;
    host.client
        .write_json("/fleet/group/billing/Invoice", &cluster)
        .await
        .unwrap();

    let names = vec!["Invoice".to_string()];
    let files = host
        .engine
        .local_files()
        .list_file_infos_by_group("billing")
        .unwrap()
        .files;

    let first = host
        .engine
        .flush_host_group("billing", &names, &files)
        .await
        .unwrap();
    assert_eq!(
        first,
        vec![Different::task("billing", "Invoice").with_reason(reasons::STATUS_DIFFERS)]
    );
    let record_path = "/fleet/host_group/10.0.0.1:9095_billing";
    let published = host.client.read(record_path).await.unwrap();

    let mut events = host.client.subscribe();
    let second = host
        .engine
        .flush_host_group("billing", &names, &files)
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(host.client.read(record_path).await.unwrap(), published);
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.path, record_path, "unexpected {:?}", event.kind);
    }
    host.close().await;
}

#[tokio::test]
async fn test_flush_publishes_when_status_changes() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();
    assert!(host.publisher.last_published("billing").await.unwrap().current);

    host.store.insert(task("billing", "Invoice", "v2"));
    let names = vec!["Invoice".to_string()];
    let diffs = host.engine.flush_host_group("billing", &names, &[]).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert!(!host.publisher.last_published("billing").await.unwrap().current);

    let publisher = &host.publisher;
    wait_until(move || async move {
        publisher
            .get("10.0.0.1:9095", "billing")
            .await
            .is_some_and(|record| !record.current)
    })
    .await;
    host.close().await;
}

#[tokio::test]
async fn test_add_task_and_up_cluster() {
    let tree = MemoryTree::new();
    let host = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    host.engine.join_cluster("billing", false).await.unwrap();

    let updated = host.store.insert(task("billing", "Invoice", "v2"));
    host.engine.add_task(&updated).await.unwrap();
    let cluster: Task = host
        .client
        .read_json("/fleet/group/billing/Invoice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.code, "v2");
    assert!(host
        .engine
        .add_task(&task("billing", "file", "x"))
        .await
        .is_err());

    host.write_file("billing", "/lib/deep/a.jar", "jar-a");
    host.engine.up_cluster("billing", "/lib/deep/a.jar").await.unwrap();
    let pushed: FileInfo = host
        .client
        .read_json("/fleet/group/billing/file/lib/deep/a.jar")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.hash, fleet_cluster::sync::sha256_hex(b"jar-a"));

    host.remove_file("billing", "/lib/deep/a.jar");
    host.engine.up_cluster("billing", "/lib/deep/a.jar").await.unwrap();
    assert!(!host
        .client
        .exists("/fleet/group/billing/file/lib")
        .await
        .unwrap());
    assert!(host.client.exists("/fleet/group/billing/file").await.unwrap());
    host.close().await;
}

#[tokio::test]
async fn test_compile_failure_skips_only_that_task() {
    let tree = MemoryTree::new();
    let runner = fleet_cluster::test_utils::MockCodeRunner::new()
        .with_methods("Invoice", &["create", "cancel"])
        .failing("Refund");
    let host = TestHost::start_with_runner(
        &tree,
        "10.0.0.1:9095",
        vec![task("billing", "Invoice", "v1"), task("billing", "Refund", "r1")],
        runner,
    )
    .await;

    let diffs = host.engine.join_cluster("billing", true).await.unwrap();
    assert!(diffs.is_empty());
    assert_eq!(host.runner.compiled(), 2);

    let routing = &host.routing;
    wait_until(move || async move {
        routing.hosts_for("billing", "Invoice", "create").await.len() == 1
            && routing.hosts_for("billing", "Invoice", "cancel").await.len() == 1
    })
    .await;
    assert!(!host
        .client
        .exists("/fleet/mapping/billing/Refund")
        .await
        .unwrap());
    host.close().await;
}

#[tokio::test]
async fn test_second_host_with_same_content_is_current() {
    let tree = MemoryTree::new();
    let first = TestHost::start(&tree, "10.0.0.1:9095", vec![task("billing", "Invoice", "v1")]).await;
    let second = TestHost::start(&tree, "10.0.0.2:9095", vec![task("billing", "Invoice", "v1")]).await;
    for host in [&first, &second] {
        host.write_file("billing", "/lib/a.jar", "jar-a");
    }

    let (a, b) = tokio::join!(
        first.engine.join_cluster("billing", false),
        second.engine.join_cluster("billing", false)
    );
    assert!(a.unwrap().is_empty());
    assert!(b.unwrap().is_empty());

    let publisher = &first.publisher;
    wait_until(move || async move {
        publisher.get_current_host_ports("billing").await.len() == 2
    })
    .await;

    second.write_file("billing", "/lib/a.jar", "jar-a-2");
    let diffs = second.engine.join_cluster("billing", false).await.unwrap();
    assert_eq!(diffs.len(), 1);
    wait_until(move || async move {
        publisher.get_current_host_ports("billing").await == vec!["10.0.0.1:9095".to_string()]
    })
    .await;

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_join_cluster_all_covers_every_group() {
    let tree = MemoryTree::new();
    let host = TestHost::start(
        &tree,
        "10.0.0.1:9095",
        vec![task("billing", "Invoice", "v1"), task("shipping", "Label", "s1")],
    )
    .await;
    host.store.add_group("empty");

    let results = host.engine.join_cluster_all().await.unwrap();
    let mut groups: Vec<&String> = results.keys().collect();
    groups.sort();
    assert_eq!(groups, vec!["billing", "empty", "shipping"]);
    assert!(results.values().all(|diffs| diffs.is_empty()));
    host.close().await;
}

#[tokio::test]
async fn test_host_group_write_failure_still_registers_routes() {
    let tree = MemoryTree::new();
    let faulty = Arc::new(FaultyCoordination::new(Arc::new(tree.connect().await)));
    let host = TestHost::start_on(
        faulty.clone(),
        "10.0.0.1:9095",
        vec![task("billing", "Invoice", "v1")],
        MockCodeRunner::new(),
        Duration::from_secs(2),
    )
    .await;
    faulty.fail_under("/fleet/host_group/");

    let diffs = host.engine.join_cluster("billing", true).await.unwrap();
    assert!(diffs.is_empty());
    assert!(host.publisher.last_published("billing").await.is_none());
    assert!(!host
        .client
        .exists("/fleet/host_group/10.0.0.1:9095_billing")
        .await
        .unwrap());

    let routing = &host.routing;
    wait_until(move || async move {
        routing.hosts_for("billing", "Invoice", "run").await == vec!["10.0.0.1:9095".to_string()]
    })
    .await;

    // 恢复后下一次 flush 发布状态
    faulty.recover();
    host.engine
        .flush_host_group("billing", &["Invoice".to_string()], &[])
        .await
        .unwrap();
    assert!(host
        .client
        .exists("/fleet/host_group/10.0.0.1:9095_billing")
        .await
        .unwrap());
    host.close().await;
}

#[tokio::test]
async fn test_locked_group_is_skipped_without_publishing() {
    let tree = MemoryTree::new();
    let holder = tree.connect().await;
    let guard = holder
        .lock("/fleet/lock/billing", Duration::from_secs(1))
        .await
        .unwrap();

    let host = TestHost::start_on(
        Arc::new(tree.connect().await),
        "10.0.0.1:9095",
        vec![task("billing", "Invoice", "v1"), task("shipping", "Label", "s1")],
        MockCodeRunner::new(),
        Duration::from_millis(100),
    )
    .await;

    let err = host.engine.join_cluster("billing", true).await.unwrap_err();
    assert!(matches!(err, ClusterError::Lock { .. }));
    assert!(!host
        .client
        .exists("/fleet/host_group/10.0.0.1:9095_billing")
        .await
        .unwrap());
    assert!(!host.client.exists("/fleet/group/billing").await.unwrap());
    assert_eq!(host.runner.compiled(), 0);

    let results = host.engine.join_cluster_all().await.unwrap();
    assert!(!results.contains_key("billing"));
    assert_eq!(results.get("shipping").map(Vec::len), Some(0));
    assert!(host
        .client
        .exists("/fleet/host_group/10.0.0.1:9095_shipping")
        .await
        .unwrap());

    drop(guard);
    assert!(host.engine.join_cluster("billing", true).await.unwrap().is_empty());
    host.close().await;
    holder.close().await;
}
