use std::sync::Arc;
use std::time::Duration;

use fleet::app::Application;
use fleet::runtime::{EntryPointRunner, LoggingMasterJob};
use fleet::shutdown::ShutdownManager;
use fleet_cluster::test_utils::{wait_until, MockTaskStore};
use fleet_core::AppConfig;
use fleet_domain::{Group, Task, TaskStore};
use fleet_infrastructure::{CoordinationClient, MemoryConnector, MemoryTree};

fn config(root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.groups.root_dir = root.to_path_buf();
    config.groups.sync_interval_seconds = 0;
    config.coordination.reconnect_interval_seconds = 0;
    config
}

#[tokio::test]
async fn test_application_joins_and_leaves_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let tree = MemoryTree::new();
    let store = MockTaskStore::with_tasks(vec![Task::new("billing", "Invoice", "fn run() {}")]);
    let app = Arc::new(Application::with_parts(
        config(dir.path()),
        Arc::new(MemoryConnector::new(Arc::clone(&tree))),
        Arc::new(store),
        Arc::new(EntryPointRunner::default()),
        Arc::new(LoggingMasterJob),
    ));

    let shutdown = ShutdownManager::new();
    let handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let observer = CoordinationClient::new(Arc::new(tree.connect().await), Duration::from_secs(1));
    let view = &observer;
    wait_until(move || async move {
        view.exists("/fleet/host_group/127.0.0.1:9095_billing")
            .await
            .unwrap_or(false)
    })
    .await;
    assert!(observer
        .exists("/fleet/mapping/billing/Invoice/run/127.0.0.1:9095")
        .await
        .unwrap());
    let space = app.space();
    wait_until(move || async move { space.is_master() }).await;

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(observer.children("/fleet/host").await.unwrap().is_empty());
    assert!(!app.space().is_master());
    // 分组记录是持久节点，退出后仍然保留
    assert!(observer.exists("/fleet/group/billing/Invoice").await.unwrap());
}

#[tokio::test]
async fn test_application_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.store.url = "sqlite::memory:".to_string();
    config.store.max_connections = 1;

    let app = Application::new(config).await.unwrap();
    let saved = app
        .store()
        .save_task(&Task::new("shipping", "Label", "fn run() {}"))
        .await
        .unwrap();
    assert!(saved.id > 0);

    app.store()
        .save_group(&Group::new("shipping"))
        .await
        .unwrap();
    let groups: Vec<String> = app
        .store()
        .list_groups()
        .await
        .unwrap()
        .into_iter()
        .map(|group| group.name)
        .collect();
    assert_eq!(groups, vec!["shipping".to_string()]);
}

#[tokio::test]
async fn test_store_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    let db = dir.path().join("data").join("fleet.db");
    config.store.url = format!("sqlite:{}", db.display());

    let app = Application::new(config).await.unwrap();
    assert!(app.store().list_groups().await.unwrap().is_empty());
    assert!(db.exists());
}
