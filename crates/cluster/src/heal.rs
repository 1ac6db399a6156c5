use fleet_core::ClusterResult;
use fleet_infrastructure::{CoordinationClient, NodeEventKind};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 临时节点自愈循环
///
/// 每轮只注册一个一次性监听；节点被删除后调用 `restore` 重建。
/// 监听通道关闭（会话结束）、会话丢失或调用 [`HealLoop::stop`] 时退出。
pub struct HealLoop {
    path: String,
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl HealLoop {
    pub fn spawn<F, Fut>(client: CoordinationClient, path: String, restore: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClusterResult<()>> + Send,
    {
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let watched = path.clone();

        let handle = tokio::spawn(async move {
            loop {
                let watch = match client.watch_node(&watched).await {
                    Ok(watch) => watch,
                    Err(e) => {
                        debug!("无法注册节点监听，退出自愈循环: {} - {}", watched, e);
                        break;
                    }
                };

                // 监听注册之前可能已被删除
                match client.exists(&watched).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Err(e) = restore().await {
                            warn!("重建节点失败: {} - {}", watched, e);
                        }
                    }
                    Err(e) if e.is_session_loss() => break,
                    Err(e) => warn!("检查节点失败: {} - {}", watched, e),
                }

                tokio::select! {
                    _ = stop_signal.notified() => {
                        debug!("自愈循环停止: {}", watched);
                        break;
                    }
                    fired = watch => match fired {
                        Ok(event) if event.kind == NodeEventKind::Deleted => {
                            info!("节点被删除，重新注册: {}", watched);
                            if let Err(e) = restore().await {
                                warn!("重建节点失败: {} - {}", watched, e);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => {
                            debug!("监听通道已关闭，退出自愈循环: {}", watched);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            path,
            stop,
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// 停止循环并等待退出
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HealLoop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
