use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 所有长时间运行的组件订阅同一个关闭广播，关闭之后才订阅的接收器会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (sender, receiver) = broadcast::channel(1);
            let _ = sender.send(());
            return receiver;
        }
        self.sender.subscribe()
    }

    /// 触发关闭，重复调用不做任何事
    pub fn shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已经发送过");
            return;
        }
        let receivers = self.sender.send(()).unwrap_or(0);
        info!("关闭信号已发送给 {} 个订阅者", receivers);
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// 在限定时间内等待收尾工作完成，返回是否按时完成
    pub async fn wait_with_timeout<F>(&self, work: F, limit: Duration) -> bool
    where
        F: Future,
    {
        match tokio::time::timeout(limit, work).await {
            Ok(_) => true,
            Err(_) => {
                warn!("等待关闭超时（{}秒）", limit.as_secs());
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
