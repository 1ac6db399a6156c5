use fleet_core::ClusterResult;
use fleet_domain::MasterJob;
use fleet_infrastructure::{CoordinationClient, LeaderLatch};
use metrics::gauge;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 本机是否为主节点
///
/// 由选举控制器写入，需要判断主节点身份的组件持有它的克隆。
#[derive(Debug, Clone, Default)]
pub struct MasterState {
    flag: Arc<AtomicBool>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_master(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 返回之前的值
    fn swap(&self, master: bool) -> bool {
        self.flag.swap(master, Ordering::SeqCst)
    }
}

struct Participation {
    latch: Arc<dyn LeaderLatch>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// 主节点选举控制器
///
/// 成为领导者时置位 [`MasterState`] 并启动主节点作业，失去领导权时复位并停止作业。
/// 每次状态切换作业钩子只调用一次。
pub struct LeaderElectionController {
    client: CoordinationClient,
    path: String,
    identity: String,
    master: MasterState,
    job: Arc<dyn MasterJob>,
    participation: Mutex<Option<Participation>>,
}

impl LeaderElectionController {
    pub fn new(
        client: CoordinationClient,
        path: impl Into<String>,
        identity: impl Into<String>,
        master: MasterState,
        job: Arc<dyn MasterJob>,
    ) -> Self {
        Self {
            client,
            path: path.into(),
            identity: identity.into(),
            master,
            job,
            participation: Mutex::new(None),
        }
    }

    pub fn master_state(&self) -> &MasterState {
        &self.master
    }

    pub fn is_master(&self) -> bool {
        self.master.is_master()
    }

    /// 加入选举，已在参与时不做任何事
    pub async fn start(&self) -> ClusterResult<()> {
        let mut participation = self.participation.lock().await;
        if participation.is_some() {
            debug!("已在参与主节点选举: {}", self.identity);
            return Ok(());
        }

        let latch = self.client.leader_latch(&self.path, &self.identity);
        let mut leadership = latch.subscribe();
        latch.start().await?;

        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let master = self.master.clone();
        let job = Arc::clone(&self.job);
        let identity = self.identity.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let leader = *leadership.borrow_and_update();
                        Self::transition(&master, job.as_ref(), &identity, leader).await;
                    }
                }
            }
        });

        *participation = Some(Participation {
            latch,
            stop,
            handle,
        });
        info!("加入主节点选举: {} -> {}", self.identity, self.path);
        Ok(())
    }

    /// 退出选举；当前为领导者时让出领导权并停止主节点作业
    pub async fn stop(&self) -> ClusterResult<()> {
        let Some(participation) = self.participation.lock().await.take() else {
            return Ok(());
        };

        let closed = participation.latch.close().await;
        participation.stop.notify_one();
        let _ = participation.handle.await;
        Self::transition(&self.master, self.job.as_ref(), &self.identity, false).await;
        info!("退出主节点选举: {}", self.identity);
        closed
    }

    /// 重新参与选举
    pub async fn reset_master(&self) -> ClusterResult<()> {
        info!("重置主节点选举: {}", self.identity);
        self.stop().await?;
        self.start().await
    }

    async fn transition(master: &MasterState, job: &dyn MasterJob, identity: &str, leader: bool) {
        if master.swap(leader) == leader {
            return;
        }
        gauge!("fleet_master").set(if leader { 1.0 } else { 0.0 });
        if leader {
            info!("成为主节点: {}", identity);
            job.start().await;
        } else {
            info!("不再是主节点: {}", identity);
            job.stop().await;
        }
    }
}

impl Drop for LeaderElectionController {
    fn drop(&mut self) {
        if let Some(participation) = self.participation.get_mut().take() {
            participation.handle.abort();
        }
    }
}
