use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};

/// 任务执行成功/失败计数，按任务ID懒创建，只在进程内有效
#[derive(Debug, Default)]
pub struct TaskCounters {
    success: DashMap<i64, AtomicU64>,
    error: DashMap<i64, AtomicU64>,
}

impl TaskCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, task_id: i64, success: bool) {
        let counts = if success { &self.success } else { &self.error };
        counts
            .entry(task_id)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        if success {
            counter!("fleet_task_success_total").increment(1);
        } else {
            counter!("fleet_task_error_total").increment(1);
        }
    }

    pub fn get_success_count(&self, task_id: i64) -> u64 {
        Self::read(&self.success, task_id)
    }

    pub fn get_error_count(&self, task_id: i64) -> u64 {
        Self::read(&self.error, task_id)
    }

    fn read(counts: &DashMap<i64, AtomicU64>, task_id: i64) -> u64 {
        counts
            .get(&task_id)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
