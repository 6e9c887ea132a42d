use crate::{
    progress::ProgressUpdate,
    types::{DownloadRequest, DownloadTask, TaskStatus},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 任务的终结结果
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed,
    Failed(String),
}

struct Entry {
    /// 插入序号，用于保持创建顺序
    seq: u64,
    task: DownloadTask,
}

#[derive(Default)]
struct Tasks {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// 任务注册表
///
/// 独占所有任务记录，对外只返回快照。每次修改只在写锁内完成一次字段设置，
/// 不会在持锁期间做任何 I/O。
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<Tasks>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个等待中的任务，返回新的任务 ID
    pub async fn create(&self, request: DownloadRequest) -> String {
        let task_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let task = DownloadTask {
            id: task_id.clone(),
            request,
            status: TaskStatus::Pending,
            progress: 0.0,
            speed: None,
            eta: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut tasks = self.tasks.write().await;
        let seq = tasks.next_seq;
        tasks.next_seq += 1;
        tasks.entries.insert(task_id.clone(), Entry { seq, task });

        task_id
    }

    /// 获取单个任务
    pub async fn get(&self, task_id: &str) -> Option<DownloadTask> {
        let tasks = self.tasks.read().await;
        tasks.entries.get(task_id).map(|e| e.task.clone())
    }

    /// 获取所有任务，按创建顺序排列
    pub async fn list(&self) -> Vec<DownloadTask> {
        let tasks = self.tasks.read().await;
        let mut entries: Vec<&Entry> = tasks.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks.entries.get(task_id).map(|e| e.task.status)
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().await.entries.contains_key(task_id)
    }

    /// 统计处于某个状态的任务数
    pub async fn count(&self, status: TaskStatus) -> usize {
        let tasks = self.tasks.read().await;
        tasks
            .entries
            .values()
            .filter(|e| e.task.status == status)
            .count()
    }

    /// 移除任务，不存在时什么都不做
    pub async fn remove(&self, task_id: &str) -> bool {
        self.tasks.write().await.entries.remove(task_id).is_some()
    }

    /// 修改任务的可变字段
    ///
    /// `mutation` 返回 `Some` 表示修改已生效，此时刷新 `updated_at`；
    /// 任务不存在或 `mutation` 返回 `None` 时结果为 `None`。
    pub(crate) async fn update<F, R>(&self, task_id: &str, mutation: F) -> Option<R>
    where
        F: FnOnce(&mut DownloadTask) -> Option<R>,
    {
        let mut tasks = self.tasks.write().await;
        let task = &mut tasks.entries.get_mut(task_id)?.task;
        let applied = mutation(task)?;
        task.updated_at = Utc::now();
        Some(applied)
    }

    /// pending -> downloading，任务已不处于等待状态时返回 false
    pub(crate) async fn start(&self, task_id: &str) -> bool {
        self.update(task_id, |task| {
            (task.status == TaskStatus::Pending).then(|| task.status = TaskStatus::Downloading)
        })
        .await
        .is_some()
    }

    /// 应用解析出的进度，仅对下载中的任务生效
    ///
    /// 进度只增不减。返回更新后的任务快照。
    pub(crate) async fn apply_progress(
        &self,
        task_id: &str,
        update: &ProgressUpdate,
    ) -> Option<DownloadTask> {
        if update.is_empty() {
            return None;
        }

        self.update(task_id, |task| {
            if task.status != TaskStatus::Downloading {
                return None;
            }
            if let Some(percent) = update.percent {
                task.progress = task.progress.max(percent);
            }
            if let Some(speed) = &update.speed {
                task.speed = Some(speed.clone());
            }
            if let Some(eta) = &update.eta {
                task.eta = Some(eta.clone());
            }
            Some(task.clone())
        })
        .await
    }

    /// 将任务置为终态
    ///
    /// 只有第一个调用者生效：任务已是终态或不存在时返回 false。
    pub(crate) async fn finalize(&self, task_id: &str, outcome: Outcome) -> bool {
        self.update(task_id, |task| {
            if task.status.is_terminal() {
                return None;
            }
            match outcome {
                Outcome::Completed => {
                    task.status = TaskStatus::Completed;
                    task.progress = 100.0;
                    task.error = None;
                }
                Outcome::Failed(error) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(if error.trim().is_empty() {
                        "unknown error".to_string()
                    } else {
                        error
                    });
                }
            }
            Some(())
        })
        .await
        .is_some()
    }

    /// 移除所有在 `cutoff` 之前最后更新的终态任务，返回被移除的任务 ID
    pub async fn reclaim_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut tasks = self.tasks.write().await;
        let expired: Vec<String> = tasks
            .entries
            .values()
            .filter(|e| e.task.status.is_terminal() && e.task.updated_at < cutoff)
            .map(|e| e.task.id.clone())
            .collect();

        for task_id in &expired {
            tasks.entries.remove(task_id);
        }
        expired
    }
}
