use crate::{
    config::OrchestratorConfig,
    error::{OrchestratorError, Result},
    info::fetch_video_info,
    registry::{Outcome, TaskRegistry},
    supervisor::{ProcessSupervisor, emit},
    types::{DownloadRequest, DownloadTask, TaskEvent, TaskStatus, VideoInfo},
};
use chrono::{TimeDelta, Utc};
use fs_err::tokio as fs;
use std::sync::Arc;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// 下载任务编排器
///
/// 组合任务注册表与子进程管理器，对外提供提交、查询、取消、列出和回收操作。
/// 超出并发上限的任务保持等待状态，按提交顺序依次启动。
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    registry: Arc<TaskRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    queue_tx: mpsc::UnboundedSender<String>,
    event_tx: mpsc::Sender<TaskEvent>,
}

impl Orchestrator {
    /// 创建编排器
    ///
    /// 会在当前 Tokio 运行时中启动调度任务，因此必须在运行时内调用。
    ///
    /// # 返回
    /// 返回编排器实例和事件接收器
    pub fn new(config: OrchestratorConfig) -> Result<(Self, mpsc::Receiver<TaskEvent>)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
        let config = Arc::new(config);
        let registry = Arc::new(TaskRegistry::new());
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            event_tx.clone(),
        ));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_concurrent_downloads));
        tokio::spawn(dispatch(
            queue_rx,
            slots,
            Arc::clone(&registry),
            Arc::clone(&supervisor),
        ));

        let orchestrator = Self {
            config,
            registry,
            supervisor,
            queue_tx,
            event_tx,
        };
        Ok((orchestrator, event_rx))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 提交下载任务
    ///
    /// 校验请求并确保输出目录存在后立即返回任务 ID，不等待下载开始。
    pub async fn submit_download(&self, request: DownloadRequest) -> Result<String> {
        request.validate()?;

        if let Some(max) = self.config.max_pending_tasks {
            let pending = self.registry.count(TaskStatus::Pending).await;
            if pending >= max {
                return Err(OrchestratorError::QueueFull { pending, max });
            }
        }

        fs::create_dir_all(&request.output_path).await?;

        let url = request.url.clone();
        let task_id = self.registry.create(request).await;
        info!(task_id = %task_id, %url, "Download task submitted");
        emit(
            &self.event_tx,
            TaskEvent::Added {
                task_id: task_id.clone(),
            },
        );

        if self.queue_tx.send(task_id.clone()).is_err() {
            error!(task_id = %task_id, "Download scheduler is not running");
            self.registry
                .finalize(
                    &task_id,
                    Outcome::Failed("download scheduler is not running".to_string()),
                )
                .await;
        }

        Ok(task_id)
    }

    /// 获取任务快照
    pub async fn query_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.registry.get(task_id).await
    }

    /// 取消任务，任务不存在时返回 false
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.supervisor.cancel(task_id).await
    }

    /// 获取所有任务，按提交顺序排列
    pub async fn list_tasks(&self) -> Vec<DownloadTask> {
        self.registry.list().await
    }

    /// 获取视频信息（不下载）
    pub async fn fetch_info(&self, url: &str) -> Result<VideoInfo> {
        url::Url::parse(url)
            .map_err(|e| OrchestratorError::InvalidRequest(format!("invalid url: {e}")))?;
        fetch_video_info(&self.config, url).await
    }

    /// 回收超过保留时间的终态任务，返回被回收的任务 ID
    pub async fn reclaim_expired(&self) -> Vec<String> {
        let Some(cutoff) = TimeDelta::from_std(self.config.task_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Vec::new();
        };

        let reclaimed = self.registry.reclaim_before(cutoff).await;
        for task_id in &reclaimed {
            info!(task_id = %task_id, "Reclaimed expired task");
            emit(
                &self.event_tx,
                TaskEvent::Reclaimed {
                    task_id: task_id.clone(),
                },
            );
        }
        reclaimed
    }

    /// 按 `cleanup_interval` 周期性回收过期任务
    ///
    /// 编排器被释放后循环自动结束。
    pub fn spawn_reclaimer(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let period = self.config.cleanup_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                let reclaimed = orchestrator.reclaim_expired().await;
                debug!(count = reclaimed.len(), "Reclamation sweep finished");
            }
        })
    }

    /// 正在下载的任务数
    pub async fn active_count(&self) -> usize {
        self.registry.count(TaskStatus::Downloading).await
    }

    /// 等待中的任务数
    pub async fn pending_count(&self) -> usize {
        self.registry.count(TaskStatus::Pending).await
    }

    /// 存活的子进程数
    pub async fn process_count(&self) -> usize {
        self.supervisor.process_count().await
    }

    /// 取消所有未终结的任务
    pub async fn shutdown(&self) {
        let unfinished: Vec<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|task| !task.status.is_terminal())
            .map(|task| task.id)
            .collect();

        for task_id in unfinished {
            self.supervisor.cancel(&task_id).await;
        }
    }
}

/// 调度循环：按提交顺序为等待中的任务获取并发名额并启动
async fn dispatch(
    mut queue: mpsc::UnboundedReceiver<String>,
    slots: Arc<Semaphore>,
    registry: Arc<TaskRegistry>,
    supervisor: Arc<ProcessSupervisor>,
) {
    while let Some(task_id) = queue.recv().await {
        // 排队期间被取消的任务不占用名额
        if registry.status(&task_id).await != Some(TaskStatus::Pending) {
            continue;
        }
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        supervisor.launch(task_id, permit).await;
    }
    debug!("Download scheduler stopped");
}
