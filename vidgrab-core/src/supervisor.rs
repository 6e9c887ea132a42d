use crate::{
    config::OrchestratorConfig,
    progress::parse_progress,
    registry::{Outcome, TaskRegistry},
    types::{DownloadRequest, TaskEvent, TaskStatus},
};
use fs_err::tokio as fs;
use futures::future;
use std::{
    collections::HashMap, ffi::OsString, process::ExitStatus, process::Stdio, sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{OwnedSemaphorePermit, RwLock, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// 用户取消时写入任务的错误信息
pub const CANCELLED_ERROR: &str = "cancelled by user";
/// 超时时写入任务的错误信息
pub const TIMEOUT_ERROR: &str = "timeout";

/// stderr 最多保留的字节数（保留末尾）
const STDERR_TAIL_LIMIT: usize = 16 * 1024;
/// 进程退出后等待输出读取结束的时间
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_BUFFER_SIZE: usize = 4096;

/// 发送任务事件，接收端已满或已关闭时直接丢弃
pub(crate) fn emit(events: &mpsc::Sender<TaskEvent>, event: TaskEvent) {
    let _ = events.try_send(event);
}

/// 创建下载工具命令，已带上前缀参数
pub(crate) fn tool_command(config: &OrchestratorConfig) -> Command {
    let mut command = Command::new(&config.executable);
    command
        .args(&config.base_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// 根据请求构建下载参数（不含前缀参数）
pub fn build_download_args(
    config: &OrchestratorConfig,
    request: &DownloadRequest,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = config.default_options.iter().map(OsString::from).collect();

    // 输出路径和文件名模板
    args.push("-o".into());
    args.push(
        request
            .output_path
            .join(&request.output_template)
            .into_os_string(),
    );

    args.push("-f".into());
    args.push(request.quality.as_str().into());

    if request.extract_audio {
        args.push("--extract-audio".into());
        args.push("--audio-format".into());
        args.push(request.audio_format.as_str().into());
    }

    if request.download_subtitles {
        args.push("--write-subs".into());
        let langs: Vec<&str> = request
            .subtitle_langs
            .iter()
            .map(|lang| lang.trim())
            .filter(|lang| !lang.is_empty())
            .collect();
        if !langs.is_empty() {
            args.push("--sub-langs".into());
            args.push(langs.join(",").into());
        }
    }

    args.push(request.url.as_str().into());
    args
}

/// 正在运行的子进程
#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: oneshot::Sender<()>,
}

/// 子进程的结束方式
enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Killed,
    TimedOut,
}

/// 子进程管理器
///
/// 每个下载中的任务对应一个子进程。进程表与任务注册表是仅有的两处共享可变状态，
/// 任务的终结统一经过 [`TaskRegistry`] 的比较并设置，退出、超时、取消三条路径
/// 只有第一个到达的生效。
pub(crate) struct ProcessSupervisor {
    config: Arc<OrchestratorConfig>,
    registry: Arc<TaskRegistry>,
    processes: RwLock<HashMap<String, ProcessHandle>>,
    events: mpsc::Sender<TaskEvent>,
}

impl ProcessSupervisor {
    pub(crate) fn new(
        config: Arc<OrchestratorConfig>,
        registry: Arc<TaskRegistry>,
        events: mpsc::Sender<TaskEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            processes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 当前存活的子进程数
    pub(crate) async fn process_count(&self) -> usize {
        self.processes.read().await.len()
    }

    /// 启动任务对应的子进程
    ///
    /// `permit` 在子进程结束（或启动失败）时释放。任务已不处于等待状态时直接返回。
    pub(crate) async fn launch(self: &Arc<Self>, task_id: String, permit: OwnedSemaphorePermit) {
        let Some(task) = self.registry.get(&task_id).await else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        let request = task.request;

        // 确保输出目录存在
        if let Err(e) = fs::create_dir_all(&request.output_path).await {
            self.fail(&task_id, format!("failed to create output directory: {e}"))
                .await;
            return;
        }

        let args = build_download_args(&self.config, &request);
        debug!(task_id = %task_id, ?args, "Building download command");

        let mut command = tool_command(&self.config);
        command.args(&args);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail(
                    &task_id,
                    format!(
                        "failed to spawn {}: {e}",
                        self.config.executable.display()
                    ),
                )
                .await;
                return;
            }
        };

        self.supervise(task_id, child, permit).await;
    }

    /// 登记已启动的子进程并转入下载状态，随后在后台等待其结束
    ///
    /// 任务在此之前已被取消时杀掉子进程，任务保持取消结果。
    async fn supervise(
        self: &Arc<Self>,
        task_id: String,
        child: Child,
        permit: OwnedSemaphorePermit,
    ) {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.processes
            .write()
            .await
            .insert(task_id.clone(), ProcessHandle { pid, kill_tx });

        if self.registry.start(&task_id).await {
            info!(task_id = %task_id, ?pid, "Download started");
            emit(
                &self.events,
                TaskEvent::Started {
                    task_id: task_id.clone(),
                },
            );
        } else {
            // 启动期间任务被取消，取消方没有看到进程句柄
            let handle = self.processes.write().await.remove(&task_id);
            if let Some(handle) = handle {
                let _ = handle.kill_tx.send(());
            }
        }

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.drive(&task_id, child, kill_rx).await;
            drop(permit);
        });
    }

    /// 等待子进程结束并终结任务
    async fn drive(&self, task_id: &str, mut child: Child, mut kill_rx: oneshot::Receiver<()>) {
        let stdout_pump = child
            .stdout
            .take()
            .map(|stdout| self.spawn_pump(task_id, stdout, false));
        let stderr_pump = child
            .stderr
            .take()
            .map(|stderr| self.spawn_pump(task_id, stderr, true));

        let timeout = self.config.timeout();
        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            _ = &mut kill_rx => Exit::Killed,
            _ = tokio::time::sleep(timeout) => Exit::TimedOut,
        };

        match exit {
            Exit::Exited(status) => {
                // 取消方可能已经移除了句柄
                self.processes.write().await.remove(task_id);
                match status {
                    Ok(status) if status.success() => {
                        // 成功结果先落定，剩余输出不再读取
                        self.complete(task_id).await;
                        abort(stdout_pump, stderr_pump);
                    }
                    Ok(status) => {
                        let (_, stderr) =
                            future::join(drain(stdout_pump), drain(stderr_pump)).await;
                        self.fail(task_id, describe_failure(status, &stderr)).await;
                    }
                    Err(e) => {
                        abort(stdout_pump, stderr_pump);
                        self.fail(task_id, format!("failed to wait for download process: {e}"))
                            .await;
                    }
                }
            }
            Exit::Killed => {
                kill(task_id, &mut child).await;
                abort(stdout_pump, stderr_pump);
                debug!(task_id = %task_id, "Cancelled process reaped");
            }
            Exit::TimedOut => {
                let removed = self.processes.write().await.remove(task_id).is_some();
                kill(task_id, &mut child).await;
                abort(stdout_pump, stderr_pump);
                if removed {
                    warn!(task_id = %task_id, timeout_ms = self.config.timeout_ms, "Download timed out");
                    self.fail(task_id, TIMEOUT_ERROR.to_string()).await;
                }
            }
        }
    }

    async fn complete(&self, task_id: &str) {
        if self.registry.finalize(task_id, Outcome::Completed).await {
            info!(task_id = %task_id, "Download completed");
            emit(
                &self.events,
                TaskEvent::Completed {
                    task_id: task_id.to_string(),
                },
            );
        }
    }

    /// 取消任务
    ///
    /// 任务不存在时返回 false；否则杀掉存活的进程（如果有），把未终结的任务置为失败，
    /// 并返回 true。已终结的任务保持原状。
    pub(crate) async fn cancel(&self, task_id: &str) -> bool {
        let handle = self.processes.write().await.remove(task_id);
        if let Some(handle) = handle {
            debug!(task_id = %task_id, pid = ?handle.pid, "Killing download process");
            let _ = handle.kill_tx.send(());
        }

        if !self.registry.contains(task_id).await {
            return false;
        }

        if self
            .registry
            .finalize(task_id, Outcome::Failed(CANCELLED_ERROR.to_string()))
            .await
        {
            warn!(task_id = %task_id, "Download cancelled by user");
            emit(
                &self.events,
                TaskEvent::Cancelled {
                    task_id: task_id.to_string(),
                },
            );
        }
        true
    }

    async fn fail(&self, task_id: &str, error: String) {
        if self
            .registry
            .finalize(task_id, Outcome::Failed(error.clone()))
            .await
        {
            error!(task_id = %task_id, %error, "Download failed");
            emit(
                &self.events,
                TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error,
                },
            );
        }
    }

    fn spawn_pump<R>(&self, task_id: &str, reader: R, keep: bool) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = OutputPump {
            task_id: task_id.to_string(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            keep,
        };
        tokio::spawn(output.run(reader))
    }
}

/// 把一路输出送入进度解析器
struct OutputPump {
    task_id: String,
    registry: Arc<TaskRegistry>,
    events: mpsc::Sender<TaskEvent>,
    /// 是否保留输出用于错误诊断
    keep: bool,
}

impl OutputPump {
    async fn run<R: AsyncRead + Unpin>(self, mut reader: R) -> String {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut kept = String::new();

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(task_id = %self.task_id, error = %e, "Failed to read process output");
                    break;
                }
            };

            let chunk = String::from_utf8_lossy(&buf[..n]);
            debug!(task_id = %self.task_id, output = %chunk.trim_end(), "Tool output");

            let update = parse_progress(&chunk);
            if let Some(task) = self.registry.apply_progress(&self.task_id, &update).await {
                emit(
                    &self.events,
                    TaskEvent::Progress {
                        task_id: task.id,
                        progress: task.progress,
                        speed: task.speed,
                        eta: task.eta,
                    },
                );
            }

            if self.keep {
                push_tail(&mut kept, &chunk, STDERR_TAIL_LIMIT);
            }
        }
        kept
    }
}

/// 追加文本，只保留末尾 `limit` 字节
fn push_tail(buf: &mut String, chunk: &str, limit: usize) {
    buf.push_str(chunk);
    if buf.len() > limit {
        let mut cut = buf.len() - limit;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

fn describe_failure(status: ExitStatus, stderr: &str) -> String {
    let code = match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("download failed ({code})")
    } else {
        format!("download failed ({code}): {stderr}")
    }
}

async fn drain(pump: Option<JoinHandle<String>>) -> String {
    let Some(pump) = pump else {
        return String::new();
    };
    let abort = pump.abort_handle();
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // 子进程的子进程可能还占着管道
            abort.abort();
            String::new()
        }
    }
}

fn abort(stdout: Option<JoinHandle<String>>, stderr: Option<JoinHandle<String>>) {
    for pump in [stdout, stderr].into_iter().flatten() {
        pump.abort();
    }
}

async fn kill(task_id: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(task_id = %task_id, error = %e, "Failed to kill download process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, Quality};

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_download_args() {
        let config = OrchestratorConfig::default();
        let request = DownloadRequest::new("https://example.com/v", "/tmp/out");
        let args = strings(&build_download_args(&config, &request));

        assert_eq!(
            args,
            vec![
                "--no-warnings",
                "--write-info-json",
                "--write-thumbnail",
                "--embed-metadata",
                "--add-metadata",
                "-o",
                "/tmp/out/%(title)s.%(ext)s",
                "-f",
                "best",
                "https://example.com/v",
            ]
        );
    }

    #[test]
    fn test_audio_and_subtitle_args() {
        let config = OrchestratorConfig {
            default_options: Vec::new(),
            ..Default::default()
        };
        let mut request = DownloadRequest::new("https://example.com/v", "/data");
        request.quality = Quality::BestAudio;
        request.output_template = "%(id)s.%(ext)s".to_string();
        request.extract_audio = true;
        request.audio_format = AudioFormat::Flac;
        request.download_subtitles = true;
        request.subtitle_langs = vec!["en".to_string(), "ja".to_string()];

        let args = strings(&build_download_args(&config, &request));
        assert_eq!(
            args,
            vec![
                "-o",
                "/data/%(id)s.%(ext)s",
                "-f",
                "bestaudio",
                "--extract-audio",
                "--audio-format",
                "flac",
                "--write-subs",
                "--sub-langs",
                "en,ja",
                "https://example.com/v",
            ]
        );
    }

    #[test]
    fn test_audio_format_ignored_without_extraction() {
        let config = OrchestratorConfig::default();
        let mut request = DownloadRequest::new("https://example.com/v", "/data");
        request.audio_format = AudioFormat::Wav;
        let args = strings(&build_download_args(&config, &request));
        assert!(!args.iter().any(|a| a == "--audio-format" || a == "wav"));
        assert!(!args.iter().any(|a| a == "--write-subs"));
    }

    #[test]
    fn test_push_tail_keeps_char_boundaries() {
        let mut buf = String::new();
        push_tail(&mut buf, "abc", 8);
        push_tail(&mut buf, "网络错误", 8);
        assert!(buf.len() <= 8);
        assert!(buf.ends_with("错误"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_before_start_kills_spawned_process() -> anyhow::Result<()> {
        let config = Arc::new(OrchestratorConfig {
            executable: "sh".into(),
            base_args: vec![
                "-c".to_string(),
                "exec sleep 30".to_string(),
                "sh".to_string(),
            ],
            ..Default::default()
        });
        let registry = Arc::new(TaskRegistry::new());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            events_tx,
        ));

        let task_id = registry
            .create(DownloadRequest::new("https://example.com/v", "/tmp"))
            .await;
        let child = tool_command(&config).spawn()?;

        // 进程已启动，任务还没有转入下载状态
        assert!(supervisor.cancel(&task_id).await);

        let slots = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = Arc::clone(&slots).acquire_owned().await?;
        supervisor.supervise(task_id.clone(), child, permit).await;

        // 子进程被回收后名额才会归还
        let _slot = tokio::time::timeout(Duration::from_secs(5), slots.acquire()).await??;
        assert_eq!(supervisor.process_count().await, 0);

        let task = registry.get(&task_id).await.expect("task exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(CANCELLED_ERROR));

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen, vec![TaskEvent::Cancelled { task_id }]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_describe_failure() {
        use std::os::unix::process::ExitStatusExt;

        let status = ExitStatus::from_raw(1 << 8);
        assert_eq!(
            describe_failure(status, "network error\n"),
            "download failed (exit code 1): network error"
        );

        let killed = ExitStatus::from_raw(9);
        assert_eq!(describe_failure(killed, ""), "download failed (terminated by signal)");
    }
}
