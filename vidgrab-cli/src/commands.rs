use anyhow::{Context, Result};
use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::warn;
use vidgrab_core::{
    AudioFormat, DownloadRequest, Orchestrator, Quality, TaskEvent, TaskStatus, VideoInfo,
};

/// 下载命令的选项
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub output: Option<PathBuf>,
    pub quality: Option<String>,
    pub template: Option<String>,
    pub extract_audio: bool,
    pub audio_format: Option<AudioFormat>,
    pub subtitles: bool,
    pub sub_langs: Vec<String>,
}

impl DownloadOptions {
    /// 为一个 URL 构建下载请求，未指定的选项使用默认值
    pub fn to_request(&self, url: &str, default_output: &std::path::Path) -> DownloadRequest {
        let output = self
            .output
            .clone()
            .unwrap_or_else(|| default_output.to_path_buf());

        let mut request = DownloadRequest::new(url, output);
        if let Some(quality) = &self.quality {
            request.quality = Quality::from(quality.as_str());
        }
        if let Some(template) = &self.template {
            request.output_template = template.clone();
        }
        request.extract_audio = self.extract_audio;
        if let Some(format) = self.audio_format {
            request.audio_format = format;
        }
        request.download_subtitles = self.subtitles;
        if !self.sub_langs.is_empty() {
            request.subtitle_langs = self.sub_langs.clone();
        }
        request
    }
}

/// 获取视频信息
pub async fn info(orchestrator: &Orchestrator, url: &str, json: bool) -> Result<()> {
    let info = orchestrator
        .fetch_info(url)
        .await
        .with_context(|| format!("failed to fetch info for {url}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_info(&info);
    }
    Ok(())
}

fn print_info(info: &VideoInfo) {
    println!("{} [{}]", info.title, info.video_id);
    println!("  uploader: {}", info.uploader);
    println!("  platform: {}", info.platform);
    println!("  duration: {}s", info.duration);
    if let Some(thumbnail) = &info.thumbnail {
        println!("  thumbnail: {thumbnail}");
    }
    for format in &info.formats {
        println!(
            "  {:<12} {:<6} {:<12} {}",
            format.format_id,
            format.ext,
            format.resolution.as_deref().unwrap_or("-"),
            format.format_note
        );
    }
}

/// 提交下载并等待所有任务结束
///
/// Ctrl-C 会取消所有未完成的任务。
pub async fn download(
    orchestrator: Arc<Orchestrator>,
    mut events: mpsc::Receiver<TaskEvent>,
    requests: Vec<DownloadRequest>,
) -> Result<()> {
    let mut remaining = HashSet::new();
    for request in requests {
        let url = request.url.clone();
        let task_id = orchestrator
            .submit_download(request)
            .await
            .with_context(|| format!("failed to submit {url}"))?;
        println!("[{}] queued {url}", short_id(&task_id));
        remaining.insert(task_id);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    // 事件在通道满时会被丢弃，定期核对一次任务状态
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    while !remaining.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event);
                if matches!(
                    event,
                    TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Cancelled { .. }
                ) {
                    remaining.remove(event.task_id());
                }
            }
            _ = ticker.tick() => {
                for task_id in remaining.clone() {
                    let finished = orchestrator
                        .query_task(&task_id)
                        .await
                        .is_none_or(|task| task.status.is_terminal());
                    if finished {
                        remaining.remove(&task_id);
                    }
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling downloads");
                orchestrator.shutdown().await;
            }
        }
    }

    let failed = summarize(&orchestrator).await;
    if failed > 0 {
        anyhow::bail!("{failed} download(s) failed");
    }
    Ok(())
}

async fn summarize(orchestrator: &Orchestrator) -> usize {
    let mut failed = 0;
    for task in orchestrator.list_tasks().await {
        match task.status {
            TaskStatus::Completed => println!("[{}] completed {}", short_id(&task.id), task.request.url),
            TaskStatus::Failed => {
                failed += 1;
                println!(
                    "[{}] failed {}: {}",
                    short_id(&task.id),
                    task.request.url,
                    task.error.as_deref().unwrap_or_default()
                );
            }
            status => println!("[{}] {status} {}", short_id(&task.id), task.request.url),
        }
    }
    failed
}

fn render(event: &TaskEvent) {
    match event {
        TaskEvent::Started { task_id } => println!("[{}] started", short_id(task_id)),
        TaskEvent::Progress {
            task_id,
            progress,
            speed,
            eta,
        } => println!(
            "[{}] {:>5.1}% {} ETA {}",
            short_id(task_id),
            progress,
            speed.as_deref().unwrap_or("-"),
            eta.as_deref().unwrap_or("--:--")
        ),
        TaskEvent::Cancelled { task_id } => println!("[{}] cancelled", short_id(task_id)),
        TaskEvent::Added { .. }
        | TaskEvent::Completed { .. }
        | TaskEvent::Failed { .. }
        | TaskEvent::Reclaimed { .. } => {}
    }
}

fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}
