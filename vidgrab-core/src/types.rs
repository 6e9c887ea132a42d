use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// 默认文件名模板（以视频标题命名）
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// 视频质量选择器
///
/// 除了几个常用的预设外，任意非空字符串都会原样作为格式选择器传给下载工具。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Quality {
    /// 最佳画质
    #[default]
    Best,
    /// 最差画质
    Worst,
    /// 仅最佳视频流
    BestVideo,
    /// 仅最佳音频流
    BestAudio,
    /// 自定义格式选择器，例如 `bv*[height<=720]+ba`
    Format(String),
}

impl Quality {
    pub fn as_str(&self) -> &str {
        match self {
            Quality::Best => "best",
            Quality::Worst => "worst",
            Quality::BestVideo => "bestvideo",
            Quality::BestAudio => "bestaudio",
            Quality::Format(selector) => selector,
        }
    }
}

impl From<String> for Quality {
    fn from(value: String) -> Self {
        match value.as_str() {
            "best" => Quality::Best,
            "worst" => Quality::Worst,
            "bestvideo" => Quality::BestVideo,
            "bestaudio" => Quality::BestAudio,
            _ => Quality::Format(value),
        }
    }
}

impl From<&str> for Quality {
    fn from(value: &str) -> Self {
        Quality::from(value.to_string())
    }
}

impl From<Quality> for String {
    fn from(value: Quality) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 提取音频时的目标格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Aac,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "aac",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "aac" => Ok(AudioFormat::Aac),
            "wav" => Ok(AudioFormat::Wav),
            "flac" => Ok(AudioFormat::Flac),
            other => Err(OrchestratorError::InvalidRequest(format!(
                "unsupported audio format: {other}"
            ))),
        }
    }
}

fn default_output_template() -> String {
    DEFAULT_OUTPUT_TEMPLATE.to_string()
}

fn default_subtitle_langs() -> Vec<String> {
    vec!["zh-CN".to_string(), "en".to_string()]
}

/// 下载请求
///
/// 一经提交即不可变，任务持有它的一份拷贝。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// 视频链接
    pub url: String,
    /// 保存目录
    pub output_path: PathBuf,
    /// 质量选择器
    #[serde(default)]
    pub quality: Quality,
    /// 文件名模板
    #[serde(default = "default_output_template")]
    pub output_template: String,
    /// 是否提取音频
    #[serde(default)]
    pub extract_audio: bool,
    /// 音频格式，仅在 `extract_audio` 时生效
    #[serde(default)]
    pub audio_format: AudioFormat,
    /// 是否下载字幕
    #[serde(default)]
    pub download_subtitles: bool,
    /// 字幕语言，仅在 `download_subtitles` 时生效
    #[serde(default = "default_subtitle_langs")]
    pub subtitle_langs: Vec<String>,
}

impl DownloadRequest {
    /// 以默认选项创建请求
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
            quality: Quality::default(),
            output_template: default_output_template(),
            extract_audio: false,
            audio_format: AudioFormat::default(),
            download_subtitles: false,
            subtitle_langs: default_subtitle_langs(),
        }
    }

    /// 校验请求形状
    ///
    /// URL 必须是带 http/https 协议的绝对地址；路径、模板、质量不能为空；
    /// 开启字幕下载时至少需要一种语言。
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| OrchestratorError::InvalidRequest(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OrchestratorError::InvalidRequest(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "outputPath must not be empty".to_string(),
            ));
        }
        if self.output_template.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "outputTemplate must not be empty".to_string(),
            ));
        }
        if self.quality.as_str().trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "quality must not be empty".to_string(),
            ));
        }
        if self.download_subtitles
            && self.subtitle_langs.iter().all(|lang| lang.trim().is_empty())
        {
            return Err(OrchestratorError::InvalidRequest(
                "subtitleLangs must contain at least one language".to_string(),
            ));
        }
        Ok(())
    }
}

/// 任务状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待开始
    Pending,
    /// 正在下载
    Downloading,
    /// 已完成
    Completed,
    /// 失败（包括超时与用户取消）
    Failed,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        })
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    /// 任务唯一标识符
    pub id: String,
    /// 请求参数
    pub request: DownloadRequest,
    /// 当前状态
    pub status: TaskStatus,
    /// 进度百分比（0-100）
    pub progress: f64,
    /// 最近一次观察到的下载速度
    pub speed: Option<String>,
    /// 最近一次观察到的剩余时间
    pub eta: Option<String>,
    /// 错误信息（仅在失败时设置）
    pub error: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

/// 可用格式描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub format_id: String,
    pub format_note: String,
    /// 容器扩展名
    pub ext: String,
    pub resolution: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    /// 文件大小（字节）
    pub filesize: Option<u64>,
    /// 总码率（kbit/s）
    pub tbr: Option<f64>,
}

/// 视频元信息快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub description: Option<String>,
    /// 时长（秒）
    pub duration: f64,
    pub uploader: String,
    /// 提取器名称，例如 `youtube`
    pub platform: String,
    pub video_id: String,
    pub thumbnail: Option<String>,
    pub formats: Vec<VideoFormat>,
}

/// 任务事件
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// 任务已添加
    Added { task_id: String },
    /// 子进程已启动
    Started { task_id: String },
    /// 任务进度更新
    Progress {
        task_id: String,
        progress: f64,
        speed: Option<String>,
        eta: Option<String>,
    },
    /// 任务完成
    Completed { task_id: String },
    /// 任务失败（包括超时）
    Failed { task_id: String, error: String },
    /// 任务被用户取消
    Cancelled { task_id: String },
    /// 过期任务已回收
    Reclaimed { task_id: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Added { task_id }
            | TaskEvent::Started { task_id }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id }
            | TaskEvent::Reclaimed { task_id } => task_id,
        }
    }
}
