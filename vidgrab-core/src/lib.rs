//! 视频下载任务编排
//!
//! 把下载交给外部命令行工具（yt-dlp 或兼容实现）执行，负责任务的创建、并发调度、
//! 进度解析、超时与取消，以及过期任务的回收。

pub mod config;
pub mod error;
pub mod info;
pub mod orchestrator;
pub mod progress;
pub mod registry;
mod supervisor;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use info::parse_video_info;
pub use orchestrator::Orchestrator;
pub use progress::{ProgressUpdate, parse_progress};
pub use registry::TaskRegistry;
pub use supervisor::{CANCELLED_ERROR, TIMEOUT_ERROR, build_download_args};
pub use types::{
    AudioFormat, DEFAULT_OUTPUT_TEMPLATE, DownloadRequest, DownloadTask, Quality, TaskEvent,
    TaskStatus, VideoFormat, VideoInfo,
};
