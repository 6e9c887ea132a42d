use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// 编排器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// 下载工具可执行文件路径
    pub executable: PathBuf,
    /// 放在所有参数最前面的前缀参数，例如通过 python 运行时的 `-m yt_dlp`
    pub base_args: Vec<String>,
    /// 下载模式下固定附加的参数
    pub default_options: Vec<String>,
    /// 同时处于下载状态的最大任务数
    pub max_concurrent_downloads: usize,
    /// 等待队列上限，None 表示不限制
    pub max_pending_tasks: Option<usize>,
    /// 单个子进程的超时（毫秒）
    pub timeout_ms: u64,
    /// 终态任务的保留时间（毫秒）
    pub task_retention_ms: u64,
    /// 回收扫描间隔（毫秒）
    pub cleanup_interval_ms: u64,
    /// 事件通道容量
    pub event_buffer_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("yt-dlp"),
            base_args: Vec::new(),
            default_options: vec![
                "--no-warnings".to_string(),
                "--write-info-json".to_string(),
                "--write-thumbnail".to_string(),
                "--embed-metadata".to_string(),
                "--add-metadata".to_string(),
            ],
            max_concurrent_downloads: 3,
            max_pending_tasks: None,
            timeout_ms: 300_000,            // 5 分钟
            task_retention_ms: 86_400_000,  // 24 小时
            cleanup_interval_ms: 60_000,    // 1 分钟
            event_buffer_size: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(invalid("executable must not be empty"));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(invalid("maxConcurrentDownloads must be greater than 0"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeoutMs must be greater than 0"));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(invalid("cleanupIntervalMs must be greater than 0"));
        }
        if self.event_buffer_size == 0 {
            return Err(invalid("eventBufferSize must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> OrchestratorError {
    OrchestratorError::InvalidRequest(format!("invalid configuration: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.task_retention(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() -> anyhow::Result<()> {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"executable": "python", "baseArgs": ["-m", "yt_dlp"], "timeoutMs": 1000}"#,
        )?;
        assert_eq!(config.executable, PathBuf::from("python"));
        assert_eq!(config.base_args, vec!["-m", "yt_dlp"]);
        assert_eq!(config.timeout_ms, 1000);
        assert_eq!(config.max_concurrent_downloads, 3);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = OrchestratorConfig {
            max_concurrent_downloads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
