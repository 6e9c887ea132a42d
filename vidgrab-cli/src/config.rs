use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vidgrab_core::OrchestratorConfig;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// 默认下载路径
    pub default_output_dir: PathBuf,
    /// 日志级别（RUST_LOG 未设置时生效）
    pub log_level: String,
    /// 是否输出 JSON 格式日志
    #[serde(default)]
    pub log_json: bool,
    /// 任务编排配置
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        // 获取用户下载目录
        let default_path = dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            default_output_dir: default_path,
            log_level: "info".to_string(),
            log_json: false,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AppConfig {
    /// 默认配置文件位置
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vidgrab").join("config.json"))
    }

    /// 从文件加载配置
    pub async fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs_err::tokio::read_to_string(path).await?;
            let config: AppConfig = serde_json::from_str(&content)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            // 如果配置文件不存在，返回默认配置
            Ok(Self::default())
        }
    }

    /// 保存配置到文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs_err::tokio::write(path, content).await?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            anyhow::bail!("logLevel must not be empty");
        }
        self.orchestrator.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig::load(&dir.path().join("absent.json")).await?;
        assert_eq!(config.log_level, "info");
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_creates_parent_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.orchestrator.max_concurrent_downloads = 5;
        config.save(&path).await?;

        let loaded = AppConfig::load(&path).await?;
        assert_eq!(loaded.orchestrator.max_concurrent_downloads, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs_err::tokio::write(
            &path,
            r#"{"defaultOutputDir": "/srv/videos", "logLevel": "debug",
                "orchestrator": {"executable": "python", "baseArgs": ["-m", "yt_dlp"]}}"#,
        )
        .await?;

        let config = AppConfig::load(&path).await?;
        assert_eq!(config.default_output_dir, PathBuf::from("/srv/videos"));
        assert!(!config.log_json);
        assert_eq!(config.orchestrator.base_args, vec!["-m", "yt_dlp"]);
        assert_eq!(config.orchestrator.timeout_ms, 300_000);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_validate() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.orchestrator.timeout_ms = 0;
        assert!(config.validate().is_err());

        let config = AppConfig {
            log_level: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
