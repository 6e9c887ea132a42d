//! 仅获取视频元信息，不创建任务

use crate::{
    config::OrchestratorConfig,
    error::{OrchestratorError, Result},
    supervisor::tool_command,
    types::{VideoFormat, VideoInfo},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

const UNKNOWN_TITLE: &str = "unknown title";
const UNKNOWN_UPLOADER: &str = "unknown uploader";
const UNKNOWN_PLATFORM: &str = "unknown platform";

#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    title: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    extractor: Option<String>,
    id: Option<String>,
    thumbnail: Option<String>,
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    format_note: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    tbr: Option<f64>,
}

impl From<RawFormat> for VideoFormat {
    fn from(raw: RawFormat) -> Self {
        Self {
            format_id: raw.format_id.unwrap_or_default(),
            format_note: raw.format_note.unwrap_or_default(),
            ext: raw.ext.unwrap_or_default(),
            resolution: raw.resolution,
            vcodec: raw.vcodec,
            acodec: raw.acodec,
            filesize: raw.filesize.map(|size| size as u64),
            tbr: raw.tbr,
        }
    }
}

impl From<RawVideoInfo> for VideoInfo {
    fn from(raw: RawVideoInfo) -> Self {
        Self {
            title: raw.title.unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            description: raw.description,
            duration: raw.duration.unwrap_or(0.0),
            uploader: raw.uploader.unwrap_or_else(|| UNKNOWN_UPLOADER.to_string()),
            platform: raw.extractor.unwrap_or_else(|| UNKNOWN_PLATFORM.to_string()),
            video_id: raw.id.unwrap_or_default(),
            thumbnail: raw.thumbnail,
            formats: raw
                .formats
                .unwrap_or_default()
                .into_iter()
                .map(VideoFormat::from)
                .collect(),
        }
    }
}

/// 解析 `--dump-json` 的输出
///
/// 播放列表会输出多行 JSON，只取第一条。
pub fn parse_video_info(stdout: &[u8]) -> Result<VideoInfo> {
    let mut stream = serde_json::Deserializer::from_slice(stdout).into_iter::<RawVideoInfo>();
    match stream.next() {
        Some(Ok(raw)) => Ok(raw.into()),
        Some(Err(e)) => Err(OrchestratorError::InvalidOutput(e.to_string())),
        None => Err(OrchestratorError::InvalidOutput(
            "no metadata in tool output".to_string(),
        )),
    }
}

/// 运行下载工具的元信息模式
///
/// 超时后子进程随 future 一起被丢弃并杀掉。
pub(crate) async fn fetch_video_info(config: &OrchestratorConfig, url: &str) -> Result<VideoInfo> {
    info!(url, "Fetching video info");

    let mut command = tool_command(config);
    command
        .args(["--dump-json", "--no-warnings", "--flat-playlist"])
        .arg(url);
    let child = command.spawn().map_err(|e| OrchestratorError::Spawn {
        program: config.executable.display().to_string(),
        reason: e.to_string(),
    })?;

    let output = tokio::time::timeout(config.timeout(), child.wait_with_output())
        .await
        .map_err(|_| {
            warn!(url, timeout_ms = config.timeout_ms, "Fetching video info timed out");
            OrchestratorError::Timeout {
                after_ms: config.timeout_ms,
            }
        })??;

    if !output.status.success() {
        let code = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        };
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(url, %code, %stderr, "Fetching video info failed");
        return Err(OrchestratorError::ProcessFailed { code, stderr });
    }

    debug!(url, bytes = output.stdout.len(), "Parsing video info");
    let video_info = parse_video_info(&output.stdout)?;
    info!(url, title = %video_info.title, "Fetched video info");
    Ok(video_info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Never Gonna Give You Up",
        "duration": 212,
        "uploader": "Rick Astley",
        "extractor": "youtube",
        "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg",
        "formats": [
            {"format_id": "140", "format_note": "medium", "ext": "m4a", "resolution": "audio only",
             "vcodec": "none", "acodec": "mp4a.40.2", "filesize": 3433514, "tbr": 129.5},
            {"format_id": "sb0", "ext": "mhtml", "filesize": null}
        ]
    }"#;

    #[test]
    fn test_parse_video_info() -> anyhow::Result<()> {
        let info = parse_video_info(FIXTURE.as_bytes())?;
        assert_eq!(info.title, "Never Gonna Give You Up");
        assert_eq!(info.duration, 212.0);
        assert_eq!(info.platform, "youtube");
        assert_eq!(info.video_id, "dQw4w9WgXcQ");
        assert!(info.description.is_none());
        assert_eq!(info.formats.len(), 2);

        let audio = &info.formats[0];
        assert_eq!(audio.format_id, "140");
        assert_eq!(audio.ext, "m4a");
        assert_eq!(audio.filesize, Some(3_433_514));
        assert_eq!(audio.tbr, Some(129.5));

        let storyboard = &info.formats[1];
        assert_eq!(storyboard.format_note, "");
        assert!(storyboard.filesize.is_none());
        Ok(())
    }

    #[test]
    fn test_missing_fields_fall_back() -> anyhow::Result<()> {
        let info = parse_video_info(b"{}")?;
        assert_eq!(info.title, UNKNOWN_TITLE);
        assert_eq!(info.uploader, UNKNOWN_UPLOADER);
        assert_eq!(info.platform, UNKNOWN_PLATFORM);
        assert_eq!(info.duration, 0.0);
        assert!(info.formats.is_empty());
        Ok(())
    }

    #[test]
    fn test_playlist_takes_first_entry() -> anyhow::Result<()> {
        let info = parse_video_info(b"{\"title\": \"first\"}\n{\"title\": \"second\"}\n")?;
        assert_eq!(info.title, "first");
        Ok(())
    }

    #[test]
    fn test_invalid_output() {
        assert!(matches!(
            parse_video_info(b"ERROR: Unsupported URL"),
            Err(OrchestratorError::InvalidOutput(_))
        ));
        assert!(matches!(
            parse_video_info(b""),
            Err(OrchestratorError::InvalidOutput(_))
        ));
    }
}
