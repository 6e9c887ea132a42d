//! 下载工具进度输出解析
//!
//! 下载工具只输出面向人类的进度行，没有机器可读的结构。这里对原始文本片段做
//! 子串匹配，不假设片段按行切分；匹配不到的内容直接忽略。

use regex::Regex;
use std::sync::LazyLock;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid percent regex"));

static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?(?:K|M|G|T)?iB/s)").expect("valid speed regex")
});

static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ETA\s+(\d+:\d+)").expect("valid eta regex"));

/// 从一段输出中提取到的进度字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

impl ProgressUpdate {
    /// 没有提取到任何字段
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.speed.is_none() && self.eta.is_none()
    }
}

/// 解析一段原始输出
///
/// 一个片段里可能累积了多次 `\r` 刷新，每个字段取最后一个匹配。
pub fn parse_progress(chunk: &str) -> ProgressUpdate {
    let percent = last_capture(&PERCENT_RE, chunk)
        .and_then(|p| p.parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0));
    let speed = last_capture(&SPEED_RE, chunk).map(str::to_string);
    let eta = last_capture(&ETA_RE, chunk).map(str::to_string);

    ProgressUpdate {
        percent,
        speed,
        eta,
    }
}

fn last_capture<'a>(re: &Regex, haystack: &'a str) -> Option<&'a str> {
    re.captures_iter(haystack)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_progress_line() {
        let update = parse_progress("  42.5% of 10.00MiB at  1.20MiB/s ETA 00:08");
        assert_eq!(update.percent, Some(42.5));
        assert_eq!(update.speed.as_deref(), Some("1.20MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:08"));
    }

    #[test]
    fn test_real_tool_output() {
        let update =
            parse_progress("\r[download]  73.1% of ~ 250.34MiB at  812.55KiB/s ETA 01:42 (frag 12/40)");
        assert_eq!(update.percent, Some(73.1));
        assert_eq!(update.speed.as_deref(), Some("812.55KiB/s"));
        assert_eq!(update.eta.as_deref(), Some("01:42"));
    }

    #[test]
    fn test_integer_percent_and_plain_bytes() {
        let update = parse_progress("[download] 100% of 3.00MiB at 512iB/s");
        assert_eq!(update.percent, Some(100.0));
        assert_eq!(update.speed.as_deref(), Some("512iB/s"));
        assert_eq!(update.eta, None);
    }

    #[test]
    fn test_fragment_without_line_boundaries() {
        // 片段可能在任意位置被截断
        let update = parse_progress("iB at 2.00MiB/s ETA 00:3");
        assert_eq!(update.percent, None);
        assert_eq!(update.speed.as_deref(), Some("2.00MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:3"));

        assert_eq!(parse_progress("12.").percent, None);
        assert_eq!(parse_progress(" 5.0").percent, None);
    }

    #[test]
    fn test_unmatched_chunk_yields_nothing() {
        assert!(parse_progress("[youtube] abc123: Downloading webpage").is_empty());
        assert!(parse_progress("").is_empty());
        assert!(parse_progress("ETA unknown").is_empty());
    }

    #[test]
    fn test_buffered_refreshes_take_latest_value() {
        let update = parse_progress("  10.0% of 1MiB ETA 00:09\r  20.0% of 1MiB ETA 00:07");
        assert_eq!(update.percent, Some(20.0));
        assert_eq!(update.eta.as_deref(), Some("00:07"));
    }
}
