//! vidgrab 命令行
//!
//! 通过外部下载工具获取视频信息或下载视频。

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{io, path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidgrab_core::{AudioFormat, Orchestrator};

use crate::{commands::DownloadOptions, config::AppConfig};

#[derive(Parser, Debug)]
#[command(name = "vidgrab")]
#[command(version, about = "Download videos through yt-dlp", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show video metadata without downloading
    Info {
        url: String,
        /// Print the raw metadata snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download one or more videos
    Download(DownloadArgs),
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Quality preset (best, worst, bestvideo, bestaudio) or a format selector
    #[arg(short = 'f', long)]
    quality: Option<String>,

    /// Output file name template
    #[arg(short, long)]
    template: Option<String>,

    /// Extract the audio track
    #[arg(short = 'x', long)]
    extract_audio: bool,

    /// Audio format used with --extract-audio (mp3, aac, wav, flac)
    #[arg(long)]
    audio_format: Option<AudioFormat>,

    /// Download subtitles
    #[arg(long)]
    subtitles: bool,

    /// Comma separated subtitle languages
    #[arg(long, value_delimiter = ',')]
    sub_langs: Vec<String>,
}

impl DownloadArgs {
    fn into_parts(self) -> (Vec<String>, DownloadOptions) {
        let options = DownloadOptions {
            output: self.output,
            quality: self.quality,
            template: self.template,
            extract_audio: self.extract_audio,
            audio_format: self.audio_format,
            subtitles: self.subtitles,
            sub_langs: self.sub_langs,
        };
        (self.urls, options)
    }
}

/// 初始化日志，输出到 stderr 以免干扰进度显示
fn init_tracing(level: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("vidgrab={level},vidgrab_core={level}")),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(AppConfig::default_path)
        .context("cannot determine config file location, pass --config")?;
    let config = AppConfig::load(&config_path).await?;
    config.validate()?;

    init_tracing(&config.log_level, cli.log_json || config.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path.display(), "Starting vidgrab");

    match cli.command {
        Command::Config { init } => {
            if init {
                config.save(&config_path).await?;
                info!(path = %config_path.display(), "Config written");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Info { url, json } => {
            let (orchestrator, _events) = Orchestrator::new(config.orchestrator)?;
            commands::info(&orchestrator, &url, json).await
        }
        Command::Download(args) => {
            let (urls, options) = args.into_parts();
            let requests = urls
                .iter()
                .map(|url| options.to_request(url, &config.default_output_dir))
                .collect();

            let (orchestrator, events) = Orchestrator::new(config.orchestrator)?;
            let orchestrator = Arc::new(orchestrator);
            let _reclaimer = orchestrator.spawn_reclaimer();
            commands::download(orchestrator, events, requests).await
        }
    }
}
