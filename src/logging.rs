use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// ログファイル名のプレフィックス
pub const LOG_FILE_NAME: &str = "inplace-operator.log";

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error)。RUST_LOG があればそちらを優先
    pub level: String,
    /// コンソール出力形式
    pub format: LogFormat,
    /// ファイル出力先。None ならコンソールのみ
    pub log_dir: Option<PathBuf>,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// 人が読む形式
    Text,
    /// ログ収集基盤向け JSON
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

impl LogConfig {
    /// ログレベルを上書き
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// RUST_LOG → 設定値 → info の順でフィルタを決める
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn file_appender(dir: &Path, rotation: LogRotation) -> rolling::RollingFileAppender {
    match rotation {
        LogRotation::Daily => rolling::daily(dir, LOG_FILE_NAME),
        LogRotation::Hourly => rolling::hourly(dir, LOG_FILE_NAME),
        LogRotation::Never => rolling::never(dir, LOG_FILE_NAME),
    }
}

/// ログシステムを初期化
///
/// ファイル出力が有効な場合は `WorkerGuard` を返す。プロセス終了まで保持すること。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };
    layers.push(console);

    let guard = match &config.log_dir {
        Some(dir) => {
            ensure_log_dir(dir)?;
            let (writer, guard) = non_blocking(file_appender(dir, config.rotation));
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(&config.level))
        .try_init()?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        log_dir = ?config.log_dir,
        "Logging initialized"
    );

    Ok(guard)
}
