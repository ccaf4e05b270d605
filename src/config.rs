use crate::drain::DrainOptions;
use crate::error::{Error, Result};
use crate::logging::{LogConfig, LogFormat, LogRotation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルの探索順
pub const DEFAULT_CONFIG_PATHS: [&str; 2] =
    ["inplace-operator.toml", "config/inplace-operator.toml"];

/// 環境変数プレフィックス (例: INPLACE__DRAIN__TIMEOUT_SECS=600)
pub const ENV_PREFIX: &str = "INPLACE";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub log: LogSettings,
    pub controller: ControllerSettings,
    pub refresh: RefreshSettings,
    pub drain: DrainSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    /// ログレベル (trace, debug, info, warn, error)。RUST_LOG が優先
    pub level: String,
    /// コンソール出力形式 (text, json)
    pub format: String,
    /// ファイル出力先。未指定ならファイル出力なし
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// ファイルローテーション (daily, hourly, never)
    pub rotation: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            dir: None,
            rotation: "daily".to_string(),
        }
    }
}

impl LogSettings {
    pub fn to_log_config(&self) -> LogConfig {
        let format = match self.format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let rotation = match self.rotation.as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        };
        LogConfig {
            level: self.level.clone(),
            format,
            log_dir: self.dir.clone(),
            rotation,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// 待機中の再キュー間隔
    pub requeue_after_secs: u64,
    /// 失敗したマシンの再試行までの間隔
    pub failed_retry_secs: u64,
    /// reconcile エラー時の再キュー間隔
    pub error_requeue_secs: u64,
    pub machine_upgrade_enabled: bool,
    pub machine_deployment_enabled: bool,
    pub control_plane_enabled: bool,
    /// イベントの reporter 名
    pub reporter: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            requeue_after_secs: 5,
            failed_retry_secs: 3,
            error_requeue_secs: 60,
            machine_upgrade_enabled: true,
            machine_deployment_enabled: true,
            control_plane_enabled: true,
            reporter: "inplace-operator".to_string(),
        }
    }
}

impl ControllerSettings {
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    pub fn failed_retry(&self) -> Duration {
        Duration::from_secs(self.failed_retry_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// ノード上の k8sd ポート
    pub k8sd_port: u16,
    pub request_timeout_secs: u64,
    /// k8sd は自己署名証明書で待ち受ける
    pub accept_invalid_certs: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            k8sd_port: 6400,
            request_timeout_secs: 30,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DrainSettings {
    pub timeout_secs: u64,
    /// 1 サイクルあたりの退避タイムアウト (0 = なし)
    pub eviction_timeout_secs: u64,
    pub retry_interval_secs: u64,
    /// 負の値なら Pod 自身の猶予期間を使う
    pub grace_period_seconds: i64,
    pub delete_emptydir_data: bool,
    pub force: bool,
    pub ignore_daemonsets: bool,
    pub allow_deletion: bool,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            eviction_timeout_secs: 60,
            retry_interval_secs: 5,
            grace_period_seconds: -1,
            delete_emptydir_data: false,
            force: false,
            ignore_daemonsets: false,
            allow_deletion: false,
        }
    }
}

impl TryFrom<&DrainSettings> for DrainOptions {
    type Error = Error;

    /// 猶予期間が Pod の `terminationGracePeriodSeconds` の範囲外ならエラー
    fn try_from(settings: &DrainSettings) -> Result<Self> {
        if settings.grace_period_seconds > i64::from(u32::MAX) {
            return Err(config::ConfigError::Message(format!(
                "drain.grace_period_seconds out of range: {}",
                settings.grace_period_seconds
            ))
            .into());
        }
        Ok(DrainOptions {
            timeout: Duration::from_secs(settings.timeout_secs),
            eviction_timeout: Duration::from_secs(settings.eviction_timeout_secs),
            retry_interval: Duration::from_secs(settings.retry_interval_secs),
            grace_period_seconds: settings.grace_period_seconds,
            delete_emptydir_data: settings.delete_emptydir_data,
            force: settings.force,
            ignore_daemonsets: settings.ignore_daemonsets,
            allow_deletion: settings.allow_deletion,
        })
    }
}

impl OperatorConfig {
    /// デフォルト値 → 設定ファイル → 環境変数の順に読み込む
    ///
    /// `path` が指定されればそのファイルを必須として読み、なければ
    /// `DEFAULT_CONFIG_PATHS` のうち最初に存在するものを使う。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&OperatorConfig::default())?);

        match path {
            Some(path) => {
                settings = settings.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(found) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .map(Path::new)
                    .find(|p| p.exists())
                {
                    tracing::debug!("Loading configuration from {}", found.display());
                    settings = settings.add_source(config::File::from(found));
                }
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: OperatorConfig = settings.build()?.try_deserialize()?;
        DrainOptions::try_from(&config.drain)?;
        Ok(config)
    }

    /// サンプル設定 (TOML) を生成
    pub fn sample_toml() -> std::result::Result<String, toml::ser::Error> {
        let body = toml::to_string_pretty(&OperatorConfig::default())?;
        Ok(format!(
            "# inplace-operator configuration\n\
             #\n\
             # Save as inplace-operator.toml. Every key can be overridden from the\n\
             # environment, e.g. INPLACE__DRAIN__TIMEOUT_SECS=600.\n\n{}",
            body
        ))
    }
}
