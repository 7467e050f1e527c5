//! 日志初始化
//!
//! 控制台 + 可选的滚动文件（按天切分，只保留最近 retention_days 个文件）

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::fs;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀（完整文件名: cloud-backup-uploader.YYYY-MM-DD.log）
pub const LOG_FILE_PREFIX: &str = "cloud-backup-uploader";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 持有文件写入线程的守卫，drop 后缓冲的日志会被刷出并停止写入
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 创建环境过滤器（RUST_LOG 优先，其次配置中的级别）
fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn local_timer() -> ChronoLocal {
    ChronoLocal::new(TIMESTAMP_FORMAT.to_string())
}

/// 创建按天滚动的日志文件写入器
fn build_file_appender(config: &LogConfig) -> Result<RollingFileAppender> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("创建日志目录失败: {:?}", config.log_dir))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(config.retention_days.max(1) as usize)
        .build(&config.log_dir)
        .context("创建日志文件写入器失败")
}

/// 安装全局 tracing 订阅者
///
/// 控制台始终输出；`config.enabled` 时额外写入滚动日志文件，
/// 文件写入器创建失败则只保留控制台。返回的守卫需保持到进程结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let file_writer = if config.enabled {
        match build_file_appender(config) {
            Ok(appender) => Some(tracing_appender::non_blocking(appender)),
            Err(e) => {
                eprintln!("{:#}, 回退到仅控制台输出", e);
                None
            }
        }
    } else {
        None
    };

    let (writer, file_guard) = match file_writer {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    // Option<Layer> 为 None 时不产生任何输出
    let file_layer = writer.map(|writer| {
        fmt::layer()
            .with_timer(local_timer())
            .with_ansi(false)
            .with_writer(writer)
    });

    let installed = tracing_subscriber::registry()
        .with(build_env_filter(&config.level))
        .with(fmt::layer().with_timer(local_timer()))
        .with(file_layer)
        .try_init();

    match (installed, file_guard.is_some()) {
        (Err(e), _) => eprintln!("日志系统已初始化，跳过: {}", e),
        (Ok(()), true) => info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
            config.log_dir, config.retention_days, config.level
        ),
        (Ok(()), false) => info!("日志系统初始化完成（仅控制台输出）, 级别={}", config.level),
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_log_config_defaults_from_empty_toml() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        let config = LogConfig {
            enabled: false,
            ..LogConfig::default()
        };
        let _first = init_logging(&config);
        let _second = init_logging(&config);
    }

    #[test]
    fn test_file_appender_writes_daily_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            log_dir: temp_dir.path().join("nested/logs"),
            ..LogConfig::default()
        };

        let mut appender = build_file_appender(&config).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = fs::read_dir(&config.log_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("cloud-backup-uploader."));
        assert!(names[0].ends_with(".log"));
    }
}
