use anyhow::{Context, Result};
use cloud_backup_uploader::{
    backend::HttpUploadBackend,
    config::AppConfig,
    events::LogReporter,
    logging,
    session::SessionContext,
    uploader::{
        FolderScanner, ScanOptions, UploadError, UploadOrchestrator, UploadResult,
        UploadRunSummary, UploadTarget,
    },
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

const USAGE: &str = "用法: cloud-backup-uploader <本地文件或文件夹> <目标目录> [配置文件]\n      cloud-backup-uploader --init-config [配置文件]";

/// 部分文件失败
const EXIT_PARTIAL_FAILURE: u8 = 1;
/// 被 Ctrl+C 取消
const EXIT_CANCELLED: u8 = 130;

/// 命令行参数
enum CliCommand {
    /// 写出默认配置文件
    InitConfig { config_path: String },
    Upload {
        local_path: PathBuf,
        destination: String,
        config_path: String,
    },
}

fn parse_args() -> Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let first = args.next().context(USAGE)?;
    if first == "--init-config" {
        let config_path = args
            .next()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        return Ok(CliCommand::InitConfig { config_path });
    }

    let destination = args.next().context(USAGE)?;
    let config_path = args
        .next()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    Ok(CliCommand::Upload {
        local_path: PathBuf::from(first),
        destination,
        config_path,
    })
}

/// 从环境变量读取会话
///
/// UPLOADER_USERNAME / UPLOADER_EMAIL 必填，UPLOADER_TOKEN 可选
fn session_from_env() -> Result<SessionContext> {
    let username = std::env::var("UPLOADER_USERNAME").context("缺少环境变量 UPLOADER_USERNAME")?;
    let email = std::env::var("UPLOADER_EMAIL").context("缺少环境变量 UPLOADER_EMAIL")?;

    let session = SessionContext::new(username, email);
    Ok(match std::env::var("UPLOADER_TOKEN") {
        Ok(token) if !token.trim().is_empty() => session.with_token(token.trim()),
        _ => session,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    match parse_args()? {
        CliCommand::InitConfig { config_path } => {
            AppConfig::default()
                .save_to_file(&config_path)
                .await
                .with_context(|| format!("写出默认配置失败: {}", config_path))?;
            println!("已写出默认配置: {}", config_path);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Upload {
            local_path,
            destination,
            config_path,
        } => upload(local_path, destination, config_path).await,
    }
}

/// 执行一次上传，返回进程退出码
///
/// 所有分支都正常返回，日志 guard 随之析构并刷新文件日志
async fn upload(local_path: PathBuf, destination: String, config_path: String) -> Result<ExitCode> {
    // 🔥 先加载配置（日志配置在其中），失败时使用默认配置
    let loaded = AppConfig::load_from_file(&config_path).await;
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let _log_guard = logging::init_logging(&config.log);
    if let Err(e) = &loaded {
        warn!("加载配置失败，使用默认配置: {:#}", e);
    }

    let session = session_from_env()?;
    let backend = Arc::new(HttpUploadBackend::new(&config.backend)?);

    // 事件流 → 日志
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(LogReporter::default().run(event_rx));

    let orchestrator = UploadOrchestrator::new(backend, &config.upload).with_events(event_tx);

    // Ctrl+C 取消上传
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到 Ctrl+C，正在取消上传...");
                cancel.cancel();
            }
        });
    }

    let result = if local_path.is_dir() {
        let outcome = FolderScanner::with_options(ScanOptions::from(&config.scan)).scan(&local_path)?;
        orchestrator
            .upload_scanned(&session, &destination, outcome, &cancel)
            .await
    } else {
        let target = UploadTarget::from_file(&local_path)
            .with_context(|| format!("无法读取文件: {}", local_path.display()))?;
        orchestrator
            .upload_files(&session, &destination, vec![target], &cancel)
            .await
    };

    // 关闭事件发送端，等待日志输出完毕
    drop(orchestrator);
    if let Err(e) = reporter.await {
        warn!("事件输出任务异常: {}", e);
    }

    if let Ok(summary) = &result {
        println!("{}", summary.message);
        for reason in &summary.failure_reasons {
            println!("  ✗ {}", reason);
        }
    }

    match exit_status(&result) {
        Ok(code) => {
            if code == EXIT_CANCELLED {
                warn!("上传已取消");
            }
            Ok(ExitCode::from(code))
        }
        Err(e) => {
            error!("上传未开始: {}", e);
            Err(e.clone().into())
        }
    }
}

/// 运行结果对应的退出码；运行未开始（前置条件等错误）时返回该错误
fn exit_status(result: &UploadResult<UploadRunSummary>) -> Result<u8, &UploadError> {
    match result {
        Ok(summary) if summary.is_success() => Ok(0),
        Ok(_) => Ok(EXIT_PARTIAL_FAILURE),
        Err(UploadError::Cancelled) => Ok(EXIT_CANCELLED),
        Err(e) => Err(e),
    }
}
