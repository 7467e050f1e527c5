//! 文件夹扫描模块
//!
//! 负责:
//! - 递归扫描本地文件夹（walkdir）
//! - 保留目录结构（相对目录写入上传目标）
//! - 按固定大小切分规划批次

use crate::config::ScanConfig;
use crate::uploader::target::{sanitize_name, UploadTarget};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 文件夹扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件不上传
    pub max_file_size: Option<u64>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
}

impl From<&ScanConfig> for ScanOptions {
    fn from(config: &ScanConfig) -> Self {
        Self {
            follow_symlinks: config.follow_symlinks,
            max_file_size: config.max_file_size,
            skip_hidden: config.skip_hidden_files,
        }
    }
}

/// 扫描结果
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// 顶层文件夹名（原始名称）
    pub folder_name: String,
    /// 待上传的文件，按相对路径排序
    pub targets: Vec<UploadTarget>,
    /// 超出大小限制的文件（记为跳过）
    pub oversized: Vec<UploadTarget>,
}

impl ScanOutcome {
    pub fn total_size(&self) -> u64 {
        self.targets.iter().map(|t| t.size).sum()
    }
}

/// 文件夹扫描器
#[derive(Debug, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 递归扫描 `root_path`，收集其中的常规文件
    ///
    /// 相对目录取自文件父目录相对根目录的路径，根目录下的文件为 "."
    pub fn scan<P: AsRef<Path>>(&self, root_path: P) -> Result<ScanOutcome> {
        let root_path = root_path.as_ref();

        match std::fs::metadata(root_path) {
            Err(_) => anyhow::bail!("扫描路径不存在: {}", root_path.display()),
            Ok(meta) if !meta.is_dir() => {
                anyhow::bail!("扫描路径不是文件夹: {}", root_path.display())
            }
            Ok(_) => info!("扫描文件夹: {}", root_path.display()),
        }

        let folder_name = root_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| sanitize_name(&root_path.display().to_string()));

        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root_path)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !(skip_hidden && is_hidden(entry)));

        let mut targets = Vec::new();
        let mut oversized = Vec::new();

        for entry in walker {
            let entry =
                entry.with_context(|| format!("读取目录条目失败: {}", root_path.display()))?;

            if !entry.file_type().is_file() {
                if !entry.file_type().is_dir() {
                    debug!("跳过非常规文件: {}", entry.path().display());
                }
                continue;
            }

            let relative_dir = entry
                .path()
                .parent()
                .and_then(|parent| parent.strip_prefix(root_path).ok())
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default();

            let target = UploadTarget::from_file(entry.path())
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                .with_relative_path(&relative_dir);

            if let Some(max_size) = self.options.max_file_size {
                if target.size > max_size {
                    warn!(
                        "跳过超大文件: {} ({})",
                        entry.path().display(),
                        format_bytes(target.size)
                    );
                    oversized.push(target);
                    continue;
                }
            }

            debug!(
                "扫描到文件: {} ({})",
                target.file_key(),
                format_bytes(target.size)
            );
            targets.push(target);
        }

        // 同一目录的文件相邻，批次内目录结构连续
        targets.sort_by(|a, b| {
            (&a.relative_path, &a.sanitized_name).cmp(&(&b.relative_path, &b.sanitized_name))
        });

        let outcome = ScanOutcome {
            folder_name,
            targets,
            oversized,
        };

        info!(
            "文件夹扫描完成: {} 个文件，总大小 {}，超限 {} 个",
            outcome.targets.len(),
            format_bytes(outcome.total_size()),
            outcome.oversized.len()
        );

        Ok(outcome)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// 按固定大小切分批次（最后一批可能较小）
pub fn partition_batches(targets: Vec<UploadTarget>, batch_size: usize) -> Vec<Vec<UploadTarget>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(targets.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);

    for target in targets {
        current.push(target);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

/// 字节数转为可读大小（B / KB / MB / GB / TB）
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
