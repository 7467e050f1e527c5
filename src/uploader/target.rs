// 上传目标定义
//
// 一个 UploadTarget 对应用户选择的一个文件，或文件夹树中的一个条目

use crate::uploader::error::{UploadError, UploadResult};
use regex::Regex;
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// 平铺文件（不在子目录中）的相对路径
pub const FLAT_RELATIVE_PATH: &str = ".";

/// 文件内容来源
#[derive(Debug, Clone)]
pub enum ContentSource {
    /// 内存中的字节
    Memory(Arc<Vec<u8>>),
    /// 本地文件
    File(PathBuf),
}

impl ContentSource {
    /// 读取 [start, end) 字节范围
    pub async fn read_range(&self, start: u64, end: u64) -> UploadResult<Vec<u8>> {
        if end < start {
            return Err(UploadError::Io(format!("无效的字节范围: {}-{}", start, end)));
        }

        match self {
            ContentSource::Memory(bytes) => {
                let len = bytes.len() as u64;
                if end > len {
                    return Err(UploadError::Io(format!(
                        "字节范围越界: {}-{}, 内容大小 {}",
                        start, end, len
                    )));
                }
                Ok(bytes[start as usize..end as usize].to_vec())
            }
            ContentSource::File(path) => {
                let path = path.clone();
                let size = (end - start) as usize;

                tokio::task::spawn_blocking(move || -> UploadResult<Vec<u8>> {
                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(start))?;

                    let mut buffer = vec![0u8; size];
                    file.read_exact(&mut buffer)?;

                    debug!(
                        "读取分片数据: {:?}, bytes={}-{}, 大小={} bytes",
                        path,
                        start,
                        end.saturating_sub(1),
                        size
                    );
                    Ok(buffer)
                })
                .await
                .map_err(|e| UploadError::Io(format!("读取任务异常: {}", e)))?
            }
        }
    }
}

/// 上传目标
#[derive(Debug, Clone)]
pub struct UploadTarget {
    /// 内容句柄
    pub content: ContentSource,
    /// 显示名称（原始文件名）
    pub name: String,
    /// 清理后的文件名（发送给后端）
    pub sanitized_name: String,
    /// 相对于提交根目录的目录路径，平铺文件为 "."
    pub relative_path: String,
    /// 文件大小（字节）
    pub size: u64,
}

impl UploadTarget {
    /// 从内存字节创建
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            sanitized_name: sanitize_name(&name),
            size: bytes.len() as u64,
            content: ContentSource::Memory(Arc::new(bytes)),
            name,
            relative_path: FLAT_RELATIVE_PATH.to_string(),
        }
    }

    /// 从本地文件创建（读取当前文件大小）
    pub fn from_file(path: impl AsRef<Path>) -> UploadResult<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(UploadError::Precondition(format!(
                "不是常规文件: {}",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            sanitized_name: sanitize_name(&name),
            name,
            relative_path: FLAT_RELATIVE_PATH.to_string(),
            size: metadata.len(),
            content: ContentSource::File(path.to_path_buf()),
        })
    }

    /// 设置文件夹内的相对目录
    pub fn with_relative_path(mut self, relative_path: &str) -> Self {
        self.relative_path = normalize_relative_path(relative_path);
        self
    }

    /// 指定发送给后端的文件名（重试重命名过的文件时使用汇总记录中的名称）
    pub fn with_sanitized_name(mut self, sanitized_name: impl Into<String>) -> Self {
        self.sanitized_name = sanitized_name.into();
        self
    }

    /// 进度/分组键：`fileName|relativePath`
    pub fn file_key(&self) -> String {
        file_key(&self.sanitized_name, &self.relative_path)
    }
}

/// 构造文件键
pub fn file_key(file_name: &str, relative_path: &str) -> String {
    format!("{}|{}", file_name, relative_path)
}

fn unsafe_chars() -> &'static Regex {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    UNSAFE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}._ \-]").expect("文件名过滤正则无效"))
}

/// 清理文件名，使其可安全用于存储路径和 CSV 字段
///
/// 字母、数字、`.`、`_`、空格、`-` 之外的字符替换为 `_`
pub fn sanitize_name(name: &str) -> String {
    let replaced = unsafe_chars().replace_all(name, "_");
    let trimmed = replaced.trim();

    match trimmed {
        "" => "_".to_string(),
        "." | ".." => "_".repeat(trimmed.len()),
        _ => trimmed.to_string(),
    }
}

/// 规范化相对目录：逐段清理，去掉空段和 "."，空路径返回 "."
pub fn normalize_relative_path(relative_path: &str) -> String {
    let segments: Vec<String> = relative_path
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .map(sanitize_name)
        .collect();

    if segments.is_empty() {
        FLAT_RELATIVE_PATH.to_string()
    } else {
        segments.join("/")
    }
}

/// 保证同一次运行中文件键唯一
///
/// 不同原始名称清理后可能相同（`a,b.txt` 与 `a;b.txt` 都是 `a_b.txt`），
/// 按提交顺序，后出现的文件改名为 `stem_1.ext`、`stem_2.ext`……
/// `taken` 为已占用的键，调用后包含全部目标的键。返回改名的文件数
pub fn dedupe_file_keys(targets: &mut [UploadTarget], taken: &mut HashSet<String>) -> usize {
    let mut renamed = 0;

    for target in targets.iter_mut() {
        if taken.insert(target.file_key()) {
            continue;
        }

        let (stem, ext) = split_extension(&target.sanitized_name);
        let mut n = 1;
        let unique = loop {
            let candidate = format!("{}_{}{}", stem, n, ext);
            if taken.insert(file_key(&candidate, &target.relative_path)) {
                break candidate;
            }
            n += 1;
        };

        warn!(
            "文件名清理后重复: {} → {} (目录 {})",
            target.name, unique, target.relative_path
        );
        target.sanitized_name = unique;
        renamed += 1;
    }

    renamed
}

/// 拆分扩展名，隐藏文件（`.env`）视为无扩展名
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

/// 拼接远程目录
pub fn join_remote_path(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_matches('/');
    if child.is_empty() {
        if base.is_empty() {
            "/".to_string()
        } else {
            base.to_string()
        }
    } else {
        format!("{}/{}", base, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_name("a,b;c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_name("my file (1).txt"), "my file _1_.txt");
        assert_eq!(sanitize_name("照片 2024.jpg"), "照片 2024.jpg");
        assert_eq!(sanitize_name("  "), "_");
        assert_eq!(sanitize_name(".."), "__");
        assert_eq!(sanitize_name("x|y"), "x_y");
    }

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path(""), ".");
        assert_eq!(normalize_relative_path("."), ".");
        assert_eq!(normalize_relative_path("a/b"), "a/b");
        assert_eq!(normalize_relative_path("a\\b\\"), "a/b");
        assert_eq!(normalize_relative_path("./a/../b"), "a/__/b");
        assert_eq!(normalize_relative_path("a,1/b"), "a_1/b");
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/backup", "photos"), "/backup/photos");
        assert_eq!(join_remote_path("/backup/", "/photos/"), "/backup/photos");
        assert_eq!(join_remote_path("/", "photos"), "/photos");
        assert_eq!(join_remote_path("/backup", ""), "/backup");
    }

    #[test]
    fn test_target_from_bytes() {
        let target = UploadTarget::from_bytes("a,b.txt", vec![1, 2, 3]);
        assert_eq!(target.name, "a,b.txt");
        assert_eq!(target.sanitized_name, "a_b.txt");
        assert_eq!(target.relative_path, ".");
        assert_eq!(target.size, 3);
        assert_eq!(target.file_key(), "a_b.txt|.");

        let target = target.with_relative_path("docs/2024");
        assert_eq!(target.file_key(), "a_b.txt|docs/2024");
    }

    #[test]
    fn test_dedupe_file_keys() {
        let mut targets = vec![
            UploadTarget::from_bytes("a,b.txt", vec![1]),
            UploadTarget::from_bytes("a;b.txt", vec![2]),
            UploadTarget::from_bytes("a|b.txt", vec![3]),
            UploadTarget::from_bytes("a_b_1.txt", vec![4]),
            UploadTarget::from_bytes("a,b.txt", vec![5]).with_relative_path("sub"),
            UploadTarget::from_bytes("x,y", vec![6]),
            UploadTarget::from_bytes("x;y", vec![7]),
        ];

        let mut taken = HashSet::new();
        let renamed = dedupe_file_keys(&mut targets, &mut taken);

        let keys: Vec<String> = targets.iter().map(|t| t.file_key()).collect();
        assert_eq!(
            keys,
            vec![
                "a_b.txt|.",
                "a_b_1.txt|.",
                "a_b_2.txt|.",
                "a_b_1_1.txt|.",
                "a_b.txt|sub",
                "x_y|.",
                "x_y_1|.",
            ]
        );
        assert_eq!(renamed, 4);
        assert_eq!(taken.len(), 7);
        // 原始名称不变
        assert_eq!(targets[1].name, "a;b.txt");
    }

    #[test]
    fn test_dedupe_respects_taken_keys() {
        let mut taken: HashSet<String> = ["big.iso|.".to_string()].into_iter().collect();
        let mut targets = vec![UploadTarget::from_bytes("big.iso", vec![1])];

        assert_eq!(dedupe_file_keys(&mut targets, &mut taken), 1);
        assert_eq!(targets[0].sanitized_name, "big_1.iso");
    }

    #[tokio::test]
    async fn test_read_range_memory() {
        let content = ContentSource::Memory(Arc::new((0u8..10).collect()));
        assert_eq!(content.read_range(2, 5).await.unwrap(), vec![2, 3, 4]);
        assert!(content.read_range(8, 11).await.is_err());
        assert!(content.read_range(5, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_read_range_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let target = UploadTarget::from_file(&path).unwrap();
        assert_eq!(target.size, 11);
        assert_eq!(target.name, "data.bin");

        let slice = target.content.read_range(6, 11).await.unwrap();
        assert_eq!(slice, b"world");
    }

    #[test]
    fn test_from_file_rejects_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(UploadTarget::from_file(temp_dir.path()).is_err());
    }
}
