// 分片规划
//
// 向后端请求每个文件的分片上传地址：
// - 单文件模式：每个文件一次 plan-upload 请求
// - 文件夹模式：每批一次 plan-upload-batch 请求，按 (fileName, relativePath) 重新分组
// - 刷新：以相同范围重新规划该文件，按分片位置找到替换地址
//
// 后端不保证返回顺序，分片列表一律按序号排序后再做覆盖校验

use crate::backend::{PlanResponse, PlanUploadBatchRequest, PlanUploadRequest, UploadBackend};
use crate::session::SessionContext;
use crate::uploader::chunk::{validate_tiling, ChunkDescriptor};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::target::{file_key, normalize_relative_path, UploadTarget};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 规划范围（刷新时沿用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanScope {
    /// 单文件规划，目标目录
    Single { folder_name: String },
    /// 批量规划，目标根目录
    Batch { base_folder_name: String },
}

/// 分片规划器
#[derive(Clone)]
pub struct ChunkPlanner {
    backend: Arc<dyn UploadBackend>,
}

impl ChunkPlanner {
    pub fn new(backend: Arc<dyn UploadBackend>) -> Self {
        Self { backend }
    }

    /// 单文件规划
    pub async fn plan_file(
        &self,
        session: &SessionContext,
        folder_name: &str,
        target: &UploadTarget,
    ) -> UploadResult<Vec<ChunkDescriptor>> {
        let request = PlanUploadRequest::new(session, folder_name, target);
        let response = self
            .backend
            .plan_upload(session, &request)
            .await
            .map_err(|e| UploadError::Planning(format!("{}: {}", target.name, e)))?;

        if response.success_urls.is_empty() {
            return Err(empty_response_error(&response, target));
        }

        // 单文件请求只对应一个文件，全部行都属于它
        let mut chunks = parse_rows(&response)?;
        chunks.sort_by_key(|c| c.chunk_index);
        validate_tiling(&chunks, target.size)?;

        info!(
            "文件规划完成: {}, 分片数={}, 大小={} bytes",
            target.file_key(),
            chunks.len(),
            target.size
        );
        Ok(chunks)
    }

    /// 批量规划
    ///
    /// 请求失败或任一行无法解析时整批失败；返回按文件键分组、已排序的分片
    pub async fn plan_batch(
        &self,
        session: &SessionContext,
        base_folder_name: &str,
        batch: &[UploadTarget],
    ) -> UploadResult<HashMap<String, Vec<ChunkDescriptor>>> {
        let request = PlanUploadBatchRequest::new(session, base_folder_name, batch);
        let response = self
            .backend
            .plan_upload_batch(session, &request)
            .await
            .map_err(|e| UploadError::Planning(format!("批量规划请求失败: {}", e)))?;

        if let Some(errors) = response.error_summary() {
            warn!("批量规划返回错误信息: {}", errors);
        }

        let mut groups: HashMap<String, Vec<ChunkDescriptor>> = HashMap::new();
        for chunk in parse_rows(&response)? {
            let key = file_key(&chunk.file_name, &normalize_relative_path(&chunk.relative_path));
            groups.entry(key).or_default().push(chunk);
        }
        for chunks in groups.values_mut() {
            chunks.sort_by_key(|c| c.chunk_index);
        }

        info!(
            "批量规划完成: 请求 {} 个文件, 返回 {} 个文件的分片",
            batch.len(),
            groups.len()
        );
        Ok(groups)
    }

    /// 从批量规划结果中取出某个文件的分片并校验
    ///
    /// 没有该文件的行时为 NoDestinations，只影响这一个文件
    pub fn take_file_plan(
        groups: &mut HashMap<String, Vec<ChunkDescriptor>>,
        target: &UploadTarget,
    ) -> UploadResult<Vec<ChunkDescriptor>> {
        let key = target.file_key();
        let chunks = groups
            .remove(&key)
            .filter(|chunks| !chunks.is_empty())
            .ok_or(UploadError::NoDestinations { file_key: key })?;
        validate_tiling(&chunks, target.size)?;
        Ok(chunks)
    }

    /// 按范围规划单个文件
    pub async fn plan_in_scope(
        &self,
        session: &SessionContext,
        scope: &PlanScope,
        target: &UploadTarget,
    ) -> UploadResult<Vec<ChunkDescriptor>> {
        match scope {
            PlanScope::Single { folder_name } => self.plan_file(session, folder_name, target).await,
            PlanScope::Batch { base_folder_name } => {
                let mut groups = self
                    .plan_batch(session, base_folder_name, std::slice::from_ref(target))
                    .await?;
                Self::take_file_plan(&mut groups, target)
            }
        }
    }

    /// 刷新失败分片的上传地址
    ///
    /// 重新规划该文件，按 (文件名, 相对路径, 序号, 起止字节, 总大小) 匹配替换分片；
    /// 找不到匹配（例如后端改变了分片边界）时返回 Refresh 错误，不再重试
    pub async fn refresh(
        &self,
        session: &SessionContext,
        scope: &PlanScope,
        target: &UploadTarget,
        failed: &ChunkDescriptor,
    ) -> UploadResult<ChunkDescriptor> {
        let refresh_error = |reason: String| UploadError::Refresh {
            chunk_index: failed.chunk_index,
            reason,
        };

        let chunks = self
            .plan_in_scope(session, scope, target)
            .await
            .map_err(|e| refresh_error(e.to_string()))?;

        let replacement = chunks
            .into_iter()
            .find(|c| c.same_slot(failed))
            .ok_or_else(|| {
                refresh_error(format!(
                    "新的规划结果中没有字节范围 {}-{} 的分片",
                    failed.start_byte, failed.end_byte
                ))
            })?;

        debug!(
            "刷新上传地址成功: {}, 分片 #{}",
            failed.file_key(),
            failed.chunk_index
        );
        Ok(replacement)
    }
}

fn parse_rows(response: &PlanResponse) -> UploadResult<Vec<ChunkDescriptor>> {
    response
        .success_urls
        .iter()
        .map(ChunkDescriptor::try_from)
        .collect()
}

fn empty_response_error(response: &PlanResponse, target: &UploadTarget) -> UploadError {
    match response.error_summary() {
        Some(errors) => UploadError::Planning(format!("{}: {}", target.name, errors)),
        None => UploadError::NoDestinations {
            file_key: target.file_key(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, PlanErrorMessage, RawDestination};
    use crate::uploader::mock::MockBackend;
    use async_trait::async_trait;

    fn session() -> SessionContext {
        SessionContext::new("alice", "alice@example.com")
    }

    fn row(name: &str, rel: Option<&str>, index: u32, start: u64, end: u64, total: u64) -> RawDestination {
        RawDestination {
            file_name: Some(name.to_string()),
            relative_path: rel.map(str::to_string),
            upload_url: Some(format!("https://s/{}/{}", name, index)),
            chunk_index: Some(index.to_string()),
            start_byte: Some(start.to_string()),
            end_byte: Some(end.to_string()),
            total_size: Some(total.to_string()),
            session_id: Some("sess".to_string()),
        }
    }

    /// 返回固定响应的后端
    struct FixedBackend {
        response: PlanResponse,
    }

    #[async_trait]
    impl UploadBackend for FixedBackend {
        async fn plan_upload(
            &self,
            _session: &SessionContext,
            _request: &PlanUploadRequest,
        ) -> Result<PlanResponse, BackendError> {
            Ok(self.response.clone())
        }

        async fn plan_upload_batch(
            &self,
            _session: &SessionContext,
            _request: &PlanUploadBatchRequest,
        ) -> Result<PlanResponse, BackendError> {
            Ok(self.response.clone())
        }

        async fn put_chunk(&self, _d: &ChunkDescriptor, _body: Vec<u8>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn fixed(rows: Vec<RawDestination>, errors: &[&str]) -> ChunkPlanner {
        ChunkPlanner::new(Arc::new(FixedBackend {
            response: PlanResponse {
                success_urls: rows,
                error_messages: errors
                    .iter()
                    .map(|e| PlanErrorMessage {
                        error: e.to_string(),
                    })
                    .collect(),
            },
        }))
    }

    #[tokio::test]
    async fn test_plan_file_sorts_out_of_order_rows() {
        let planner = fixed(
            vec![
                row("a.bin", None, 2, 8, 10, 10),
                row("a.bin", None, 0, 0, 4, 10),
                row("a.bin", None, 1, 4, 8, 10),
            ],
            &[],
        );
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]);

        let chunks = planner.plan_file(&session(), "/backup", &target).await.unwrap();
        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_plan_file_without_rows() {
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]);

        let err = fixed(vec![], &[]).plan_file(&session(), "/b", &target).await.unwrap_err();
        assert_eq!(
            err,
            UploadError::NoDestinations {
                file_key: "a.bin|.".to_string()
            }
        );

        let err = fixed(vec![], &["quota exceeded"])
            .plan_file(&session(), "/b", &target)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Planning(msg) if msg.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_plan_file_rejects_bad_tiling_and_fields() {
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]);

        let gap = fixed(
            vec![row("a.bin", None, 0, 0, 4, 10), row("a.bin", None, 1, 5, 10, 10)],
            &[],
        );
        assert!(matches!(
            gap.plan_file(&session(), "/b", &target).await,
            Err(UploadError::Planning(_))
        ));

        let mut broken = row("a.bin", None, 0, 0, 10, 10);
        broken.start_byte = Some("zero".to_string());
        assert!(matches!(
            fixed(vec![broken], &[]).plan_file(&session(), "/b", &target).await,
            Err(UploadError::Planning(_))
        ));
    }

    #[tokio::test]
    async fn test_plan_batch_regroups_rows() {
        let planner = fixed(
            vec![
                row("b.txt", Some("docs"), 1, 3, 6, 6),
                row("a.txt", Some("."), 0, 0, 2, 2),
                row("b.txt", Some("docs/"), 0, 0, 3, 6),
                row("b.txt", None, 0, 0, 1, 1),
            ],
            &[],
        );
        let batch = vec![
            UploadTarget::from_bytes("a.txt", vec![0; 2]),
            UploadTarget::from_bytes("b.txt", vec![0; 6]).with_relative_path("docs"),
            UploadTarget::from_bytes("b.txt", vec![0; 1]),
            UploadTarget::from_bytes("missing.txt", vec![0; 4]),
        ];

        let mut groups = planner.plan_batch(&session(), "/backup/f", &batch).await.unwrap();
        assert_eq!(groups.len(), 3);

        let docs = ChunkPlanner::take_file_plan(&mut groups, &batch[1]).unwrap();
        assert_eq!(docs.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1]);

        assert_eq!(ChunkPlanner::take_file_plan(&mut groups, &batch[0]).unwrap().len(), 1);
        assert_eq!(ChunkPlanner::take_file_plan(&mut groups, &batch[2]).unwrap().len(), 1);
        assert_eq!(
            ChunkPlanner::take_file_plan(&mut groups, &batch[3]).unwrap_err(),
            UploadError::NoDestinations {
                file_key: "missing.txt|.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_plan_batch_unparseable_row_fails_batch() {
        let mut broken = row("b.txt", None, 0, 0, 3, 3);
        broken.upload_url = None;
        let planner = fixed(vec![row("a.txt", None, 0, 0, 2, 2), broken], &[]);
        let batch = vec![
            UploadTarget::from_bytes("a.txt", vec![0; 2]),
            UploadTarget::from_bytes("b.txt", vec![0; 3]),
        ];

        assert!(matches!(
            planner.plan_batch(&session(), "/f", &batch).await,
            Err(UploadError::Planning(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_finds_matching_slot() {
        let backend = Arc::new(MockBackend::new(4));
        let planner = ChunkPlanner::new(backend.clone());
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]);
        let scope = PlanScope::Single {
            folder_name: "/backup".to_string(),
        };

        let chunks = planner.plan_in_scope(&session(), &scope, &target).await.unwrap();
        let replacement = planner
            .refresh(&session(), &scope, &target, &chunks[1])
            .await
            .unwrap();

        assert!(replacement.same_slot(&chunks[1]));
        assert_ne!(replacement.upload_url, chunks[1].upload_url);
        assert_eq!(backend.plan_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_in_batch_scope_uses_one_file_batch() {
        let backend = Arc::new(MockBackend::new(4));
        let planner = ChunkPlanner::new(backend.clone());
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]).with_relative_path("sub");
        let scope = PlanScope::Batch {
            base_folder_name: "/backup/f".to_string(),
        };

        let chunks = planner.plan_in_scope(&session(), &scope, &target).await.unwrap();
        planner
            .refresh(&session(), &scope, &target, &chunks[2])
            .await
            .unwrap();

        assert_eq!(backend.batch_sizes(), vec![1, 1]);
        assert_eq!(backend.plan_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_miss_when_boundaries_change() {
        let backend = Arc::new(MockBackend::new(4).shift_on_replan());
        let planner = ChunkPlanner::new(backend);
        let target = UploadTarget::from_bytes("a.bin", vec![0; 10]);
        let scope = PlanScope::Single {
            folder_name: "/backup".to_string(),
        };

        let chunks = planner.plan_in_scope(&session(), &scope, &target).await.unwrap();
        let err = planner
            .refresh(&session(), &scope, &target, &chunks[0])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Refresh { chunk_index: 0, .. }));
    }
}
