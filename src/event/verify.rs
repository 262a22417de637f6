use crate::core::error::StructureError;
use crate::event::indexer::ViewIndexer;

#[derive(Debug, PartialEq)]
pub enum VerifyOutcome {
    Healthy,
    /// 发现结构损坏并已全量重建
    Rebuilt(StructureError),
}

/// 结构校验：条目严格有序、每个节点聚合与子树重算一致、doc 索引与树一致；
/// 任何不一致都触发该视图的全量重建。
pub async fn verify_and_repair(indexer: &ViewIndexer) -> anyhow::Result<VerifyOutcome> {
    let name = &indexer.view().name;
    match indexer.store().verify() {
        Ok(()) => {
            tracing::debug!("View {}: structure check passed", name);
            Ok(VerifyOutcome::Healthy)
        }
        Err(e) => {
            tracing::error!("View {}: structure check failed: {}", name, e);
            indexer.rebuild(&e.to_string()).await?;
            Ok(VerifyOutcome::Rebuilt(e))
        }
    }
}
