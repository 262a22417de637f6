use thiserror::Error;

/// 键组件无法保序编码 / 解码。
///
/// 只让单条 emission 失败，不影响同一文档的其他 emission。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("key component of kind '{kind}' is not orderable")]
    UnsupportedKind { kind: &'static str },

    #[error("non-finite numbers cannot be used as key components")]
    NonFiniteNumber,

    #[error("malformed encoded key")]
    Malformed,
}

/// map 函数在某个文档上执行失败（该文档原有条目保持不变）
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("map of view '{view}' failed on document '{doc_id}': {reason}")]
pub struct MapError {
    pub view: String,
    pub doc_id: String,
    pub reason: String,
}

/// 查询参数组合非法 / 目标视图不存在：在查询入口同步拒绝
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown view '{0}'")]
    UnknownView(String),

    #[error("invalid query options: {0}")]
    Configuration(String),

    #[error("query key could not be encoded: {0}")]
    Encoding(#[from] EncodingError),
}

/// 索引结构不变量被破坏（排序 / 聚合），触发该视图的全量重建
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StructureError {
    #[error("entries out of order at position {position}")]
    OutOfOrder { position: usize },

    #[error("aggregate mismatch in subtree rooted at position {position}")]
    AggregateMismatch { position: usize },

    #[error("node bookkeeping (height/len) inconsistent at position {position}")]
    Bookkeeping { position: usize },

    #[error("doc-id index disagrees with tree contents for '{doc_id}'")]
    DocIndexMismatch { doc_id: String },
}
