use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 变更流位置：分区 → 该分区已应用的最后一个 seq
pub type FeedPosition = BTreeMap<u32, u64>;

/// 源文档（由外部存储拥有）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub revision: String,
    pub content: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, revision: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            revision: revision.into(),
            content,
        }
    }

    /// 读取顶层字段；缺失字段按 null 处理（与 JS 中 undefined 发射为 null 一致）
    pub fn field(&self, name: &str) -> &Value {
        self.content.get(name).unwrap_or(&Value::Null)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.content.get("type").and_then(Value::as_str)
    }
}

/// 变更类型
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// 新建或更新：携带当前内容
    Upsert(Value),
    Delete,
}

/// 变更流中的一条记录（按分区内 seq 严格有序）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub partition: u32,
    pub seq: u64,
    pub doc_id: String,
    pub revision: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ChangeKind::Delete)
    }

    /// 还原为文档（删除事件返回 None）
    pub fn document(&self) -> Option<Document> {
        match &self.kind {
            ChangeKind::Upsert(content) => Some(Document {
                id: self.doc_id.clone(),
                revision: self.revision.clone(),
                content: content.clone(),
            }),
            ChangeKind::Delete => None,
        }
    }
}
