pub mod checkpoint;
pub mod snapshot;
pub mod wal;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::key::EncodedKey;
use crate::index::DocUpdate;

/// 落盘形式的单文档条目集。
///
/// value 以 JSON 文本保存：bincode 无法反序列化自描述的 `serde_json::Value`。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub doc_id: String,
    pub entries: Vec<(EncodedKey, String)>,
}

impl StoredDoc {
    pub fn from_update(u: &DocUpdate) -> Self {
        Self {
            doc_id: u.doc_id.clone(),
            entries: u
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        }
    }

    pub fn into_update(self) -> anyhow::Result<DocUpdate> {
        let entries = self
            .entries
            .into_iter()
            .map(|(k, v)| -> anyhow::Result<(EncodedKey, Value)> {
                Ok((k, serde_json::from_str(&v)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(DocUpdate::new(self.doc_id, entries))
    }
}

pub use checkpoint::{CheckpointStore, RecoveredView};
pub use snapshot::{SnapshotStore, ViewImage};
pub use wal::{BatchRecord, WalReplayResult, WalStore};
