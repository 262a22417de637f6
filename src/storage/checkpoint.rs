use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::document::FeedPosition;
use crate::core::key::EncodedKey;
use crate::index::{DocUpdate, ViewSnapshot};
use crate::storage::snapshot::{SnapshotStore, ViewImage};
use crate::storage::wal::{BatchRecord, WalStore};
use crate::storage::StoredDoc;

/// 从快照 + WAL 恢复出的视图状态
#[derive(Debug)]
pub struct RecoveredView {
    pub position: FeedPosition,
    pub docs: Vec<DocUpdate>,
    pub replayed_batches: usize,
    pub truncated_tail_records: usize,
}

/// 单视图的持久 checkpoint：`<dir>/index.db` + `<dir>/batches.wal*`。
///
/// 每个批次先写 WAL 再发布；每 N 个批次切 seal 并写完整快照。
/// 回放是幂等的（记录的是文档级整体替换）。
pub struct CheckpointStore {
    dir: PathBuf,
    signature: u64,
    feed_epoch: u64,
    snapshot: SnapshotStore,
    wal: Arc<WalStore>,
}

impl CheckpointStore {
    pub fn open(dir: PathBuf, signature: u64, feed_epoch: u64) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let wal = Arc::new(WalStore::open_in_dir(dir.clone())?);
        Ok(Self {
            snapshot: SnapshotStore::new(dir.join("index.db")),
            dir,
            signature,
            feed_epoch,
            wal,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// WAL 的同步文件 IO 放到阻塞线程池执行
    async fn with_wal<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&WalStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let wal = self.wal.clone();
        tokio::task::spawn_blocking(move || f(&wal)).await?
    }

    /// 读取持久状态；不存在、已损坏、签名或流 epoch 不符、
    /// 或位置超出流当前 `tail` 时返回 None（调用方走全量构建）
    pub async fn recover(&self, tail: &FeedPosition) -> anyhow::Result<Option<RecoveredView>> {
        let Some(img) = self.snapshot.load_if_valid().await? else {
            self.with_wal(|w| w.reset()).await?;
            return Ok(None);
        };
        if img.signature != self.signature {
            tracing::warn!(
                "View definition changed ({:#x} -> {:#x}), discarding persisted state in {}",
                img.signature,
                self.signature,
                self.dir.display()
            );
            self.with_wal(|w| w.reset()).await?;
            return Ok(None);
        }
        if img.feed_epoch != self.feed_epoch {
            tracing::warn!(
                "Change feed changed (epoch {:#x} -> {:#x}), discarding persisted state in {}",
                img.feed_epoch,
                self.feed_epoch,
                self.dir.display()
            );
            self.with_wal(|w| w.reset()).await?;
            return Ok(None);
        }

        let seal_id = img.seal_id;
        let replay = self.with_wal(move |w| w.replay_since_seal(seal_id)).await?;
        let mut docs: BTreeMap<String, DocUpdate> = BTreeMap::new();
        for d in img.docs {
            let u = d.into_update()?;
            docs.insert(u.doc_id.clone(), u);
        }
        let mut position = img.position;
        let replayed = replay.batches.len();
        for batch in replay.batches {
            for d in batch.docs {
                let u = d.into_update()?;
                if u.entries.is_empty() {
                    docs.remove(&u.doc_id);
                } else {
                    docs.insert(u.doc_id.clone(), u);
                }
            }
            merge_position(&mut position, &batch.position);
        }

        if let Some((p, seq)) = position
            .iter()
            .find(|(p, seq)| **seq > tail.get(*p).copied().unwrap_or(0))
        {
            tracing::warn!(
                "Persisted position {}:{} is ahead of the change feed, discarding state in {}",
                p,
                seq,
                self.dir.display()
            );
            self.with_wal(|w| w.reset()).await?;
            return Ok(None);
        }

        if replay.truncated_tail_records > 0 {
            tracing::warn!(
                "WAL tail truncated in {}: {} record(s) dropped",
                self.dir.display(),
                replay.truncated_tail_records
            );
        }

        Ok(Some(RecoveredView {
            position,
            docs: docs.into_values().collect(),
            replayed_batches: replayed,
            truncated_tail_records: replay.truncated_tail_records,
        }))
    }

    /// 记录一个已应用批次（发布前调用；返回时已 fsync）
    pub async fn record_batch(
        &self,
        position: &FeedPosition,
        updates: &[DocUpdate],
    ) -> anyhow::Result<()> {
        let record = BatchRecord {
            position: position.clone(),
            docs: updates.iter().map(StoredDoc::from_update).collect(),
        };
        self.with_wal(move |w| w.append(&record)).await
    }

    /// 切 seal 并写完整快照，随后清理已被快照覆盖的 sealed WAL
    pub async fn write_snapshot(&self, snap: &ViewSnapshot) -> anyhow::Result<()> {
        let seal_id = self.with_wal(|w| w.seal()).await?;
        let img = ViewImage {
            signature: self.signature,
            feed_epoch: self.feed_epoch,
            seal_id,
            position: snap.position.clone(),
            docs: stored_docs(snap),
        };
        self.snapshot.write_atomic(img).await?;
        self.with_wal(move |w| w.cleanup_sealed_up_to(seal_id)).await?;
        Ok(())
    }

    /// 丢弃全部持久状态
    pub async fn reset(&self) -> anyhow::Result<()> {
        if self.snapshot.path().exists() {
            tokio::fs::remove_file(self.snapshot.path()).await?;
        }
        self.with_wal(|w| w.reset()).await
    }
}

fn merge_position(into: &mut FeedPosition, from: &FeedPosition) {
    for (p, seq) in from {
        let cur = into.entry(*p).or_insert(0);
        *cur = (*cur).max(*seq);
    }
}

/// 树中条目按文档归并（文档内按 ordinal）
fn stored_docs(snap: &ViewSnapshot) -> Vec<StoredDoc> {
    let mut by_doc: BTreeMap<String, Vec<(u32, EncodedKey, String)>> = BTreeMap::new();
    for e in snap.tree.iter() {
        by_doc.entry(e.id.doc_id.clone()).or_default().push((
            e.id.ordinal,
            e.id.key.clone(),
            e.value.to_string(),
        ));
    }
    by_doc
        .into_iter()
        .map(|(doc_id, mut entries)| {
            entries.sort_by_key(|(o, _, _)| *o);
            StoredDoc {
                doc_id,
                entries: entries.into_iter().map(|(_, k, v)| (k, v)).collect(),
            }
        })
        .collect()
}
