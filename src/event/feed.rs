use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Notify;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::core::document::{ChangeEvent, ChangeKind, Document, FeedPosition};

/// 文档存储对索引引擎暴露的契约：全量读取 + 按分区有序、可续读的变更流。
///
/// 每个分区内 seq 严格递增；`read` 返回 seq > `after_seq` 的至多 `limit` 条。
pub trait ChangeFeed: Send + Sync {
    fn partitions(&self) -> u32;

    /// 流的身份。seq 只在同一 epoch 内可比；持久化的位置遇到不同 epoch 一律作废
    fn epoch(&self) -> u64;

    fn read(&self, partition: u32, after_seq: u64, limit: usize) -> anyhow::Result<Vec<ChangeEvent>>;

    /// 分区当前最新 seq（无事件时为 0）
    fn tail(&self, partition: u32) -> u64;

    /// 全部当前文档，以及与之一致的流位置
    fn list_all(&self) -> anyhow::Result<(Vec<Document>, FeedPosition)>;

    /// 有新事件写入时被唤醒（只是提示，消费方仍需轮询兜底）
    fn notifier(&self) -> Arc<Notify>;

    fn tail_position(&self) -> FeedPosition {
        (0..self.partitions()).map(|p| (p, self.tail(p))).collect()
    }
}

/// 流位置之差：`tail` 领先 `pos` 的事件数
pub fn lag_between(tail: &FeedPosition, pos: &FeedPosition) -> u64 {
    tail.iter()
        .map(|(p, t)| t.saturating_sub(pos.get(p).copied().unwrap_or(0)))
        .sum()
}

#[derive(Default)]
struct MemoryInner {
    docs: HashMap<String, Document>,
    /// 每分区的变更日志；下标 i 的事件 seq = i + 1
    logs: Vec<Vec<ChangeEvent>>,
}

/// 内存文档存储（测试与命令行驱动用）。
///
/// 文档按 `xxh3(id) % partitions` 分配到分区；revision 形如 `<generation>-<hash>`。
pub struct MemoryStore {
    partitions: u32,
    epoch: u64,
    inner: RwLock<MemoryInner>,
    notify: Arc<Notify>,
}

static STORE_SEQ: AtomicU64 = AtomicU64::new(0);

impl MemoryStore {
    /// 每个实例一个新 epoch：日志从 seq 1 重新开始，旧位置不可复用
    pub fn new(partitions: u32) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut seed = Vec::with_capacity(28);
        seed.extend_from_slice(&nanos.to_le_bytes());
        seed.extend_from_slice(&std::process::id().to_le_bytes());
        seed.extend_from_slice(&STORE_SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        Self::with_epoch(partitions, xxh3_64(&seed))
    }

    /// 指定 epoch。调用方需保证同一 epoch 下写入序列可重现
    /// （例如按同一份输入文件、同一顺序加载）
    pub fn with_epoch(partitions: u32, epoch: u64) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions,
            epoch: xxh3_64_with_seed(&epoch.to_le_bytes(), partitions as u64),
            inner: RwLock::new(MemoryInner {
                docs: HashMap::new(),
                logs: vec![Vec::new(); partitions as usize],
            }),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn partition_of(&self, doc_id: &str) -> u32 {
        (xxh3_64(doc_id.as_bytes()) % self.partitions as u64) as u32
    }

    /// 新建或更新文档，返回新 revision
    pub fn put(&self, doc_id: &str, content: Value) -> String {
        let rev = {
            let mut inner = self.inner.write();
            let generation = inner
                .docs
                .get(doc_id)
                .map(|d| revision_generation(&d.revision))
                .unwrap_or(0)
                + 1;
            let rev = format!(
                "{}-{:016x}",
                generation,
                xxh3_64(content.to_string().as_bytes())
            );
            inner.docs.insert(
                doc_id.to_string(),
                Document::new(doc_id, rev.clone(), content.clone()),
            );
            self.append(&mut inner, doc_id, &rev, ChangeKind::Upsert(content));
            rev
        };
        self.notify.notify_waiters();
        rev
    }

    /// 删除文档；不存在时返回 None 且不产生事件
    pub fn delete(&self, doc_id: &str) -> Option<String> {
        let rev = {
            let mut inner = self.inner.write();
            let old = inner.docs.remove(doc_id)?;
            let rev = format!("{}-deleted", revision_generation(&old.revision) + 1);
            self.append(&mut inner, doc_id, &rev, ChangeKind::Delete);
            rev
        };
        self.notify.notify_waiters();
        Some(rev)
    }

    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.inner.read().docs.get(doc_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, inner: &mut MemoryInner, doc_id: &str, rev: &str, kind: ChangeKind) {
        let partition = self.partition_of(doc_id);
        let log = &mut inner.logs[partition as usize];
        let seq = log.len() as u64 + 1;
        log.push(ChangeEvent {
            partition,
            seq,
            doc_id: doc_id.to_string(),
            revision: rev.to_string(),
            kind,
        });
    }
}

fn revision_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(g, _)| g.parse().ok())
        .unwrap_or(0)
}

impl ChangeFeed for MemoryStore {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn read(&self, partition: u32, after_seq: u64, limit: usize) -> anyhow::Result<Vec<ChangeEvent>> {
        let inner = self.inner.read();
        let log = inner
            .logs
            .get(partition as usize)
            .ok_or_else(|| anyhow::anyhow!("unknown partition {}", partition))?;
        let start = (after_seq as usize).min(log.len());
        let end = start.saturating_add(limit).min(log.len());
        Ok(log[start..end].to_vec())
    }

    fn tail(&self, partition: u32) -> u64 {
        self.inner
            .read()
            .logs
            .get(partition as usize)
            .map(|l| l.len() as u64)
            .unwrap_or(0)
    }

    fn list_all(&self) -> anyhow::Result<(Vec<Document>, FeedPosition)> {
        let inner = self.inner.read();
        let mut docs: Vec<Document> = inner.docs.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        let pos = inner
            .logs
            .iter()
            .enumerate()
            .map(|(p, l)| (p as u32, l.len() as u64))
            .collect();
        Ok((docs, pos))
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
