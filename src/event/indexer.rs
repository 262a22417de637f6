use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::core::document::{ChangeEvent, Document, FeedPosition};
use crate::core::view::ViewDefinition;
use crate::event::feed::{lag_between, ChangeFeed};
use crate::event::verify::verify_and_repair;
use crate::index::{DocUpdate, IndexStore};
use crate::stats::{ViewCounters, ViewStats};
use crate::storage::CheckpointStore;

/// 单视图 indexer 的生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IndexerState {
    Idle,
    CatchingUp,
    Live,
    Rebuilding,
    Stopped,
}

impl IndexerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => IndexerState::CatchingUp,
            2 => IndexerState::Live,
            3 => IndexerState::Rebuilding,
            4 => IndexerState::Stopped,
            _ => IndexerState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            IndexerState::Idle => 0,
            IndexerState::CatchingUp => 1,
            IndexerState::Live => 2,
            IndexerState::Rebuilding => 3,
            IndexerState::Stopped => 4,
        }
    }
}

/// 视图的唯一写入方：消费变更流，执行 map，增量更新 Index Store。
///
/// 每个批次：读取各分区至多 `batch_size` 个事件 → 逐文档求值 →
/// 写 WAL（checkpoint）→ 一次性发布新快照。
pub struct ViewIndexer {
    view: Arc<ViewDefinition>,
    store: Arc<IndexStore>,
    feed: Arc<dyn ChangeFeed>,
    config: EngineConfig,
    checkpoint: Option<CheckpointStore>,
    state: AtomicU8,
    counters: ViewCounters,
    /// 首个 emission 的键长度，用于发现 arity 漂移
    first_arity: Mutex<Option<usize>>,
    batches_since_snapshot: AtomicU64,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    state_notify: Notify,
}

impl ViewIndexer {
    pub fn new(
        view: ViewDefinition,
        feed: Arc<dyn ChangeFeed>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let checkpoint = match config.view_dir(&view.name) {
            Some(dir) => Some(CheckpointStore::open(dir, view.signature(), feed.epoch())?),
            None => None,
        };
        let store = Arc::new(IndexStore::new(view.name.clone(), view.reducer.clone()));
        Ok(Self {
            view: Arc::new(view),
            store,
            feed,
            config,
            checkpoint,
            state: AtomicU8::new(IndexerState::Idle.as_u8()),
            counters: ViewCounters::default(),
            first_arity: Mutex::new(None),
            batches_since_snapshot: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            state_notify: Notify::new(),
        })
    }

    pub fn view(&self) -> &ViewDefinition {
        &self.view
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn counters(&self) -> &ViewCounters {
        &self.counters
    }

    pub fn state(&self) -> IndexerState {
        IndexerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: IndexerState) {
        let prev = IndexerState::from_u8(self.state.swap(s.as_u8(), Ordering::AcqRel));
        if prev != s {
            tracing::debug!("View {}: {:?} -> {:?}", self.view.name, prev, s);
            self.state_notify.notify_waiters();
        }
    }

    /// 落后变更流的事件数
    pub fn lag(&self) -> u64 {
        lag_between(&self.feed.tail_position(), &self.store.position())
    }

    pub fn stats(&self) -> ViewStats {
        let snap = self.store.snapshot();
        ViewStats {
            view: self.view.name.clone(),
            state: self.state(),
            entries: snap.len(),
            documents: snap.doc_count,
            position: snap.position.clone(),
            lag: lag_between(&self.feed.tail_position(), &snap.position),
            events_applied: ViewCounters::get(&self.counters.events_applied),
            batches: ViewCounters::get(&self.counters.batches),
            last_batch_size: ViewCounters::get(&self.counters.last_batch_size),
            map_errors: ViewCounters::get(&self.counters.map_errors),
            encoding_errors: ViewCounters::get(&self.counters.encoding_errors),
            arity_drift: ViewCounters::get(&self.counters.arity_drift),
            rebuilds: ViewCounters::get(&self.counters.rebuilds),
        }
    }

    /// 请求停止：当前批次完成后退出 run 循环
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 等待进入 Live（或 Stopped）
    pub async fn wait_live(&self) {
        loop {
            let notified = self.state_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if matches!(self.state(), IndexerState::Live | IndexerState::Stopped) {
                return;
            }
            notified.await;
        }
    }

    /// 对单个文档求值。
    ///
    /// 返回 None 表示 map 失败：该文档原有条目保持不变。
    /// 单条 emission 编码失败只丢弃该 emission。
    pub fn evaluate(&self, doc: &Document) -> Option<DocUpdate> {
        let emissions = match self.view.map(doc) {
            Ok(e) => e,
            Err(e) => {
                ViewCounters::add(&self.counters.map_errors, 1);
                tracing::warn!("{}", e);
                return None;
            }
        };

        let mut entries = Vec::with_capacity(emissions.len());
        for em in emissions {
            match em.encode_key() {
                Ok(key) => {
                    self.observe_arity(&doc.id, em.key.len());
                    entries.push((key, em.value));
                }
                Err(e) => {
                    ViewCounters::add(&self.counters.encoding_errors, 1);
                    tracing::warn!(
                        "View {}: dropped emission of doc {}: {}",
                        self.view.name,
                        doc.id,
                        e
                    );
                }
            }
        }
        Some(DocUpdate::new(doc.id.clone(), entries))
    }

    fn observe_arity(&self, doc_id: &str, arity: usize) {
        let mut first = self.first_arity.lock();
        match *first {
            None => *first = Some(arity),
            Some(a) if a != arity => {
                ViewCounters::add(&self.counters.arity_drift, 1);
                tracing::warn!(
                    "View {}: doc {} emitted key of arity {} (expected {})",
                    self.view.name,
                    doc_id,
                    arity,
                    a
                );
            }
            Some(_) => {}
        }
    }

    fn evaluate_event(&self, ev: &ChangeEvent) -> Option<DocUpdate> {
        match ev.document() {
            Some(doc) => self.evaluate(&doc),
            None => Some(DocUpdate::removal(ev.doc_id.clone())),
        }
    }

    /// 启动：有有效 checkpoint 时从快照 + WAL 恢复，否则全量构建
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.set_state(IndexerState::CatchingUp);
        if !self.recover().await? {
            self.bulk_load().await?;
        }
        Ok(())
    }

    async fn recover(&self) -> anyhow::Result<bool> {
        let Some(ckpt) = &self.checkpoint else {
            return Ok(false);
        };
        let recovered = match ckpt.recover(&self.feed.tail_position()).await {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(
                    "View {}: failed to load persisted state, rebuilding: {}",
                    self.view.name,
                    e
                );
                return Ok(false);
            }
        };
        let replayed = recovered.replayed_batches;
        let dirty = replayed > 0 || recovered.truncated_tail_records > 0;
        self.store.replace_all(recovered.docs, recovered.position);
        tracing::info!(
            "View {}: restored {} entries ({} WAL batches replayed)",
            self.view.name,
            self.store.snapshot().len(),
            replayed
        );
        if dirty {
            // 回放过的 WAL 折叠进新快照
            ckpt.write_snapshot(&self.store.snapshot()).await?;
        }
        Ok(true)
    }

    /// 全量构建：`list_all` + 并行 map，O(n) 建树后一次发布
    pub async fn bulk_load(&self) -> anyhow::Result<()> {
        let (docs, position) = self.feed.list_all()?;
        let started = std::time::Instant::now();
        let updates: Vec<DocUpdate> = docs.par_iter().filter_map(|d| self.evaluate(d)).collect();
        self.store.replace_all(updates, position);
        let snap = self.store.snapshot();
        tracing::info!(
            "View {}: bulk load complete: {} docs, {} entries in {:?}",
            self.view.name,
            docs.len(),
            snap.len(),
            started.elapsed()
        );

        if let Some(ckpt) = &self.checkpoint {
            ckpt.reset().await?;
            ckpt.write_snapshot(&snap).await?;
            self.batches_since_snapshot.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// 结构损坏时的恢复：丢弃当前状态，从存储全量重建
    pub async fn rebuild(&self, reason: &str) -> anyhow::Result<()> {
        let prev = self.state();
        self.set_state(IndexerState::Rebuilding);
        ViewCounters::add(&self.counters.rebuilds, 1);
        tracing::warn!("View {}: starting rebuild: {}", self.view.name, reason);
        let res = self.bulk_load().await;
        self.set_state(match prev {
            IndexerState::Rebuilding | IndexerState::Idle => IndexerState::CatchingUp,
            other => other,
        });
        res
    }

    /// 处理一个批次，返回本批事件数（0 = 已追平）
    pub async fn step(&self) -> anyhow::Result<usize> {
        let start = self.store.position();
        let mut events = Vec::new();
        let mut next = start.clone();
        for p in 0..self.feed.partitions() {
            let after = start.get(&p).copied().unwrap_or(0);
            let evs = self.feed.read(p, after, self.config.batch_size)?;
            if let Some(last) = evs.last() {
                next.insert(p, last.seq);
            }
            events.extend(evs);
        }
        if events.is_empty() {
            return Ok(0);
        }

        let updates: Vec<DocUpdate> = events
            .iter()
            .filter_map(|ev| self.evaluate_event(ev))
            .collect();
        self.commit(updates, next).await?;

        let n = events.len();
        ViewCounters::add(&self.counters.events_applied, n as u64);
        ViewCounters::add(&self.counters.batches, 1);
        self.counters.last_batch_size.store(n as u64, Ordering::Relaxed);
        tracing::debug!("View {}: applied batch of {} events", self.view.name, n);

        let batches = ViewCounters::get(&self.counters.batches);
        let every = self.config.verify_every_batches;
        if every > 0 && batches % every == 0 {
            verify_and_repair(self).await?;
        }
        Ok(n)
    }

    async fn commit(&self, updates: Vec<DocUpdate>, position: FeedPosition) -> anyhow::Result<()> {
        if let Some(ckpt) = &self.checkpoint {
            ckpt.record_batch(&position, &updates).await?;
        }
        self.store.apply_batch(updates, Some(position));

        if let Some(ckpt) = &self.checkpoint {
            let since = self.batches_since_snapshot.fetch_add(1, Ordering::AcqRel) + 1;
            if since >= self.config.snapshot_every_batches.max(1) {
                ckpt.write_snapshot(&self.store.snapshot()).await?;
                self.batches_since_snapshot.store(0, Ordering::Release);
            }
        }
        Ok(())
    }

    /// 追平变更流（不进入 Live 等待）；测试与一次性驱动使用
    pub async fn catch_up(&self) -> anyhow::Result<()> {
        if self.state() == IndexerState::Idle {
            self.initialize().await?;
        }
        while !self.is_cancelled() && self.step().await? > 0 {}
        Ok(())
    }

    async fn flush_snapshot(&self) {
        let Some(ckpt) = &self.checkpoint else {
            return;
        };
        if self.batches_since_snapshot.load(Ordering::Acquire) == 0 {
            return;
        }
        match ckpt.write_snapshot(&self.store.snapshot()).await {
            Ok(()) => self.batches_since_snapshot.store(0, Ordering::Release),
            Err(e) => tracing::error!("View {}: final snapshot failed: {}", self.view.name, e),
        }
    }

    /// 后台循环：初始化 → 追平 → Live（等待新事件 / 轮询兜底）→ 取消时落盘退出
    pub async fn run(self: Arc<Self>) {
        if self.state() == IndexerState::Idle {
            if let Err(e) = self.initialize().await {
                tracing::error!("View {}: initialization failed: {}", self.view.name, e);
            }
        }
        let feed_notify = self.feed.notifier();

        while !self.is_cancelled() {
            let notified = feed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.step().await {
                Ok(0) => {
                    if self.state() == IndexerState::CatchingUp {
                        tracing::info!(
                            "View {}: caught up, {} entries",
                            self.view.name,
                            self.store.snapshot().len()
                        );
                        if self.config.verify_every_batches == 0 {
                            if let Err(e) = verify_and_repair(&self).await {
                                tracing::error!("View {}: verification failed: {}", self.view.name, e);
                            }
                        }
                        self.set_state(IndexerState::Live);
                    }
                    tokio::select! {
                        _ = notified => {},
                        _ = tokio::time::sleep(self.config.poll_interval()) => {},
                        _ = self.cancel_notify.notified() => {},
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("View {}: batch failed, retrying: {}", self.view.name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {},
                        _ = self.cancel_notify.notified() => {},
                    }
                }
            }
        }

        self.flush_snapshot().await;
        self.set_state(IndexerState::Stopped);
        tracing::info!("View {}: indexer stopped", self.view.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::answer::{answer_views, BY_CONTENTID, BY_ID};
    use crate::core::key::{decode, key_to_json};
    use crate::core::view::Emission;
    use crate::event::feed::MemoryStore;
    use crate::index::{KeyRange, ScanOptions};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Weak;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("docview-indexer-{}-{}", tag, nanos))
    }

    fn view(name: &str) -> ViewDefinition {
        answer_views().into_iter().find(|v| v.name == name).unwrap()
    }

    fn indexer(store: &Arc<MemoryStore>, v: ViewDefinition, cfg: EngineConfig) -> ViewIndexer {
        ViewIndexer::new(v, store.clone(), cfg).unwrap()
    }

    fn keys(ix: &ViewIndexer) -> Vec<(Value, String)> {
        ix.store()
            .snapshot()
            .scan(&KeyRange::all(), &ScanOptions::default())
            .rows
            .iter()
            .map(|e| (key_to_json(&decode(&e.id.key).unwrap()), e.id.doc_id.clone()))
            .collect()
    }

    fn answer(content: &str, round: i64) -> Value {
        json!({"type": "Answer", "contentId": content, "round": round})
    }

    #[tokio::test]
    async fn by_id_tracks_live_documents() {
        let store = Arc::new(MemoryStore::new(3));
        store.put("a1", answer("Q1", 1));
        store.put("a2", answer("Q1", 1));
        store.put("other", json!({"type": "Room"}));
        let ix = indexer(&store, view(BY_ID), EngineConfig::default());
        ix.catch_up().await.unwrap();

        store.put("a3", answer("Q2", 1));
        store.delete("a1");
        store.put("a2", answer("Q2", 2));
        ix.catch_up().await.unwrap();

        let ids: Vec<String> = keys(&ix).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec!["a2", "a3"]);
        assert_eq!(ix.lag(), 0);
    }

    #[tokio::test]
    async fn type_change_removes_entries() {
        let store = Arc::new(MemoryStore::new(1));
        store.put("a1", answer("Q1", 1));
        let ix = indexer(&store, view(BY_CONTENTID), EngineConfig::default());
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix).len(), 1);

        store.put("a1", json!({"type": "Comment", "contentId": "Q1"}));
        ix.catch_up().await.unwrap();
        assert!(keys(&ix).is_empty());
    }

    #[tokio::test]
    async fn map_failure_keeps_prior_entries() {
        let v = ViewDefinition::new("fragile", |doc: &Document| {
            if doc.field("boom").as_bool() == Some(true) {
                return Err("boom".to_string());
            }
            Ok(vec![Emission::new(vec![doc.field("k").clone()], json!(1))])
        });
        let store = Arc::new(MemoryStore::new(1));
        store.put("d", json!({"k": "old"}));
        let ix = indexer(&store, v, EngineConfig::default());
        ix.catch_up().await.unwrap();

        store.put("d", json!({"k": "new", "boom": true}));
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix), vec![(json!(["old"]), "d".to_string())]);
        assert_eq!(ViewCounters::get(&ix.counters().map_errors), 1);
        assert_eq!(ix.lag(), 0);
    }

    #[tokio::test]
    async fn bad_emission_is_dropped_alone() {
        let v = ViewDefinition::new("mixed", |doc: &Document| {
            Ok(vec![
                Emission::new(vec![json!({"nested": true})], json!(1)),
                Emission::new(vec![json!(doc.id), json!(1)], json!(2)),
                Emission::new(vec![json!(doc.id)], json!(3)),
            ])
        });
        let store = Arc::new(MemoryStore::new(1));
        store.put("d", json!({}));
        let ix = indexer(&store, v, EngineConfig::default());
        ix.catch_up().await.unwrap();

        assert_eq!(keys(&ix).len(), 2);
        assert_eq!(ViewCounters::get(&ix.counters().encoding_errors), 1);
        assert_eq!(ViewCounters::get(&ix.counters().arity_drift), 1);
    }

    #[tokio::test]
    async fn small_batches_reach_the_same_state() {
        let store = Arc::new(MemoryStore::new(2));
        let cfg = EngineConfig {
            batch_size: 3,
            ..EngineConfig::default()
        };
        let ix = indexer(&store, view(BY_CONTENTID), cfg);
        ix.catch_up().await.unwrap();
        for i in 0..20 {
            store.put(&format!("a{}", i), answer(&format!("Q{}", i % 4), 1));
        }
        for i in 0..5 {
            store.delete(&format!("a{}", i * 2));
        }
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix).len(), 15);
        assert!(ViewCounters::get(&ix.counters().batches) > 1);
        ix.store().verify().unwrap();
    }

    #[tokio::test]
    async fn restart_resumes_from_checkpoint() {
        let dir = unique_tmp_dir("restart");
        let cfg = EngineConfig {
            state_dir: Some(dir),
            snapshot_every_batches: 2,
            batch_size: 2,
            ..EngineConfig::default()
        };
        let store = Arc::new(MemoryStore::new(1));
        store.put("a1", answer("Q1", 1));
        {
            let ix = indexer(&store, view(BY_CONTENTID), cfg.clone());
            ix.catch_up().await.unwrap();
            for i in 2..9 {
                store.put(&format!("a{}", i), answer("Q2", 1));
            }
            store.delete("a1");
            ix.catch_up().await.unwrap();
        }
        store.put("a9", answer("Q3", 1));

        let ix = indexer(&store, view(BY_CONTENTID), cfg);
        ix.initialize().await.unwrap();
        // 恢复出的状态停在上次的位置
        assert_eq!(keys(&ix).len(), 7);
        assert_eq!(ix.lag(), 1);
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix).len(), 8);
        assert!(keys(&ix).iter().all(|(k, _)| k != &json!(["Q1"])));
    }

    #[tokio::test]
    async fn state_from_another_feed_is_rebuilt() {
        let dir = unique_tmp_dir("foreign");
        let cfg = EngineConfig {
            state_dir: Some(dir),
            ..EngineConfig::default()
        };
        let old = Arc::new(MemoryStore::new(1));
        old.put("a1", answer("OLD", 1));
        old.put("a1", answer("OLD", 1));
        {
            let ix = indexer(&old, view(BY_CONTENTID), cfg.clone());
            ix.catch_up().await.unwrap();
        }

        // 新的流同样从 seq 1 开始，tail 与旧位置数值相同
        let fresh = Arc::new(MemoryStore::new(1));
        fresh.put("b1", answer("NEW", 1));
        fresh.put("b1", answer("NEW", 1));
        let ix = indexer(&fresh, view(BY_CONTENTID), cfg);
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix), vec![(json!(["NEW"]), "b1".to_string())]);
        assert_eq!(ix.lag(), 0);
    }

    #[tokio::test]
    async fn replayed_feed_resumes_with_same_epoch() {
        let dir = unique_tmp_dir("same-epoch");
        let cfg = EngineConfig {
            state_dir: Some(dir),
            ..EngineConfig::default()
        };
        let load = || {
            let s = Arc::new(MemoryStore::with_epoch(1, 42));
            s.put("a1", answer("Q1", 1));
            s.put("a2", answer("Q2", 1));
            s
        };
        {
            let store = load();
            let ix = indexer(&store, view(BY_CONTENTID), cfg.clone());
            ix.catch_up().await.unwrap();
        }
        let store = load();
        store.put("a3", answer("Q3", 1));
        let ix = indexer(&store, view(BY_CONTENTID), cfg);
        ix.initialize().await.unwrap();
        // 从快照恢复，而不是全量构建
        assert_eq!(keys(&ix).len(), 2);
        assert_eq!(ix.lag(), 1);
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix).len(), 3);
    }

    /// 映射到 doc id 的视图；遇到 `stop_at` 时请求停止所挂的 indexer
    fn stopping_view(slot: Arc<Mutex<Weak<ViewIndexer>>>, stop_at: &'static str) -> ViewDefinition {
        ViewDefinition::new("stopping", move |doc: &Document| {
            if doc.id == stop_at {
                if let Some(ix) = slot.lock().upgrade() {
                    ix.stop();
                }
            }
            Ok(vec![Emission::new(vec![json!(doc.id)], json!(1))])
        })
    }

    #[tokio::test]
    async fn stop_during_catch_up_keeps_checkpoint_consistent() {
        let dir = unique_tmp_dir("abort");
        let cfg = EngineConfig {
            state_dir: Some(dir),
            batch_size: 2,
            ..EngineConfig::default()
        };
        let store = Arc::new(MemoryStore::new(1));
        let slot = Arc::new(Mutex::new(Weak::new()));
        {
            let ix = Arc::new(indexer(&store, stopping_view(slot.clone(), "a5"), cfg.clone()));
            *slot.lock() = Arc::downgrade(&ix);
            ix.initialize().await.unwrap();
            for i in 0..10 {
                store.put(&format!("a{}", i), json!({"n": i}));
            }
            ix.catch_up().await.unwrap();

            // a5 所在批次完整提交后退出，不再读取后续批次
            assert!(ix.is_cancelled());
            assert_eq!(ix.store().position().get(&0), Some(&6));
            assert_eq!(keys(&ix).len(), 6);
            assert_eq!(ix.lag(), 4);
        }

        let ix = indexer(&store, stopping_view(Arc::new(Mutex::new(Weak::new())), ""), cfg);
        ix.initialize().await.unwrap();
        assert_eq!(ix.store().position().get(&0), Some(&6));
        let ids: Vec<String> = keys(&ix).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec!["a0", "a1", "a2", "a3", "a4", "a5"]);
        ix.catch_up().await.unwrap();
        assert_eq!(keys(&ix).len(), 10);
    }

    #[tokio::test]
    async fn run_loop_goes_live_and_stops() {
        let store = Arc::new(MemoryStore::new(1));
        store.put("a1", answer("Q1", 1));
        let cfg = EngineConfig {
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let ix = Arc::new(indexer(&store, view(BY_ID), cfg));
        let h = tokio::spawn(ix.clone().run());
        ix.wait_live().await;
        assert_eq!(ix.state(), IndexerState::Live);

        store.put("a2", answer("Q1", 1));
        for _ in 0..200 {
            if ix.lag() == 0 && keys(&ix).len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(keys(&ix).len(), 2);

        ix.stop();
        h.await.unwrap();
        assert_eq!(ix.state(), IndexerState::Stopped);
    }
}
