use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::core::error::QueryError;
use crate::core::key::{decode, encode, key_from_json, key_to_json, EncodedKey};
use crate::core::view::ViewDefinition;
use crate::event::feed::ChangeFeed;
use crate::event::indexer::ViewIndexer;
use crate::index::{Cut, EntryKey, IndexEntry, KeyRange, ScanOptions, ViewSnapshot};
use crate::stats::EngineReport;

/// 查询参数（CouchDB 视图查询语义的子集）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// 缺省：视图有 reducer 时为 true
    pub reduce: Option<bool>,
    /// 按完整键分组
    pub group: bool,
    pub group_level: Option<usize>,
    pub limit: Option<usize>,
    pub skip: usize,
    pub descending: bool,
    pub startkey: Option<Value>,
    pub endkey: Option<Value>,
    pub inclusive_end: bool,
    pub key: Option<Value>,
    pub keys: Option<Vec<Value>>,
    pub startkey_docid: Option<String>,
    pub endkey_docid: Option<String>,
    /// 前缀扫描：键的前若干组件等于该值
    pub prefix: Option<Value>,
    /// 上一页返回的续传切点
    pub continuation: Option<Cut>,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            reduce: None,
            group: false,
            group_level: None,
            limit: None,
            skip: 0,
            descending: false,
            startkey: None,
            endkey: None,
            inclusive_end: true,
            key: None,
            keys: None,
            startkey_docid: None,
            endkey_docid: None,
            prefix: None,
            continuation: None,
            deadline: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViewRow {
    pub key: Value,
    pub value: Value,
    /// 仅非 reduce 结果携带
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ViewResult {
    pub rows: Vec<ViewRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// indexer 落后超过阈值
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Cut>,
}

/// 查询计划：升序表达的区间列表 + reduce 形态
struct Plan {
    ranges: Vec<KeyRange>,
    reduce: bool,
    group_level: usize,
}

/// 视图注册表 + 查询入口。
///
/// 每个视图一个 indexer（后台一个 tokio task）；查询只读已发布快照，不加锁。
pub struct QueryEngine {
    feed: Arc<dyn ChangeFeed>,
    config: EngineConfig,
    views: DashMap<String, Arc<ViewIndexer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryEngine {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: EngineConfig) -> Self {
        Self {
            feed,
            config,
            views: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 注册视图（不启动后台任务）。
    ///
    /// 同名视图已注册时拒绝：两个 indexer 不能共用同一个状态目录。
    pub fn register(&self, view: ViewDefinition) -> anyhow::Result<Arc<ViewIndexer>> {
        match self.views.entry(view.name.clone()) {
            Entry::Occupied(e) => anyhow::bail!("view '{}' is already registered", e.key()),
            Entry::Vacant(slot) => {
                let ix = Arc::new(ViewIndexer::new(view, self.feed.clone(), self.config.clone())?);
                slot.insert(ix.clone());
                Ok(ix)
            }
        }
    }

    /// 为每个已注册视图启动后台 indexer
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for ix in self.views.iter() {
            tasks.push(tokio::spawn(ix.value().clone().run()));
        }
        tracing::info!("Started {} view indexer(s)", tasks.len());
    }

    pub async fn wait_live(&self) {
        for ix in self.indexers() {
            ix.wait_live().await;
        }
    }

    /// 各视图并发追平（不常驻）
    pub async fn catch_up_all(&self) -> anyhow::Result<()> {
        let handles: Vec<_> = self
            .indexers()
            .into_iter()
            .map(|ix| tokio::spawn(async move { ix.catch_up().await }))
            .collect();
        for h in handles {
            h.await??;
        }
        Ok(())
    }

    /// 停止全部后台 indexer，等待其落盘退出
    pub async fn shutdown(&self) {
        for ix in self.indexers() {
            ix.stop();
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            if let Err(e) = t.await {
                tracing::error!("Indexer task panicked: {}", e);
            }
        }
    }

    fn indexers(&self) -> Vec<Arc<ViewIndexer>> {
        self.views.iter().map(|e| e.value().clone()).collect()
    }

    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn indexer(&self, view: &str) -> Result<Arc<ViewIndexer>, QueryError> {
        self.views
            .get(view)
            .map(|e| e.value().clone())
            .ok_or_else(|| QueryError::UnknownView(view.to_string()))
    }

    pub fn stats(&self) -> EngineReport {
        let mut views: Vec<_> = self.indexers().iter().map(|ix| ix.stats()).collect();
        views.sort_by(|a, b| a.view.cmp(&b.view));
        EngineReport {
            views,
            process_rss_bytes: EngineReport::read_process_rss(),
        }
    }

    /// 定期统计报告循环
    pub async fn report_loop(self: Arc<Self>, interval_secs: u64) {
        let interval = std::time::Duration::from_secs(interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            tracing::info!("\n{}", self.stats());
        }
    }

    pub fn query(&self, view: &str, opts: &QueryOptions) -> Result<ViewResult, QueryError> {
        let ix = self.indexer(view)?;
        let has_reducer = ix.view().reducer.is_some();
        let plan = plan(opts, has_reducer)?;
        let snap = ix.store().snapshot();
        let stale = ix.lag() > self.config.stale_threshold;

        let mut result = if plan.reduce {
            run_reduce(&snap, &plan, opts)?
        } else {
            run_scan(&snap, &plan, opts)?
        };
        result.stale = stale;
        if stale {
            tracing::debug!("View {}: serving stale result (lag {})", view, ix.lag());
        }
        Ok(result)
    }
}

fn config_err(msg: impl Into<String>) -> QueryError {
    QueryError::Configuration(msg.into())
}

fn encode_json(v: &Value) -> Result<EncodedKey, QueryError> {
    Ok(encode(&key_from_json(v)?)?)
}

/// 校验参数组合并把键条件翻译成升序区间
fn plan(opts: &QueryOptions, has_reducer: bool) -> Result<Plan, QueryError> {
    let reduce = opts.reduce.unwrap_or(has_reducer);
    if reduce && !has_reducer {
        return Err(config_err("reduce=true on a view without a reduce function"));
    }
    let grouping = opts.group || opts.group_level.is_some();
    if grouping && !reduce {
        return Err(config_err("group/group_level require reduce=true"));
    }
    let group_level = match (opts.group_level, opts.group) {
        (Some(l), _) => l,
        (None, true) => usize::MAX,
        (None, false) => 0,
    };

    let has_range = opts.startkey.is_some()
        || opts.endkey.is_some()
        || opts.startkey_docid.is_some()
        || opts.endkey_docid.is_some();
    let selectors = [opts.key.is_some(), opts.keys.is_some(), opts.prefix.is_some(), has_range]
        .iter()
        .filter(|b| **b)
        .count();
    if selectors > 1 {
        return Err(config_err(
            "key, keys, prefix and startkey/endkey are mutually exclusive",
        ));
    }

    let ranges = if let Some(keys) = &opts.keys {
        if reduce && group_level == 0 {
            return Err(config_err("multi-key reduce queries must use group or group_level"));
        }
        if opts.continuation.is_some() {
            return Err(config_err("continuation is not supported with keys"));
        }
        keys.iter()
            .map(|k| encode_json(k).map(KeyRange::exact))
            .collect::<Result<Vec<_>, _>>()?
    } else if let Some(k) = &opts.key {
        vec![KeyRange::exact(encode_json(k)?)]
    } else if let Some(p) = &opts.prefix {
        vec![KeyRange::prefix(encode_json(p)?)]
    } else {
        match bounded_range(opts)? {
            Some(r) => vec![r],
            None => Vec::new(),
        }
    };

    let ranges = match &opts.continuation {
        Some(cut) => ranges
            .into_iter()
            .map(|r| r.resume(cut.clone(), opts.descending))
            .collect(),
        None => ranges,
    };

    Ok(Plan {
        ranges,
        reduce,
        group_level,
    })
}

/// startkey/endkey（遍历方向上的起止）→ 升序区间；起点在终点之后时返回 None
fn bounded_range(opts: &QueryOptions) -> Result<Option<KeyRange>, QueryError> {
    let start = opts.startkey.as_ref().map(encode_json).transpose()?;
    let end = opts.endkey.as_ref().map(encode_json).transpose()?;

    if let (Some(s), Some(e)) = (&start, &end) {
        let inverted = if opts.descending { s < e } else { s > e };
        if inverted {
            return Ok(None);
        }
    }

    // 起点（遍历方向上）总是包含；终点由 inclusive_end 决定
    let start_cut = |k: EncodedKey| match &opts.startkey_docid {
        None if opts.descending => Cut::AfterKey(k),
        None => Cut::BeforeKey(k),
        Some(doc) if opts.descending => Cut::AfterEntry(entry_key(k, doc, u32::MAX)),
        Some(doc) => Cut::BeforeEntry(entry_key(k, doc, 0)),
    };
    let end_cut = |k: EncodedKey| match (&opts.endkey_docid, opts.descending, opts.inclusive_end) {
        (None, false, true) => Cut::AfterKey(k),
        (None, false, false) => Cut::BeforeKey(k),
        (None, true, true) => Cut::BeforeKey(k),
        (None, true, false) => Cut::AfterKey(k),
        (Some(doc), false, true) => Cut::AfterEntry(entry_key(k, doc, u32::MAX)),
        (Some(doc), false, false) => Cut::BeforeEntry(entry_key(k, doc, 0)),
        (Some(doc), true, true) => Cut::BeforeEntry(entry_key(k, doc, 0)),
        (Some(doc), true, false) => Cut::AfterEntry(entry_key(k, doc, u32::MAX)),
    };

    let (from, to) = (
        start.map(start_cut),
        end.map(end_cut),
    );
    let range = if opts.descending {
        KeyRange {
            lo: to.unwrap_or(Cut::Start),
            hi: from.unwrap_or(Cut::End),
        }
    } else {
        KeyRange {
            lo: from.unwrap_or(Cut::Start),
            hi: to.unwrap_or(Cut::End),
        }
    };
    Ok(Some(range))
}

fn entry_key(key: EncodedKey, doc_id: &str, ordinal: u32) -> EntryKey {
    EntryKey {
        key,
        doc_id: doc_id.to_string(),
        ordinal,
    }
}

fn entry_row(e: &IndexEntry) -> Result<ViewRow, QueryError> {
    Ok(ViewRow {
        key: key_to_json(&decode(&e.id.key)?),
        value: e.value.clone(),
        id: Some(e.id.doc_id.clone()),
    })
}

fn run_scan(snap: &ViewSnapshot, plan: &Plan, opts: &QueryOptions) -> Result<ViewResult, QueryError> {
    let mut rows = Vec::new();
    let mut skip = opts.skip;
    let mut offset = None;
    let mut continuation = None;

    for range in &plan.ranges {
        let remaining = opts.limit.map(|l| l.saturating_sub(rows.len()));
        if remaining == Some(0) {
            break;
        }
        let page = snap.scan(
            range,
            &ScanOptions {
                limit: remaining,
                skip,
                descending: opts.descending,
                deadline: opts.deadline,
            },
        );
        offset.get_or_insert(page.offset);
        skip = skip.saturating_sub(snap.tree.count_range(&range.lo, &range.hi));
        for e in &page.rows {
            rows.push(entry_row(e)?);
        }
        if page.next.is_some() {
            continuation = page.next;
            break;
        }
    }

    Ok(ViewResult {
        rows,
        total_rows: Some(snap.len()),
        offset: Some(offset.unwrap_or(0)),
        stale: false,
        // 多区间（keys）不返回续传
        continuation: continuation.filter(|_| plan.ranges.len() == 1),
    })
}

fn run_reduce(snap: &ViewSnapshot, plan: &Plan, opts: &QueryOptions) -> Result<ViewResult, QueryError> {
    let mut rows = Vec::new();
    let mut skip = opts.skip;
    let mut continuation = None;

    for range in &plan.ranges {
        let remaining = opts.limit.map(|l| l.saturating_sub(rows.len()));
        if remaining == Some(0) {
            break;
        }
        let page = snap.reduce_range(
            range,
            plan.group_level,
            &ScanOptions {
                limit: remaining,
                skip,
                descending: opts.descending,
                deadline: opts.deadline,
            },
        );
        skip -= page.skipped;
        for (group, agg) in page.rows {
            let key = if plan.group_level == 0 {
                Value::Null
            } else {
                key_to_json(&decode(&group)?)
            };
            rows.push(ViewRow {
                key,
                value: agg.to_json(),
                id: None,
            });
        }
        if page.next.is_some() {
            continuation = page.next;
            break;
        }
    }

    Ok(ViewResult {
        rows,
        total_rows: None,
        offset: None,
        stale: false,
        continuation: continuation.filter(|_| plan.ranges.len() == 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::answer::*;
    use crate::event::feed::MemoryStore;
    use serde_json::json;

    fn answer(id: &str, content: Value, round: i64, creator: &str, room: &str) -> (String, Value) {
        (
            id.to_string(),
            json!({
                "type": "Answer",
                "contentId": content,
                "round": round,
                "creatorId": creator,
                "roomId": room,
                "selectedChoiceIndexes": [0],
            }),
        )
    }

    async fn engine_with(docs: Vec<(String, Value)>) -> (Arc<MemoryStore>, QueryEngine) {
        let store = Arc::new(MemoryStore::new(2));
        for (id, body) in docs {
            store.put(&id, body);
        }
        let engine = QueryEngine::new(store.clone(), EngineConfig::default());
        for v in answer_views() {
            engine.register(v).unwrap();
        }
        engine.catch_up_all().await.unwrap();
        (store, engine)
    }

    fn opts() -> QueryOptions {
        QueryOptions::default()
    }

    fn count_of(r: &ViewResult) -> Option<u64> {
        r.rows.first().and_then(|row| row.value.as_u64())
    }

    #[tokio::test]
    async fn count_by_content_follows_deletes() {
        let (store, engine) = engine_with(vec![
            answer("a1", json!("Q1"), 1, "u1", "r1"),
            answer("a2", json!("Q1"), 1, "u2", "r1"),
        ])
        .await;
        let q = QueryOptions {
            key: Some(json!("Q1")),
            ..opts()
        };
        assert_eq!(count_of(&engine.query(BY_CONTENTID, &q).unwrap()), Some(2));

        store.delete("a2");
        engine.catch_up_all().await.unwrap();
        assert_eq!(count_of(&engine.query(BY_CONTENTID, &q).unwrap()), Some(1));
    }

    #[tokio::test]
    async fn round_update_moves_entry() {
        let (store, engine) = engine_with(vec![answer("a1", json!("Q1"), 1, "u1", "r1")]).await;
        store.put("a1", answer("a1", json!("Q1"), 2, "u1", "r1").1);
        engine.catch_up_all().await.unwrap();

        let q = |round: i64| QueryOptions {
            key: Some(json!(["Q1", "u1", round])),
            ..opts()
        };
        let old = engine.query(BY_CONTENTID_CREATORID_ROUND, &q(1)).unwrap();
        let new = engine.query(BY_CONTENTID_CREATORID_ROUND, &q(2)).unwrap();
        assert!(old.rows.is_empty());
        assert_eq!(new.rows.len(), 1);
        assert_eq!(new.rows[0].id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn null_content_sorts_first() {
        let (_store, engine) = engine_with(vec![
            answer("a1", json!("Q1"), 1, "u1", "r1"),
            answer("a2", Value::Null, 1, "u1", "r1"),
            answer("a3", json!(7), 1, "u1", "r1"),
        ])
        .await;
        let q = QueryOptions {
            reduce: Some(false),
            ..opts()
        };
        let r = engine.query(BY_CONTENTID, &q).unwrap();
        let keys: Vec<Value> = r.rows.iter().map(|row| row.key.clone()).collect();
        assert_eq!(keys, vec![json!([null]), json!([7]), json!(["Q1"])]);
        assert_eq!(r.total_rows, Some(3));
    }

    #[tokio::test]
    async fn group_levels_partition_the_total() {
        let mut docs = Vec::new();
        for i in 0..30 {
            docs.push(answer(
                &format!("a{:02}", i),
                json!(format!("Q{}", i % 3)),
                (i % 2) as i64 + 1,
                &format!("u{}", i % 5),
                "r1",
            ));
        }
        let (_store, engine) = engine_with(docs).await;

        let total = count_of(&engine.query(BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES, &opts()).unwrap());
        assert_eq!(total, Some(30));
        for level in 1..=4 {
            let q = QueryOptions {
                group_level: Some(level),
                ..opts()
            };
            let r = engine.query(BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES, &q).unwrap();
            let sum: u64 = r.rows.iter().filter_map(|row| row.value.as_u64()).sum();
            assert_eq!(sum, 30, "level {}", level);
            let mut keys: Vec<Value> = r.rows.iter().map(|row| row.key.clone()).collect();
            keys.dedup();
            assert_eq!(keys.len(), r.rows.len());
        }
        let q = QueryOptions {
            group_level: Some(1),
            ..opts()
        };
        assert_eq!(
            engine.query(BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES, &q).unwrap().rows.len(),
            3
        );
    }

    #[tokio::test]
    async fn reduce_matches_scan_length() {
        let mut docs = Vec::new();
        for i in 0..40 {
            docs.push(answer(&format!("a{:02}", i), json!(format!("Q{}", i % 7)), 1, "u", "r"));
        }
        let (store, engine) = engine_with(docs).await;
        for i in (0..40).step_by(3) {
            store.delete(&format!("a{:02}", i));
        }
        for i in 40..50 {
            store.put(&format!("a{:02}", i), answer("x", json!(format!("Q{}", i % 7)), 1, "u", "r").1);
        }
        engine.catch_up_all().await.unwrap();

        for (s, e) in [("Q1", "Q3"), ("Q0", "Q6"), ("Q4", "Q4"), ("Q5", "Q9")] {
            let scan = QueryOptions {
                reduce: Some(false),
                startkey: Some(json!(s)),
                endkey: Some(json!(e)),
                ..opts()
            };
            let red = QueryOptions {
                startkey: Some(json!(s)),
                endkey: Some(json!(e)),
                ..opts()
            };
            let n = engine.query(BY_CONTENTID, &scan).unwrap().rows.len() as u64;
            let c = count_of(&engine.query(BY_CONTENTID, &red).unwrap()).unwrap_or(0);
            assert_eq!(n, c, "range {}..{}", s, e);
        }
    }

    #[tokio::test]
    async fn descending_and_inclusive_end() {
        let docs = (0..5)
            .map(|i| answer(&format!("a{}", i), json!(format!("Q{}", i)), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;
        let keys = |r: ViewResult| r.rows.into_iter().map(|row| row.key).collect::<Vec<_>>();

        let q = QueryOptions {
            reduce: Some(false),
            descending: true,
            startkey: Some(json!("Q3")),
            endkey: Some(json!("Q1")),
            inclusive_end: false,
            ..opts()
        };
        assert_eq!(keys(engine.query(BY_CONTENTID, &q).unwrap()), vec![json!(["Q3"]), json!(["Q2"])]);

        let inverted = QueryOptions {
            descending: false,
            ..q.clone()
        };
        assert!(engine.query(BY_CONTENTID, &inverted).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn keys_follow_requested_order() {
        let docs = (0..4)
            .map(|i| answer(&format!("a{}", i), json!(format!("Q{}", i)), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;
        let q = QueryOptions {
            reduce: Some(false),
            keys: Some(vec![json!("Q2"), json!("missing"), json!("Q0")]),
            ..opts()
        };
        let ids: Vec<_> = engine
            .query(BY_CONTENTID, &q)
            .unwrap()
            .rows
            .into_iter()
            .filter_map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a2", "a0"]);
    }

    #[tokio::test]
    async fn paging_with_continuation() {
        let docs = (0..9)
            .map(|i| answer(&format!("a{}", i), json!("Q1"), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;
        let mut q = QueryOptions {
            reduce: Some(false),
            prefix: Some(json!("Q1")),
            limit: Some(4),
            ..opts()
        };
        let mut seen = Vec::new();
        loop {
            let r = engine.query(BY_CONTENTID, &q).unwrap();
            seen.extend(r.rows.iter().filter_map(|row| row.id.clone()));
            match r.continuation {
                Some(c) => q.continuation = Some(c),
                None => break,
            }
        }
        let expected: Vec<String> = (0..9).map(|i| format!("a{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn skip_and_full_grouping() {
        let docs = (0..6)
            .map(|i| answer(&format!("a{}", i), json!(format!("Q{}", i % 3)), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;

        let q = QueryOptions {
            reduce: Some(false),
            skip: 2,
            limit: Some(3),
            ..opts()
        };
        let r = engine.query(BY_CONTENTID, &q).unwrap();
        let ids: Vec<_> = r.rows.iter().filter_map(|row| row.id.clone()).collect();
        assert_eq!(ids, vec!["a1", "a4", "a2"]);
        assert_eq!(r.offset, Some(2));
        assert_eq!(r.total_rows, Some(6));

        let grouped = QueryOptions {
            group: true,
            ..opts()
        };
        let r = engine.query(BY_CONTENTID, &grouped).unwrap();
        let rows: Vec<_> = r.rows.iter().map(|row| (row.key.clone(), row.value.clone())).collect();
        assert_eq!(
            rows,
            vec![
                (json!(["Q0"]), json!(2)),
                (json!(["Q1"]), json!(2)),
                (json!(["Q2"]), json!(2)),
            ]
        );

        let paged = QueryOptions {
            skip: 1,
            limit: Some(1),
            ..grouped.clone()
        };
        let r = engine.query(BY_CONTENTID, &paged).unwrap();
        assert_eq!(r.rows.len(), 1);
        assert_eq!(r.rows[0].key, json!(["Q1"]));

        // group=true 按完整键分组
        let r = engine.query(BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES, &grouped).unwrap();
        let keys: Vec<_> = r.rows.iter().map(|row| row.key.clone()).collect();
        assert_eq!(
            keys,
            vec![json!(["Q0", 1, [0]]), json!(["Q1", 1, [0]]), json!(["Q2", 1, [0]])]
        );
    }

    #[tokio::test]
    async fn docid_bounds_split_equal_keys() {
        let docs = (0..5)
            .map(|i| answer(&format!("a{}", i), json!("Q1"), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;
        let ids = |q: &QueryOptions| -> Vec<String> {
            engine
                .query(BY_CONTENTID, q)
                .unwrap()
                .rows
                .into_iter()
                .filter_map(|r| r.id)
                .collect()
        };

        let q = QueryOptions {
            reduce: Some(false),
            startkey: Some(json!("Q1")),
            endkey: Some(json!("Q1")),
            startkey_docid: Some("a1".into()),
            endkey_docid: Some("a3".into()),
            ..opts()
        };
        assert_eq!(ids(&q), vec!["a1", "a2", "a3"]);

        let exclusive = QueryOptions {
            inclusive_end: false,
            ..q.clone()
        };
        assert_eq!(ids(&exclusive), vec!["a1", "a2"]);

        let desc = QueryOptions {
            descending: true,
            startkey_docid: Some("a3".into()),
            endkey_docid: Some("a1".into()),
            ..q.clone()
        };
        assert_eq!(ids(&desc), vec!["a3", "a2", "a1"]);

        let counted = QueryOptions {
            reduce: None,
            ..q
        };
        let r = engine.query(BY_CONTENTID, &counted).unwrap();
        assert_eq!(count_of(&r), Some(3));
    }

    #[tokio::test]
    async fn grouped_reduce_pages_with_continuation() {
        let docs = (0..10)
            .map(|i| answer(&format!("a{}", i), json!(format!("Q{}", i % 5)), 1, "u", "r"))
            .collect();
        let (_store, engine) = engine_with(docs).await;

        for descending in [false, true] {
            let mut q = QueryOptions {
                group_level: Some(1),
                limit: Some(2),
                descending,
                ..opts()
            };
            let mut rows = Vec::new();
            let mut pages = 0;
            loop {
                let r = engine.query(BY_CONTENTID, &q).unwrap();
                pages += 1;
                rows.extend(r.rows.into_iter().map(|row| (row.key, row.value)));
                match r.continuation {
                    Some(c) => q.continuation = Some(c),
                    None => break,
                }
            }
            let mut expected: Vec<_> = (0..5)
                .map(|i| (json!([format!("Q{}", i)]), json!(2)))
                .collect();
            if descending {
                expected.reverse();
            }
            assert_eq!(rows, expected);
            assert_eq!(pages, 3);
        }

        // deadline 已过：仍返回一组，并给出续传切点
        let q = QueryOptions {
            group_level: Some(1),
            deadline: Some(Instant::now()),
            ..opts()
        };
        let first = engine.query(BY_CONTENTID, &q).unwrap();
        assert_eq!(first.rows.len(), 1);
        let rest = engine
            .query(
                BY_CONTENTID,
                &QueryOptions {
                    group_level: Some(1),
                    continuation: first.continuation.clone(),
                    ..opts()
                },
            )
            .unwrap();
        assert!(first.continuation.is_some());
        assert_eq!(rest.rows.len(), 4);
        assert!(rest.continuation.is_none());
    }

    #[tokio::test]
    async fn duplicate_view_name_is_rejected() {
        let store = Arc::new(MemoryStore::new(1));
        let engine = QueryEngine::new(store, EngineConfig::default());
        let by_id = || answer_views().into_iter().find(|v| v.name == BY_ID).unwrap();
        let first = engine.register(by_id()).unwrap();
        assert!(engine.register(by_id()).is_err());
        assert_eq!(engine.view_names(), vec![BY_ID.to_string()]);
        assert!(Arc::ptr_eq(&first, &engine.indexer(BY_ID).unwrap()));
    }

    #[tokio::test]
    async fn invalid_combinations_are_rejected() {
        let (_store, engine) = engine_with(Vec::new()).await;
        let bad = [
            (BY_CONTENTID, QueryOptions { reduce: Some(false), group_level: Some(1), ..opts() }),
            (BY_CREATORID_ROOMID, QueryOptions { reduce: Some(true), ..opts() }),
            (BY_CONTENTID, QueryOptions { key: Some(json!("Q")), prefix: Some(json!("Q")), ..opts() }),
            (BY_CONTENTID, QueryOptions { keys: Some(vec![json!("Q")]), ..opts() }),
            (BY_CONTENTID, QueryOptions { key: Some(json!({"a": 1})), ..opts() }),
        ];
        for (view, q) in bad {
            assert!(engine.query(view, &q).is_err(), "{:?}", q);
        }
        assert!(matches!(
            engine.query("nope", &opts()),
            Err(QueryError::UnknownView(_))
        ));
    }

    #[tokio::test]
    async fn empty_reduce_has_no_rows() {
        let (_store, engine) = engine_with(Vec::new()).await;
        let r = engine.query(BY_ROOMID, &opts()).unwrap();
        assert!(r.rows.is_empty());
        assert!(r.total_rows.is_none());
    }

    #[tokio::test]
    async fn lagging_indexer_marks_results_stale() {
        let store = Arc::new(MemoryStore::new(1));
        let cfg = EngineConfig {
            stale_threshold: 2,
            ..EngineConfig::default()
        };
        let engine = QueryEngine::new(store.clone(), cfg);
        for v in answer_views() {
            engine.register(v).unwrap();
        }
        engine.catch_up_all().await.unwrap();
        for i in 0..5 {
            store.put(&format!("a{}", i), answer("x", json!("Q1"), 1, "u", "r").1);
        }
        assert!(engine.query(BY_ID, &opts()).unwrap().stale);
        engine.catch_up_all().await.unwrap();
        assert!(!engine.query(BY_ID, &opts()).unwrap().stale);
    }
}
