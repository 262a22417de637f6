use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::core::document::FeedPosition;
use crate::core::error::StructureError;
use crate::core::key::EncodedKey;
use crate::core::reduce::{Aggregate, Reducer};
use crate::index::tree::{Cut, EntryKey, IndexEntry, RangeIter, ReduceTree};

// 扫描时每处理这么多条目检查一次 deadline
const DEADLINE_CHECK_EVERY: usize = 64;

/// 单个文档在某视图中的完整条目集（空集 = 从该视图移除）
#[derive(Clone, Debug, PartialEq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub entries: Vec<(EncodedKey, Value)>,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, entries: Vec<(EncodedKey, Value)>) -> Self {
        Self {
            doc_id: doc_id.into(),
            entries,
        }
    }

    pub fn removal(doc_id: impl Into<String>) -> Self {
        Self::new(doc_id, Vec::new())
    }

    fn index_entries(&self) -> Vec<Arc<IndexEntry>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, (key, value))| {
                Arc::new(IndexEntry {
                    id: EntryKey {
                        key: key.clone(),
                        doc_id: self.doc_id.clone(),
                        ordinal: i as u32,
                    },
                    value: value.clone(),
                })
            })
            .collect()
    }
}

/// 以升序表达的键区间（降序查询由调用方交换端点）
#[derive(Clone, Debug, PartialEq)]
pub struct KeyRange {
    pub lo: Cut,
    pub hi: Cut,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            lo: Cut::Start,
            hi: Cut::End,
        }
    }

    pub fn new(
        low: Option<EncodedKey>,
        high: Option<EncodedKey>,
        inclusive_low: bool,
        inclusive_high: bool,
    ) -> Self {
        let lo = match low {
            None => Cut::Start,
            Some(k) if inclusive_low => Cut::BeforeKey(k),
            Some(k) => Cut::AfterKey(k),
        };
        let hi = match high {
            None => Cut::End,
            Some(k) if inclusive_high => Cut::AfterKey(k),
            Some(k) => Cut::BeforeKey(k),
        };
        Self { lo, hi }
    }

    pub fn exact(key: EncodedKey) -> Self {
        Self::new(Some(key.clone()), Some(key), true, true)
    }

    /// 前缀范围：所有以 `prefix` 开头（组件意义上）的键
    pub fn prefix(prefix: EncodedKey) -> Self {
        let hi = prefix.prefix_end().map(Cut::BeforeKey).unwrap_or(Cut::End);
        Self {
            lo: Cut::BeforeKey(prefix),
            hi,
        }
    }

    /// 从续传切点恢复：升序替换下界，降序替换上界
    pub fn resume(&self, cut: Cut, descending: bool) -> Self {
        if descending {
            Self {
                lo: self.lo.clone(),
                hi: cut,
            }
        } else {
            Self {
                lo: cut,
                hi: self.hi.clone(),
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub limit: Option<usize>,
    pub skip: usize,
    pub descending: bool,
    pub deadline: Option<Instant>,
}

#[derive(Clone, Debug)]
pub struct ScanPage {
    pub rows: Vec<Arc<IndexEntry>>,
    /// 视图总条目数
    pub total_rows: usize,
    /// 首条结果之前（按遍历方向）的条目数
    pub offset: usize,
    /// limit / deadline 截断且仍有剩余时的续传切点
    pub next: Option<Cut>,
}

#[derive(Clone, Debug)]
pub struct ReducePage {
    pub rows: Vec<(EncodedKey, Aggregate)>,
    /// 因 skip 被丢弃的组数
    pub skipped: usize,
    pub next: Option<Cut>,
}

/// 已发布的只读视图状态：查询只读这个，写入方整体替换
pub struct ViewSnapshot {
    pub tree: ReduceTree,
    pub position: FeedPosition,
    pub doc_count: usize,
    pub generation: u64,
}

impl ViewSnapshot {
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// 惰性、可续传的区间序列
    pub fn iter(&self, range: &KeyRange, descending: bool) -> RangeIter {
        self.tree.range(&range.lo, &range.hi, descending)
    }

    pub fn scan(&self, range: &KeyRange, opts: &ScanOptions) -> ScanPage {
        let total_rows = self.tree.len();
        let before = if opts.descending {
            total_rows.saturating_sub(self.tree.count_before(&range.hi))
        } else {
            self.tree.count_before(&range.lo)
        };

        let mut it = self.iter(range, opts.descending).skip(opts.skip).peekable();
        let mut rows = Vec::new();
        let mut truncated = false;
        while it.peek().is_some() {
            if opts.limit.is_some_and(|l| rows.len() >= l) {
                truncated = true;
                break;
            }
            if rows.len() % DEADLINE_CHECK_EVERY == 0
                && !rows.is_empty()
                && opts.deadline.is_some_and(|d| Instant::now() >= d)
            {
                truncated = true;
                break;
            }
            if let Some(e) = it.next() {
                rows.push(e);
            }
        }

        let next = if truncated {
            rows.last().map(|e| {
                if opts.descending {
                    Cut::BeforeEntry(e.id.clone())
                } else {
                    Cut::AfterEntry(e.id.clone())
                }
            })
        } else {
            None
        };

        ScanPage {
            rows,
            total_rows,
            offset: (before + opts.skip).min(total_rows),
            next,
        }
    }

    /// 区间 reduce。group_level=0 返回单个聚合（空区间返回空结果）。
    pub fn reduce_range(
        &self,
        range: &KeyRange,
        group_level: usize,
        opts: &ScanOptions,
    ) -> ReducePage {
        if group_level == 0 {
            if self.tree.count_range(&range.lo, &range.hi) == 0 {
                return ReducePage {
                    rows: Vec::new(),
                    skipped: 0,
                    next: None,
                };
            }
            if opts.skip > 0 || opts.limit == Some(0) {
                return ReducePage {
                    rows: Vec::new(),
                    skipped: opts.skip.min(1),
                    next: None,
                };
            }
            let agg = self.tree.reduce(&range.lo, &range.hi);
            return ReducePage {
                rows: vec![(EncodedKey::from_bytes(Vec::new()), agg)],
                skipped: 0,
                next: None,
            };
        }
        let (mut rows, next) = self.tree.reduce_groups(
            &range.lo,
            &range.hi,
            group_level,
            opts.descending,
            opts.limit.map(|l| l + opts.skip),
            opts.deadline,
        );
        let skipped = opts.skip.min(rows.len());
        rows.drain(..skipped);
        ReducePage {
            rows,
            skipped,
            next,
        }
    }
}

/// Index Store：单视图的有序条目 + Reduction Tree。
///
/// 写入方唯一（该视图的 indexer），每批写入复制路径后一次性 `ArcSwap::store`，
/// 读者看到的要么是批前状态、要么是批后状态，不会看到中间态。
pub struct IndexStore {
    name: String,
    reducer: Reducer,
    current: ArcSwap<ViewSnapshot>,
    /// doc id → 当前条目（写入方使用，避免更新时全表扫描）
    by_doc: Mutex<HashMap<String, Vec<EntryKey>>>,
}

impl IndexStore {
    /// 无 reduce 的视图内部仍按 `_count` 维护聚合（总数 / 校验复用）
    pub fn new(name: impl Into<String>, reducer: Option<Reducer>) -> Self {
        let reducer = reducer.unwrap_or(Reducer::Count);
        Self {
            name: name.into(),
            current: ArcSwap::from_pointee(ViewSnapshot {
                tree: ReduceTree::new(reducer.clone()),
                position: FeedPosition::new(),
                doc_count: 0,
                generation: 0,
            }),
            reducer,
            by_doc: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.current.load_full()
    }

    pub fn position(&self) -> FeedPosition {
        self.current.load().position.clone()
    }

    pub fn upsert(&self, doc_id: &str, entries: Vec<(EncodedKey, Value)>) {
        self.apply_batch(vec![DocUpdate::new(doc_id, entries)], None);
    }

    pub fn remove(&self, doc_id: &str) {
        self.apply_batch(vec![DocUpdate::removal(doc_id)], None);
    }

    pub fn lookup_by_doc(&self, doc_id: &str) -> Vec<EncodedKey> {
        self.by_doc
            .lock()
            .get(doc_id)
            .map(|ids| ids.iter().map(|id| id.key.clone()).collect())
            .unwrap_or_default()
    }

    /// 原子应用一批文档替换，并（可选）推进位置；返回 (删除条目数, 插入条目数)
    pub fn apply_batch(
        &self,
        updates: Vec<DocUpdate>,
        position: Option<FeedPosition>,
    ) -> (usize, usize) {
        let mut by_doc = self.by_doc.lock();
        let cur = self.current.load_full();
        let mut tree = cur.tree.clone();
        let mut removed_n = 0usize;
        let mut inserted_n = 0usize;

        for update in updates {
            let old = by_doc.remove(&update.doc_id).unwrap_or_default();
            let inserted = update.index_entries();
            removed_n += old.len();
            inserted_n += inserted.len();
            if !inserted.is_empty() {
                by_doc.insert(
                    update.doc_id.clone(),
                    inserted.iter().map(|e| e.id.clone()).collect(),
                );
            }
            tree.apply_delta(&old, inserted);
        }

        self.current.store(Arc::new(ViewSnapshot {
            tree,
            position: position.unwrap_or_else(|| cur.position.clone()),
            doc_count: by_doc.len(),
            generation: cur.generation + 1,
        }));
        (removed_n, inserted_n)
    }

    /// 整体替换（初次 bulk load / 重建）：O(n) 建树后一次发布
    pub fn replace_all(&self, docs: Vec<DocUpdate>, position: FeedPosition) {
        let mut by_doc = self.by_doc.lock();
        let cur = self.current.load_full();
        let mut fresh: HashMap<String, Vec<EntryKey>> = HashMap::with_capacity(docs.len());
        let mut all = Vec::new();
        for d in docs {
            let entries = d.index_entries();
            if entries.is_empty() {
                continue;
            }
            fresh.insert(d.doc_id.clone(), entries.iter().map(|e| e.id.clone()).collect());
            all.extend(entries);
        }
        let tree = ReduceTree::from_sorted(self.reducer.clone(), all);
        *by_doc = fresh;
        self.current.store(Arc::new(ViewSnapshot {
            tree,
            position,
            doc_count: by_doc.len(),
            generation: cur.generation + 1,
        }));
    }

    /// 结构校验：树的 I4/I5 + doc 索引与树内容一致
    pub fn verify(&self) -> Result<(), StructureError> {
        let by_doc = self.by_doc.lock();
        let snap = self.current.load_full();
        snap.tree.verify()?;
        let mut listed = 0usize;
        for (doc_id, ids) in by_doc.iter() {
            listed += ids.len();
            if ids.iter().any(|id| snap.tree.get(id).is_none()) {
                return Err(StructureError::DocIndexMismatch {
                    doc_id: doc_id.clone(),
                });
            }
        }
        if listed != snap.tree.len() {
            let stray = snap
                .tree
                .iter()
                .find(|e| !by_doc.contains_key(&e.id.doc_id))
                .map(|e| e.id.doc_id.clone())
                .unwrap_or_default();
            return Err(StructureError::DocIndexMismatch { doc_id: stray });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&self) {
        let cur = self.current.load_full();
        let mut tree = cur.tree.clone();
        tree.corrupt_root_aggregate(Aggregate::Count(u64::MAX));
        self.current.store(Arc::new(ViewSnapshot {
            tree,
            position: cur.position.clone(),
            doc_count: cur.doc_count,
            generation: cur.generation + 1,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::{encode, key_from_json};
    use serde_json::json;

    fn ek(key: Value) -> EncodedKey {
        encode(&key_from_json(&key).unwrap()).unwrap()
    }

    fn contents(store: &IndexStore) -> Vec<(EntryKey, Value)> {
        store
            .snapshot()
            .tree
            .iter()
            .map(|e| (e.id.clone(), e.value.clone()))
            .collect()
    }

    #[test]
    fn upsert_replaces_previous_entries() {
        let s = IndexStore::new("v", Some(Reducer::Count));
        s.upsert("a1", vec![(ek(json!(["Q1", "u1", 1])), json!({"_rev": "1"}))]);
        s.upsert("a1", vec![(ek(json!(["Q1", "u1", 2])), json!({"_rev": "2"}))]);
        assert_eq!(s.lookup_by_doc("a1"), vec![ek(json!(["Q1", "u1", 2]))]);

        let snap = s.snapshot();
        let old = snap.scan(&KeyRange::exact(ek(json!(["Q1", "u1", 1]))), &ScanOptions::default());
        assert!(old.rows.is_empty());
        let new = snap.scan(&KeyRange::exact(ek(json!(["Q1", "u1", 2]))), &ScanOptions::default());
        assert_eq!(new.rows.len(), 1);
        assert_eq!(new.rows[0].id.doc_id, "a1");
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let s = IndexStore::new("v", None);
        let entries = vec![
            (ek(json!(["x"])), json!(1)),
            (ek(json!(["x"])), json!(2)),
            (ek(json!(["y"])), json!(3)),
        ];
        s.upsert("d", entries.clone());
        let once = contents(&s);
        s.upsert("d", entries);
        assert_eq!(contents(&s), once);
        assert_eq!(once.len(), 3);
        s.verify().unwrap();
    }

    #[test]
    fn empty_upsert_removes() {
        let s = IndexStore::new("v", None);
        s.upsert("d", vec![(ek(json!(["x"])), json!(1))]);
        s.upsert("d", Vec::new());
        assert!(s.snapshot().is_empty());
        assert!(s.lookup_by_doc("d").is_empty());
        assert_eq!(s.snapshot().doc_count, 0);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let s = IndexStore::new("v", Some(Reducer::Count));
        s.upsert("a", vec![(ek(json!(["k"])), json!(1))]);
        let before = s.snapshot();
        s.remove("a");
        assert_eq!(before.len(), 1);
        assert_eq!(s.snapshot().len(), 0);
        assert!(s.snapshot().generation > before.generation);
    }

    #[test]
    fn scan_pages_resume_from_token() {
        let s = IndexStore::new("v", None);
        for i in 0..10 {
            s.upsert(&format!("d{}", i), vec![(ek(json!([i / 2])), json!(i))]);
        }
        for descending in [false, true] {
            let range = KeyRange::new(Some(ek(json!([1]))), Some(ek(json!([3]))), true, true);
            let opts = ScanOptions {
                limit: Some(4),
                descending,
                ..ScanOptions::default()
            };
            let snap = s.snapshot();
            let p1 = snap.scan(&range, &opts);
            assert_eq!(p1.rows.len(), 4);
            let next = p1.next.clone().unwrap();
            let p2 = snap.scan(&range.resume(next, descending), &opts);
            assert_eq!(p2.rows.len(), 2);
            assert!(p2.next.is_none());

            let mut all: Vec<_> = p1.rows.iter().chain(p2.rows.iter()).map(|e| e.id.clone()).collect();
            if descending {
                all.reverse();
            }
            let mut sorted = all.clone();
            sorted.sort();
            assert_eq!(all, sorted);
            assert_eq!(all.len(), 6);
        }
    }

    #[test]
    fn elapsed_deadline_still_returns_progress() {
        let s = IndexStore::new("v", None);
        let docs = (0..300)
            .map(|i| DocUpdate::new(format!("d{:03}", i), vec![(ek(json!([i])), json!(i))]))
            .collect();
        s.replace_all(docs, FeedPosition::new());
        let opts = ScanOptions {
            deadline: Some(Instant::now()),
            ..ScanOptions::default()
        };
        let page = s.snapshot().scan(&KeyRange::all(), &opts);
        assert_eq!(page.rows.len(), DEADLINE_CHECK_EVERY);
        assert!(page.next.is_some());
    }

    #[test]
    fn grouped_reduce_resumes_after_deadline() {
        let s = IndexStore::new("v", Some(Reducer::Count));
        let docs = (0..40)
            .map(|i| DocUpdate::new(format!("d{:02}", i), vec![(ek(json!([i % 10, i])), json!(i))]))
            .collect();
        s.replace_all(docs, FeedPosition::new());
        let snap = s.snapshot();

        for descending in [false, true] {
            let expired = ScanOptions {
                deadline: Some(Instant::now()),
                descending,
                ..ScanOptions::default()
            };
            let range = KeyRange::all();
            let first = snap.reduce_range(&range, 1, &expired);
            assert_eq!(first.rows.len(), 1);
            let next = first.next.clone().unwrap();

            let rest = snap.reduce_range(
                &range.resume(next, descending),
                1,
                &ScanOptions {
                    descending,
                    ..ScanOptions::default()
                },
            );
            assert!(rest.next.is_none());
            let groups: Vec<_> = first.rows.iter().chain(rest.rows.iter()).collect();
            assert_eq!(groups.len(), 10);
            assert!(groups.iter().all(|(_, agg)| agg.as_count() == Some(4)));
            let mut keys: Vec<_> = groups.iter().map(|(k, _)| k.clone()).collect();
            if descending {
                keys.reverse();
            }
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn offsets_follow_scan_direction() {
        let s = IndexStore::new("v", None);
        for i in 0..10 {
            s.upsert(&format!("d{}", i), vec![(ek(json!([i])), json!(i))]);
        }
        let snap = s.snapshot();
        let range = KeyRange::new(Some(ek(json!([3]))), None, true, true);
        assert_eq!(snap.scan(&range, &ScanOptions::default()).offset, 3);
        let range = KeyRange::new(None, Some(ek(json!([6]))), true, true);
        let desc = ScanOptions {
            descending: true,
            ..ScanOptions::default()
        };
        assert_eq!(snap.scan(&range, &desc).offset, 3);
    }

    #[test]
    fn verify_flags_corruption() {
        let s = IndexStore::new("v", Some(Reducer::Count));
        for i in 0..5 {
            s.upsert(&format!("d{}", i), vec![(ek(json!([i])), json!(i))]);
        }
        s.verify().unwrap();
        s.corrupt_for_test();
        assert!(s.verify().is_err());
    }
}
