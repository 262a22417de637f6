use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::StructureError;
use crate::core::key::EncodedKey;
use crate::core::reduce::{Aggregate, Reducer};

/// 条目身份：先按编码键，再按 doc id，最后按同一文档内的 emission 序号
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub key: EncodedKey,
    pub doc_id: String,
    pub ordinal: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub id: EntryKey,
    pub value: Value,
}

/// 条目序列上的一个切点（位于两条目之间）。
///
/// 同一个切点既可作下界也可作上界：范围 = 不在 lo 左侧、且在 hi 左侧的条目。
/// 也用作分页 / 超时的续传标记。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cut {
    Start,
    End,
    /// 位于首个 key >= k 的条目之前
    BeforeKey(EncodedKey),
    /// 位于最后一个 key <= k 的条目之后
    AfterKey(EncodedKey),
    BeforeEntry(EntryKey),
    AfterEntry(EntryKey),
}

impl Cut {
    /// 条目是否位于切点左侧
    pub fn is_after(&self, e: &EntryKey) -> bool {
        match self {
            Cut::Start => false,
            Cut::End => true,
            Cut::BeforeKey(k) => e.key < *k,
            Cut::AfterKey(k) => e.key <= *k,
            Cut::BeforeEntry(x) => e < x,
            Cut::AfterEntry(x) => e <= x,
        }
    }
}

type Link = Option<Arc<Node>>;

struct Node {
    entry: Arc<IndexEntry>,
    left: Link,
    right: Link,
    height: u32,
    len: usize,
    agg: Aggregate,
}

fn height(l: &Link) -> u32 {
    l.as_ref().map(|n| n.height).unwrap_or(0)
}

fn size(l: &Link) -> usize {
    l.as_ref().map(|n| n.len).unwrap_or(0)
}

/// Reduction Tree：持久化（写时复制）AVL 树，每个节点缓存子树聚合。
///
/// - 增删只复制根到目标的路径，旧根仍可被已发布的快照读取
/// - 区间 reduce 只沿两条边界路径下降：O(log n)
#[derive(Clone)]
pub struct ReduceTree {
    root: Link,
    reducer: Reducer,
}

impl ReduceTree {
    pub fn new(reducer: Reducer) -> Self {
        Self {
            root: None,
            reducer,
        }
    }

    /// 从已排序条目批量构建（O(n)，用于初次加载 / 重建）。
    /// 重复的 EntryKey 只保留最后一个。
    pub fn from_sorted(reducer: Reducer, mut entries: Vec<Arc<IndexEntry>>) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let mut deduped: Vec<Arc<IndexEntry>> = Vec::with_capacity(entries.len());
        for e in entries {
            match deduped.last_mut() {
                Some(last) if last.id == e.id => *last = e,
                _ => deduped.push(e),
            }
        }
        let tree = Self::new(reducer);
        let root = tree.build(&deduped);
        Self { root, ..tree }
    }

    fn build(&self, entries: &[Arc<IndexEntry>]) -> Link {
        if entries.is_empty() {
            return None;
        }
        let mid = entries.len() / 2;
        let left = self.build(&entries[..mid]);
        let right = self.build(&entries[mid + 1..]);
        Some(self.mk(entries[mid].clone(), left, right))
    }

    pub fn reducer(&self) -> &Reducer {
        &self.reducer
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn agg_of(&self, l: &Link) -> Aggregate {
        l.as_ref()
            .map(|n| n.agg.clone())
            .unwrap_or_else(|| self.reducer.identity())
    }

    fn mk(&self, entry: Arc<IndexEntry>, left: Link, right: Link) -> Arc<Node> {
        let leaf = self.reducer.leaf(&entry.value);
        let agg = self.reducer.combine(
            &self.reducer.combine(&self.agg_of(&left), &leaf),
            &self.agg_of(&right),
        );
        Arc::new(Node {
            height: 1 + height(&left).max(height(&right)),
            len: 1 + size(&left) + size(&right),
            entry,
            left,
            right,
            agg,
        })
    }

    fn balance(&self, entry: Arc<IndexEntry>, left: Link, right: Link) -> Arc<Node> {
        let hl = height(&left);
        let hr = height(&right);
        if hl > hr + 1 {
            if let Some(l) = left.as_ref() {
                if height(&l.left) >= height(&l.right) {
                    let new_right = self.mk(entry, l.right.clone(), right);
                    return self.mk(l.entry.clone(), l.left.clone(), Some(new_right));
                }
                if let Some(lr) = l.right.as_ref() {
                    let new_left = self.mk(l.entry.clone(), l.left.clone(), lr.left.clone());
                    let new_right = self.mk(entry, lr.right.clone(), right);
                    return self.mk(lr.entry.clone(), Some(new_left), Some(new_right));
                }
            }
        } else if hr > hl + 1 {
            if let Some(r) = right.as_ref() {
                if height(&r.right) >= height(&r.left) {
                    let new_left = self.mk(entry, left, r.left.clone());
                    return self.mk(r.entry.clone(), Some(new_left), r.right.clone());
                }
                if let Some(rl) = r.left.as_ref() {
                    let new_left = self.mk(entry, left, rl.left.clone());
                    let new_right = self.mk(r.entry.clone(), rl.right.clone(), r.right.clone());
                    return self.mk(rl.entry.clone(), Some(new_left), Some(new_right));
                }
            }
        }
        self.mk(entry, left, right)
    }

    /// 插入；同一 EntryKey 已存在时替换并返回旧条目
    pub fn insert(&mut self, entry: Arc<IndexEntry>) -> Option<Arc<IndexEntry>> {
        let (root, old) = self.insert_at(&self.root, entry);
        self.root = Some(root);
        old
    }

    fn insert_at(&self, link: &Link, entry: Arc<IndexEntry>) -> (Arc<Node>, Option<Arc<IndexEntry>>) {
        let Some(n) = link else {
            return (self.mk(entry, None, None), None);
        };
        match entry.id.cmp(&n.entry.id) {
            Ordering::Less => {
                let (l, old) = self.insert_at(&n.left, entry);
                (self.balance(n.entry.clone(), Some(l), n.right.clone()), old)
            }
            Ordering::Greater => {
                let (r, old) = self.insert_at(&n.right, entry);
                (self.balance(n.entry.clone(), n.left.clone(), Some(r)), old)
            }
            Ordering::Equal => (
                self.mk(entry, n.left.clone(), n.right.clone()),
                Some(n.entry.clone()),
            ),
        }
    }

    pub fn remove(&mut self, id: &EntryKey) -> Option<Arc<IndexEntry>> {
        let (root, removed) = self.remove_at(&self.root, id);
        if removed.is_some() {
            self.root = root;
        }
        removed
    }

    fn remove_at(&self, link: &Link, id: &EntryKey) -> (Link, Option<Arc<IndexEntry>>) {
        let Some(n) = link else {
            return (None, None);
        };
        match id.cmp(&n.entry.id) {
            Ordering::Less => {
                let (l, removed) = self.remove_at(&n.left, id);
                if removed.is_none() {
                    return (link.clone(), None);
                }
                (Some(self.balance(n.entry.clone(), l, n.right.clone())), removed)
            }
            Ordering::Greater => {
                let (r, removed) = self.remove_at(&n.right, id);
                if removed.is_none() {
                    return (link.clone(), None);
                }
                (Some(self.balance(n.entry.clone(), n.left.clone(), r)), removed)
            }
            Ordering::Equal => {
                let merged = match (&n.left, &n.right) {
                    (None, r) => r.clone(),
                    (l, None) => l.clone(),
                    (l, Some(r)) => {
                        let (r2, min) = self.remove_min(r);
                        Some(self.balance(min, l.clone(), r2))
                    }
                };
                (merged, Some(n.entry.clone()))
            }
        }
    }

    fn remove_min(&self, node: &Arc<Node>) -> (Link, Arc<IndexEntry>) {
        match &node.left {
            None => (node.right.clone(), node.entry.clone()),
            Some(l) => {
                let (nl, min) = self.remove_min(l);
                (
                    Some(self.balance(node.entry.clone(), nl, node.right.clone())),
                    min,
                )
            }
        }
    }

    /// 应用一次增量：只触及被改动条目所在路径，O(k·log n)
    pub fn apply_delta(&mut self, removed: &[EntryKey], inserted: Vec<Arc<IndexEntry>>) {
        for id in removed {
            self.remove(id);
        }
        for e in inserted {
            self.insert(e);
        }
    }

    pub fn get(&self, id: &EntryKey) -> Option<Arc<IndexEntry>> {
        let mut cur = self.root.as_ref();
        while let Some(n) = cur {
            match id.cmp(&n.entry.id) {
                Ordering::Less => cur = n.left.as_ref(),
                Ordering::Greater => cur = n.right.as_ref(),
                Ordering::Equal => return Some(n.entry.clone()),
            }
        }
        None
    }

    /// 切点左侧的条目数（CouchDB 语义下的 offset）
    pub fn count_before(&self, cut: &Cut) -> usize {
        let mut n_before = 0usize;
        let mut cur = self.root.as_ref();
        while let Some(n) = cur {
            if cut.is_after(&n.entry.id) {
                n_before += size(&n.left) + 1;
                cur = n.right.as_ref();
            } else {
                cur = n.left.as_ref();
            }
        }
        n_before
    }

    /// 区间条目数
    pub fn count_range(&self, lo: &Cut, hi: &Cut) -> usize {
        self.count_before(hi).saturating_sub(self.count_before(lo))
    }

    /// 区间聚合：lo/hi 之间（含义见 `Cut`）
    pub fn reduce(&self, lo: &Cut, hi: &Cut) -> Aggregate {
        self.reduce_between(&self.root, Some(lo), Some(hi))
    }

    fn reduce_between(&self, link: &Link, lo: Option<&Cut>, hi: Option<&Cut>) -> Aggregate {
        let Some(n) = link else {
            return self.reducer.identity();
        };
        if lo.is_none() && hi.is_none() {
            return n.agg.clone();
        }
        let e = &n.entry.id;
        if lo.is_some_and(|c| c.is_after(e)) {
            return self.reduce_between(&n.right, lo, hi);
        }
        if hi.is_some_and(|c| !c.is_after(e)) {
            return self.reduce_between(&n.left, lo, hi);
        }
        let left = self.reduce_between(&n.left, lo, None);
        let right = self.reduce_between(&n.right, None, hi);
        let mid = self.reducer.leaf(&n.entry.value);
        self.reducer
            .combine(&self.reducer.combine(&left, &mid), &right)
    }

    /// 分组聚合：按前 `level` 个组件分组（level=0 见 `reduce`）。
    ///
    /// 每组一次 O(log n) 的区间 reduce；`limit` / `deadline` 截断时返回续传切点。
    pub fn reduce_groups(
        &self,
        lo: &Cut,
        hi: &Cut,
        level: usize,
        descending: bool,
        limit: Option<usize>,
        deadline: Option<Instant>,
    ) -> (Vec<(EncodedKey, Aggregate)>, Option<Cut>) {
        let mut out = Vec::new();
        let mut lo = lo.clone();
        let mut hi = hi.clone();
        loop {
            let frontier = if descending { hi.clone() } else { lo.clone() };
            // deadline 只在至少产出一组后生效，续传总能前进
            if limit.is_some_and(|l| out.len() >= l)
                || (!out.is_empty() && deadline.is_some_and(|d| Instant::now() >= d))
            {
                let more = self.range(&lo, &hi, descending).next().is_some();
                return (out, more.then_some(frontier));
            }
            let Some(first) = self.range(&lo, &hi, descending).next() else {
                return (out, None);
            };
            let group = group_key(&first.id.key, level);
            let is_prefix_group = group.arity().ok() == Some(level);
            if descending {
                let group_lo = Cut::BeforeKey(group.clone());
                let agg = self.reduce(self.tighter_lo(&lo, &group_lo), &hi);
                out.push((group, agg));
                hi = group_lo;
            } else {
                let group_hi = if is_prefix_group {
                    group
                        .prefix_end()
                        .map(Cut::BeforeKey)
                        .unwrap_or(Cut::End)
                } else {
                    Cut::AfterKey(group.clone())
                };
                // 组边界与查询边界取交集
                let agg = self.reduce(&lo, self.tighter_hi(&hi, &group_hi));
                out.push((group, agg));
                lo = group_hi;
            }
        }
    }

    fn tighter_lo<'a>(&self, a: &'a Cut, b: &'a Cut) -> &'a Cut {
        if self.count_before(a) >= self.count_before(b) {
            a
        } else {
            b
        }
    }

    fn tighter_hi<'a>(&self, a: &'a Cut, b: &'a Cut) -> &'a Cut {
        if self.count_before(a) <= self.count_before(b) {
            a
        } else {
            b
        }
    }

    /// 惰性区间迭代（持有节点 Arc，不借用树）
    pub fn range(&self, lo: &Cut, hi: &Cut, descending: bool) -> RangeIter {
        let mut it = RangeIter {
            stack: Vec::new(),
            lo: lo.clone(),
            hi: hi.clone(),
            descending,
        };
        let mut cur = self.root.clone();
        while let Some(n) = cur {
            if descending {
                if !hi.is_after(&n.entry.id) {
                    cur = n.left.clone();
                } else {
                    cur = n.right.clone();
                    it.stack.push(n);
                }
            } else if lo.is_after(&n.entry.id) {
                cur = n.right.clone();
            } else {
                cur = n.left.clone();
                it.stack.push(n);
            }
        }
        it
    }

    pub fn iter(&self) -> RangeIter {
        self.range(&Cut::Start, &Cut::End, false)
    }

    /// 校验 I4（严格有序）与 I5（每个节点聚合 == 子树重新计算的聚合）
    pub fn verify(&self) -> Result<(), StructureError> {
        let mut prev: Option<EntryKey> = None;
        let mut position = 0usize;
        self.verify_node(&self.root, &mut prev, &mut position)?;
        Ok(())
    }

    fn verify_node(
        &self,
        link: &Link,
        prev: &mut Option<EntryKey>,
        position: &mut usize,
    ) -> Result<Aggregate, StructureError> {
        let Some(n) = link else {
            return Ok(self.reducer.identity());
        };
        let left = self.verify_node(&n.left, prev, position)?;
        if prev.as_ref().is_some_and(|p| *p >= n.entry.id) {
            return Err(StructureError::OutOfOrder {
                position: *position,
            });
        }
        *prev = Some(n.entry.id.clone());
        let here = *position;
        *position += 1;
        let right = self.verify_node(&n.right, prev, position)?;

        let hl = height(&n.left);
        let hr = height(&n.right);
        if n.height != 1 + hl.max(hr)
            || hl.abs_diff(hr) > 1
            || n.len != 1 + size(&n.left) + size(&n.right)
        {
            return Err(StructureError::Bookkeeping { position: here });
        }

        let recomputed = self.reducer.combine(
            &self.reducer.combine(&left, &self.reducer.leaf(&n.entry.value)),
            &right,
        );
        if !recomputed.approx_eq(&n.agg) {
            return Err(StructureError::AggregateMismatch { position: here });
        }
        Ok(recomputed)
    }

    #[cfg(test)]
    fn height(&self) -> u32 {
        height(&self.root)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_root_aggregate(&mut self, agg: Aggregate) {
        if let Some(root) = self.root.take() {
            self.root = Some(Arc::new(Node {
                entry: root.entry.clone(),
                left: root.left.clone(),
                right: root.right.clone(),
                height: root.height,
                len: root.len,
                agg,
            }));
        }
    }
}

/// 分组标签：前 level 个组件（键更短时为完整键）
pub fn group_key(key: &EncodedKey, level: usize) -> EncodedKey {
    key.truncate(level).unwrap_or_else(|_| key.clone())
}

pub struct RangeIter {
    stack: Vec<Arc<Node>>,
    lo: Cut,
    hi: Cut,
    descending: bool,
}

impl Iterator for RangeIter {
    type Item = Arc<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.stack.pop()?;
        let in_range = if self.descending {
            !self.lo.is_after(&n.entry.id)
        } else {
            self.hi.is_after(&n.entry.id)
        };
        if !in_range {
            self.stack.clear();
            return None;
        }
        let mut cur = if self.descending {
            n.left.clone()
        } else {
            n.right.clone()
        };
        while let Some(c) = cur {
            cur = if self.descending {
                c.right.clone()
            } else {
                c.left.clone()
            };
            self.stack.push(c);
        }
        Some(n.entry.clone())
    }
}
