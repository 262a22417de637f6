use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::core::document::FeedPosition;
use crate::event::indexer::IndexerState;

/// 单视图的累计计数器（indexer 写，报告读）
#[derive(Debug, Default)]
pub struct ViewCounters {
    pub events_applied: AtomicU64,
    pub batches: AtomicU64,
    /// map 函数失败的文档数（该文档原有条目保持不变）
    pub map_errors: AtomicU64,
    /// 编码失败被丢弃的 emission 数
    pub encoding_errors: AtomicU64,
    /// 与首次观察到的键长度不一致的 emission 数
    pub arity_drift: AtomicU64,
    pub rebuilds: AtomicU64,
    pub last_batch_size: AtomicU64,
}

impl ViewCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// 某一时刻的视图统计
#[derive(Clone, Debug, Serialize)]
pub struct ViewStats {
    pub view: String,
    pub state: IndexerState,
    pub entries: usize,
    pub documents: usize,
    pub position: FeedPosition,
    /// 落后变更流的事件数
    pub lag: u64,
    pub events_applied: u64,
    pub batches: u64,
    pub last_batch_size: u64,
    pub map_errors: u64,
    pub encoding_errors: u64,
    pub arity_drift: u64,
    pub rebuilds: u64,
}

/// 全部视图 + 进程 RSS
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineReport {
    pub views: Vec<ViewStats>,
    pub process_rss_bytes: u64,
}

impl EngineReport {
    /// 从 /proc/self/statm 读取进程 RSS（非 Linux 返回 0）
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm: size resident shared text lib data dt（单位：页）
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for ViewStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "║ {:<48} ║", self.view)?;
        writeln!(
            f,
            "║   state: {:<12} lag: {:>10}              ║",
            format!("{:?}", self.state),
            self.lag
        )?;
        writeln!(
            f,
            "║   entries:  {:>10}  docs:    {:>10}        ║",
            self.entries, self.documents
        )?;
        writeln!(
            f,
            "║   events:   {:>10}  batches: {:>10}        ║",
            self.events_applied, self.batches
        )?;
        writeln!(
            f,
            "║   map err:  {:>10}  enc err: {:>10}        ║",
            self.map_errors, self.encoding_errors
        )?;
        writeln!(
            f,
            "║   drift:    {:>10}  rebuild: {:>10}        ║",
            self.arity_drift, self.rebuilds
        )?;
        Ok(())
    }
}

impl fmt::Display for EngineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           docview View Report                    ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        for v in &self.views {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            write!(f, "{}", v)?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
