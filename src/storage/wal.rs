use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::document::FeedPosition;
use crate::storage::StoredDoc;

const WAL_MAGIC: u32 = 0x3157_5644; // "DVW1"
const WAL_VERSION: u32 = 1;
const WAL_FILE: &str = "batches.wal";
const SEAL_PREFIX: &str = "batches.wal.seal-";

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn crc32_simple(data: &[u8]) -> u32 {
    // 轻量校验：足够发现截断/随机翻转，非强校验
    let mut s: u32 = 0;
    for &b in data {
        s = s.wrapping_add(b as u32);
        s = s.rotate_left(3);
    }
    s
}

/// 一个已应用批次：批后位置 + 批内每个文档的完整替换
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub position: FeedPosition,
    pub docs: Vec<StoredDoc>,
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub batches: Vec<BatchRecord>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

struct WalInner {
    file: File,
    last_seal: u64,
}

/// 批次日志（WAL）。
///
/// - current: batches.wal
/// - sealed: batches.wal.seal-<id>（快照边界切分）
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    inner: Mutex<WalInner>,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(WAL_FILE);
        let file = open_or_init(&current)?;
        Ok(Self {
            dir,
            current,
            inner: Mutex::new(WalInner { file, last_seal: 0 }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 追加一条批次记录并 fsync（返回后该批次即为持久 checkpoint）
    pub fn append(&self, record: &BatchRecord) -> anyhow::Result<()> {
        let payload = bincode::serialize(record)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| anyhow::anyhow!("WAL record too large: {} bytes", payload.len()))?;
        let crc = crc32_simple(&payload);

        let mut inner = self.inner.lock();
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);
        inner.file.write_all(&frame)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// seal：当前 WAL 改名为 sealed 文件并新建空 WAL；返回 seal_id（严格递增）
    pub fn seal(&self) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;

        let id = now_seal_id().max(inner.last_seal + 1);
        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));
        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }
        inner.file = open_or_init(&self.current)?;
        inner.last_seal = id;
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> anyhow::Result<()> {
        if seal_id == 0 {
            return Ok(());
        }
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id <= seal_id {
                    let _ = std::fs::remove_file(p);
                }
            }
        }
        Ok(())
    }

    /// 回放：seal_id > checkpoint 的 sealed WAL（按 id 排序）+ 当前 WAL
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> anyhow::Result<WalReplayResult> {
        let mut sealed = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id > checkpoint_seal_id {
                    sealed.push((id, p));
                }
            }
        }
        sealed.sort_by_key(|(id, _)| *id);

        let mut batches = Vec::new();
        let mut truncated = 0usize;
        for (_, p) in sealed.iter() {
            let (mut b, t) = read_wal_file(p)?;
            truncated += t;
            batches.append(&mut b);
        }
        {
            // 读当前 WAL 时持锁，避免与 append 交错
            let _guard = self.inner.lock();
            let (mut cur, t) = read_wal_file(&self.current)?;
            truncated += t;
            batches.append(&mut cur);
        }

        Ok(WalReplayResult {
            batches,
            sealed_used: sealed.len(),
            truncated_tail_records: truncated,
        })
    }

    /// 丢弃全部日志（视图签名变化 / 重建时）
    pub fn reset(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if parse_seal_id(&p).is_some() {
                let _ = std::fs::remove_file(p);
            }
        }
        inner.file = write_header(&self.current)?;
        Ok(())
    }
}

fn write_header(path: &Path) -> anyhow::Result<File> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.sync_all()?;
    drop(f);
    Ok(OpenOptions::new().read(true).append(true).open(path)?)
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    if !path.exists() {
        return write_header(path);
    }

    let mut f = OpenOptions::new().read(true).append(true).open(path)?;
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    if f.read_exact(&mut hdr).is_err() {
        // 空文件/截断：重写 header
        return write_header(path);
    }

    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        tracing::warn!("WAL header mismatch at {}, starting fresh", path.display());
        return write_header(path);
    }
    Ok(f)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn read_wal_file(path: &Path) -> anyhow::Result<(Vec<BatchRecord>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    loop {
        let mut lb = [0u8; 8];
        if f.read_exact(&mut lb).is_err() {
            break;
        }
        let len = u32::from_le_bytes(lb[0..4].try_into()?) as usize;
        let crc = u32::from_le_bytes(lb[4..8].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if crc32_simple(&buf) != crc {
            // 校验失败：视为截断，停止读取
            truncated_tail += 1;
            break;
        }
        match bincode::deserialize::<BatchRecord>(&buf) {
            Ok(rec) => out.push(rec),
            Err(e) => {
                tracing::warn!("WAL record decode failed in {}: {}", path.display(), e);
                truncated_tail += 1;
                break;
            }
        }
    }
    Ok((out, truncated_tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key::{encode, KeyPart};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("docview-wal-{}-{}", tag, nanos))
    }

    fn record(seq: u64, doc: &str) -> BatchRecord {
        let key = encode(&[KeyPart::text("Q1")]).unwrap();
        BatchRecord {
            position: FeedPosition::from([(0, seq)]),
            docs: vec![StoredDoc {
                doc_id: doc.to_string(),
                entries: vec![(key, r#"{"_rev":"1-a"}"#.to_string())],
            }],
        }
    }

    #[test]
    fn append_seal_replay_respects_checkpoint() {
        let dir = unique_tmp_dir("basic");
        let wal = WalStore::open_in_dir(dir.clone()).unwrap();

        wal.append(&record(1, "a1")).unwrap();
        let seal1 = wal.seal().unwrap();
        wal.append(&record(2, "a2")).unwrap();

        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(r.batches.len(), 2);
        assert_eq!(r.sealed_used, 1);
        assert_eq!(r.batches[1], record(2, "a2"));

        let r2 = wal.replay_since_seal(seal1).unwrap();
        assert_eq!(r2.batches.len(), 1);

        wal.cleanup_sealed_up_to(seal1).unwrap();
        assert_eq!(wal.replay_since_seal(0).unwrap().batches.len(), 1);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = unique_tmp_dir("torn");
        let wal = WalStore::open_in_dir(dir.clone()).unwrap();
        wal.append(&record(1, "a1")).unwrap();
        wal.append(&record(2, "a2")).unwrap();
        drop(wal);

        let path = dir.join(WAL_FILE);
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();

        let wal = WalStore::open_in_dir(dir).unwrap();
        let r = wal.replay_since_seal(0).unwrap();
        assert_eq!(r.batches.len(), 1);
        assert_eq!(r.truncated_tail_records, 1);
    }

    #[test]
    fn reopen_keeps_records_and_reset_clears() {
        let dir = unique_tmp_dir("reopen");
        {
            let wal = WalStore::open_in_dir(dir.clone()).unwrap();
            wal.append(&record(1, "a1")).unwrap();
            wal.seal().unwrap();
            wal.append(&record(2, "a2")).unwrap();
        }
        let wal = WalStore::open_in_dir(dir).unwrap();
        assert_eq!(wal.replay_since_seal(0).unwrap().batches.len(), 2);
        wal.reset().unwrap();
        assert!(wal.replay_since_seal(0).unwrap().batches.is_empty());
    }
}
