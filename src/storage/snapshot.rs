use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::document::FeedPosition;
use crate::storage::StoredDoc;

/// 视图快照文件 Header
const MAGIC: u32 = 0xD0C5_0001;
const VERSION_CURRENT: u32 = 2;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 4; // magic + version + state + data_len + checksum

/// 单个视图的完整落盘状态
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewImage {
    /// 视图定义签名；与当前定义不符时整份丢弃
    pub signature: u64,
    /// 产生 `position` 的变更流 epoch；流换了身份则位置无意义
    pub feed_epoch: u64,
    /// 写快照时切出的 WAL seal；回放只需读更新的 seal
    pub seal_id: u64,
    pub position: FeedPosition,
    pub docs: Vec<StoredDoc>,
}

impl ViewImage {
    pub fn entry_count(&self) -> usize {
        self.docs.iter().map(|d| d.entries.len()).sum()
    }
}

/// 原子快照存储。
///
/// 落盘流程：
/// 1) 写 index.db.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) 流式 bincode 写 body，边写边算 checksum / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都当作没有快照。
pub struct SnapshotStore {
    path: PathBuf,
}

struct SimpleChecksum {
    hash: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl SimpleChecksum {
    fn new() -> Self {
        Self {
            hash: 0,
            pending: [0u8; 4],
            pending_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len == 4 {
                self.process_chunk(self.pending);
                self.pending_len = 0;
                self.pending = [0u8; 4];
            }
        }

        let mut chunks = data.chunks_exact(4);
        for c in &mut chunks {
            self.process_chunk([c[0], c[1], c[2], c[3]]);
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            self.pending[..rest.len()].copy_from_slice(rest);
            self.pending_len = rest.len();
        }
    }

    fn finalize(mut self) -> u32 {
        if self.pending_len > 0 {
            let mut buf = [0u8; 4];
            buf[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            self.process_chunk(buf);
        }
        self.hash
    }

    fn process_chunk(&mut self, chunk: [u8; 4]) {
        self.hash = self.hash.wrapping_add(u32::from_le_bytes(chunk));
        self.hash = self.hash.rotate_left(7);
    }
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    checksum: SimpleChecksum,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            checksum: SimpleChecksum::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u32) {
        (self.bytes, self.checksum.finalize())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checksum.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u32, checksum: u32) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..16].copy_from_slice(&data_len.to_le_bytes());
    h[16..20].copy_from_slice(&checksum.to_le_bytes());
    h
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_if_valid(&self) -> anyhow::Result<Option<ViewImage>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path).await?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Snapshot too small, ignoring");
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u32::from_le_bytes(data[12..16].try_into()?) as usize;
        let stored_checksum = u32::from_le_bytes(data[16..20].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!(
                "Snapshot version mismatch: {} != {}",
                version,
                VERSION_CURRENT
            );
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Snapshot state INCOMPLETE, ignoring");
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Snapshot data length mismatch");
            return Ok(None);
        }

        let computed = simple_checksum(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Snapshot checksum mismatch: {} != {}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<ViewImage>(body) {
            Ok(img) => Ok(Some(img)),
            Err(e) => {
                tracing::warn!("Snapshot deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn write_atomic(&self, img: ViewImage) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_image(&path, &img)).await?
    }
}

/// 同步写盘部分（在阻塞线程池执行）
fn write_image(path: &Path, img: &ViewImage) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("db.tmp");

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

    let (data_len_u64, checksum) = {
        let mut cw = ChecksumWriter::new(&mut file);
        bincode::serialize_into(&mut cw, img)?;
        cw.finish()
    };
    let data_len: u32 = data_len_u64
        .try_into()
        .map_err(|_| anyhow::anyhow!("Snapshot too large (>{} bytes)", u32::MAX))?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header(STATE_COMMITTED, data_len, checksum))?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    tracing::info!(
        "Snapshot written: {} docs, {} entries, {} bytes",
        img.docs.len(),
        img.entry_count(),
        HEADER_SIZE + data_len as usize
    );
    Ok(())
}

/// 简单校验和（非加密，仅用于完整性检测）
fn simple_checksum(data: &[u8]) -> u32 {
    let mut c = SimpleChecksum::new();
    c.update(data);
    c.finalize()
}
