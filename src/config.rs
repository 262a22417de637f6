use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 引擎配置（TOML，可被命令行覆盖）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 每个分区单次读取的事件数
    pub batch_size: usize,
    /// 无新事件时的轮询兜底间隔
    pub poll_interval_ms: u64,
    /// 落后超过该事件数时查询结果标记 stale
    pub stale_threshold: u64,
    /// 每多少个批次写一次完整快照
    pub snapshot_every_batches: u64,
    /// 每多少个批次做一次结构校验（0 = 仅在追平后校验一次）
    pub verify_every_batches: u64,
    /// 持久化目录；None 时纯内存运行
    pub state_dir: Option<PathBuf>,
    /// 内存文档存储的分区数
    pub partitions: u32,
    /// 统计报告间隔（0 = 不启动报告循环）
    pub report_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            poll_interval_ms: 250,
            stale_threshold: 1000,
            snapshot_every_batches: 64,
            verify_every_batches: 0,
            state_dir: None,
            partitions: 1,
            report_interval_secs: 0,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// 读取 TOML；文件不存在时返回默认值，解析失败报错
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: EngineConfig = toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `--persist` 未指定目录时的默认位置
    pub fn default_state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("docview")
    }

    pub fn view_dir(&self, view: &str) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(view))
    }
}
