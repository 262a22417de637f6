use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xxhash_rust::xxh3::xxh3_64;

use docview::core::answer::answer_views;
use docview::query::answer_statistics;
use docview::{EngineConfig, MemoryStore, QueryEngine, QueryOptions};

#[derive(Parser, Debug)]
#[command(name = "docview", about = "Materialized view indexer over Answer documents")]
struct Cli {
    /// 文档文件（JSON 数组或 JSON lines）；每个文档需带 `_id` 或 `id`
    #[arg(long)]
    docs: PathBuf,

    /// 配置文件（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 持久化视图状态；不带值时使用默认数据目录
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    persist: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    partitions: Option<u32>,

    /// 查询的视图
    #[arg(long)]
    view: Option<String>,

    /// 精确键（JSON）
    #[arg(long)]
    key: Option<String>,

    #[arg(long)]
    startkey: Option<String>,

    #[arg(long)]
    endkey: Option<String>,

    #[arg(long)]
    prefix: Option<String>,

    #[arg(long)]
    reduce: Option<bool>,

    #[arg(long)]
    group_level: Option<usize>,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    skip: Option<usize>,

    #[arg(long)]
    descending: bool,

    /// 打印每个视图的统计
    #[arg(long)]
    stats: bool,

    /// 打印某个内容的作答统计
    #[arg(long)]
    answer_stats: Option<String>,

    /// 与 --answer-stats 配合：选项数
    #[arg(long)]
    choices: Option<usize>,
}

fn parse_json_arg(name: &str, raw: &Option<String>) -> anyhow::Result<Option<Value>> {
    raw.as_deref()
        .map(|s| {
            serde_json::from_str(s).map_err(|e| anyhow::anyhow!("--{} is not valid JSON: {}", name, e))
        })
        .transpose()
}

/// 解析 JSON 数组或 JSON lines
fn parse_documents(text: &str) -> anyhow::Result<Vec<Value>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| anyhow::anyhow!("line {}: {}", i + 1, e))
        })
        .collect()
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    };
    if let Some(n) = cli.batch_size {
        config.batch_size = n;
    }
    if let Some(n) = cli.partitions {
        config.partitions = n;
    }
    if let Some(dir) = &cli.persist {
        config.state_dir = Some(if dir.as_os_str().is_empty() {
            EngineConfig::default_state_dir()
        } else {
            dir.clone()
        });
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("Config: {:?}", config);

    // 同一份输入按同一顺序加载，得到的变更流可重现：以内容哈希作为 epoch
    let text = std::fs::read_to_string(&cli.docs)?;
    let store = Arc::new(MemoryStore::with_epoch(
        config.partitions,
        xxh3_64(text.as_bytes()),
    ));
    let mut skipped = 0usize;
    for doc in parse_documents(&text)? {
        let id = doc
            .get("_id")
            .or_else(|| doc.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match id {
            Some(id) => {
                store.put(&id, doc);
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!("Skipped {} document(s) without an id", skipped);
    }
    info!("Loaded {} documents from {}", store.len(), cli.docs.display());

    let engine = Arc::new(QueryEngine::new(store.clone(), config.clone()));
    for v in answer_views() {
        engine.register(v)?;
    }
    engine.start();
    if config.report_interval_secs > 0 {
        tokio::spawn(engine.clone().report_loop(config.report_interval_secs));
    }

    tokio::select! {
        _ = engine.wait_live() => {},
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
            engine.shutdown().await;
            return Ok(());
        }
    }

    if let Some(view) = &cli.view {
        let opts = QueryOptions {
            reduce: cli.reduce,
            group_level: cli.group_level,
            limit: cli.limit,
            skip: cli.skip.unwrap_or(0),
            descending: cli.descending,
            key: parse_json_arg("key", &cli.key)?,
            startkey: parse_json_arg("startkey", &cli.startkey)?,
            endkey: parse_json_arg("endkey", &cli.endkey)?,
            prefix: parse_json_arg("prefix", &cli.prefix)?,
            ..QueryOptions::default()
        };
        let result = engine.query(view, &opts)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if let Some(content_id) = &cli.answer_stats {
        let s = answer_statistics(&engine, content_id, cli.choices)?;
        println!("{}", serde_json::to_string_pretty(&s)?);
    }

    if cli.stats {
        let report = engine.stats();
        eprintln!("{}", report);
        println!("{}", serde_json::to_string_pretty(&report.views)?);
    }

    engine.shutdown().await;
    info!("Shutting down...");
    Ok(())
}
