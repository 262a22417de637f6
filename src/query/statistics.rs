//! 选择题作答统计：基于 `by_contentid_round_selectedchoiceindexes` 的分组计数。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::answer::BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES;
use crate::core::error::QueryError;
use crate::query::engine::{QueryEngine, QueryOptions};

/// 未给出选项数时接受的选项下标上限
const MAX_CHOICES: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Combination {
    pub selected_choice_indexes: Vec<u64>,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStatistics {
    pub round: i64,
    /// 下标 i = 选中第 i 个选项的作答数
    pub independent_counts: Vec<u64>,
    pub combinated_counts: Vec<Combination>,
    pub abstention_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerStatistics {
    pub content_id: String,
    pub round_statistics: Vec<RoundStatistics>,
    pub stale: bool,
}

/// 选项下标数组；非数组或含非整数元素时返回 None
fn choice_indexes(v: &Value) -> Option<Vec<u64>> {
    v.as_array()?.iter().map(Value::as_u64).collect()
}

/// 计算某个内容的各轮作答统计。
///
/// `choice_count` 给出选项数时 independent_counts 按其补齐；否则按出现过的最大下标。
/// 含越界下标（≥ 选项数，或未给出选项数时 ≥ `MAX_CHOICES`）的作答整条忽略。
pub fn answer_statistics(
    engine: &QueryEngine,
    content_id: &str,
    choice_count: Option<usize>,
) -> Result<AnswerStatistics, QueryError> {
    let opts = QueryOptions {
        reduce: Some(true),
        group_level: Some(3),
        prefix: Some(json!([content_id])),
        ..QueryOptions::default()
    };
    let result = engine.query(BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES, &opts)?;

    let bound = choice_count.unwrap_or(MAX_CHOICES);
    let mut out_of_range = 0u64;
    let mut rounds: BTreeMap<i64, RoundStatistics> = BTreeMap::new();
    for row in &result.rows {
        let count = row.value.as_u64().unwrap_or(0);
        let parts = row.key.as_array().map(Vec::as_slice).unwrap_or(&[]);
        let round = parts.get(1).and_then(Value::as_i64).unwrap_or(0);
        let selection = parts.get(2).unwrap_or(&Value::Null);

        let stats = rounds.entry(round).or_insert_with(|| RoundStatistics {
            round,
            independent_counts: vec![0; choice_count.unwrap_or(0)],
            combinated_counts: Vec::new(),
            abstention_count: 0,
        });

        match choice_indexes(selection) {
            Some(idx) if idx.iter().any(|&i| i >= bound as u64) => {
                out_of_range += count;
                tracing::debug!(
                    "Content {}: ignoring {} answer(s) with out-of-range selection {} in round {}",
                    content_id,
                    count,
                    selection,
                    round
                );
            }
            Some(idx) if !idx.is_empty() => {
                for &i in &idx {
                    let i = i as usize;
                    if stats.independent_counts.len() <= i {
                        stats.independent_counts.resize(i + 1, 0);
                    }
                    stats.independent_counts[i] += count;
                }
                stats.combinated_counts.push(Combination {
                    selected_choice_indexes: idx,
                    count,
                });
            }
            Some(_) => stats.abstention_count += count,
            None if selection.is_null() => stats.abstention_count += count,
            None => {
                tracing::debug!(
                    "Content {}: ignoring unexpected selection {} in round {}",
                    content_id,
                    selection,
                    round
                );
            }
        }
    }

    if out_of_range > 0 {
        tracing::debug!(
            "Content {}: {} answer(s) ignored for out-of-range choice indexes",
            content_id,
            out_of_range
        );
    }

    Ok(AnswerStatistics {
        content_id: content_id.to_string(),
        round_statistics: rounds.into_values().collect(),
        stale: result.stale,
    })
}
