//! `Answer` 文档上的八个视图。
//!
//! 每个视图只处理 `type == "Answer"` 的文档，value 统一为 `{"_rev": <revision>}`；
//! 缺失字段按 null 发射。

use serde_json::{json, Value};

use crate::core::document::Document;
use crate::core::reduce::Reducer;
use crate::core::view::{Emission, ViewDefinition};

pub const ANSWER_TYPE: &str = "Answer";

pub const BY_ID: &str = "by_id";
pub const BY_CONTENTID: &str = "by_contentid";
pub const BY_CONTENTID_ROUND_BODY_SUBJECT: &str = "by_contentid_round_body_subject";
pub const BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES: &str =
    "by_contentid_round_selectedchoiceindexes";
pub const BY_CONTENTID_CREATIONTIMESTAMP: &str = "by_contentid_creationtimestamp";
pub const BY_CONTENTID_CREATORID_ROUND: &str = "by_contentid_creatorid_round";
pub const BY_ROOMID: &str = "by_roomid";
pub const BY_CREATORID_ROOMID: &str = "by_creatorid_roomid";

fn rev_value(doc: &Document) -> Value {
    json!({ "_rev": doc.revision })
}

/// 生成 "按字段元组发射一次" 的视图
fn field_view(name: &str, fields: &'static [&'static str]) -> ViewDefinition {
    ViewDefinition::new(name, move |doc: &Document| {
        let key = fields.iter().map(|f| doc.field(f).clone()).collect();
        Ok(vec![Emission::new(key, rev_value(doc))])
    })
    .with_doc_type(ANSWER_TYPE)
}

pub fn answer_views() -> Vec<ViewDefinition> {
    vec![
        ViewDefinition::new(BY_ID, |doc: &Document| {
            Ok(vec![Emission::new(vec![json!(doc.id)], rev_value(doc))])
        })
        .with_doc_type(ANSWER_TYPE)
        .with_reducer(Reducer::Count),
        field_view(BY_CONTENTID, &["contentId"]).with_reducer(Reducer::Count),
        field_view(
            BY_CONTENTID_ROUND_BODY_SUBJECT,
            &[
                "contentId",
                "round",
                "abstention",
                "body",
                "subject",
                "successfulFreeTextAnswer",
            ],
        )
        .with_reducer(Reducer::Count),
        field_view(
            BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES,
            &["contentId", "round", "selectedChoiceIndexes"],
        )
        .with_reducer(Reducer::Count),
        field_view(
            BY_CONTENTID_CREATIONTIMESTAMP,
            &["contentId", "creationTimestamp"],
        ),
        field_view(
            BY_CONTENTID_CREATORID_ROUND,
            &["contentId", "creatorId", "round"],
        ),
        field_view(BY_ROOMID, &["roomId"]).with_reducer(Reducer::Count),
        field_view(BY_CREATORID_ROOMID, &["creatorId", "roomId"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_eight_views_with_expected_reducers() {
        let views = answer_views();
        let reduced: Vec<&str> = views
            .iter()
            .filter(|v| v.reducer.is_some())
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(views.len(), 8);
        assert_eq!(
            reduced,
            vec![
                BY_ID,
                BY_CONTENTID,
                BY_CONTENTID_ROUND_BODY_SUBJECT,
                BY_CONTENTID_ROUND_SELECTEDCHOICEINDEXES,
                BY_ROOMID
            ]
        );
    }

    #[test]
    fn missing_fields_emit_null() {
        let views = answer_views();
        let v = views
            .iter()
            .find(|v| v.name == BY_CONTENTID_CREATORID_ROUND)
            .unwrap();
        let doc = Document::new(
            "a1",
            "2-b",
            json!({"type": "Answer", "contentId": "Q1", "round": 1}),
        );
        let out = v.map(&doc).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, vec![json!("Q1"), Value::Null, json!(1)]);
        assert_eq!(out[0].value, json!({"_rev": "2-b"}));
    }
}
