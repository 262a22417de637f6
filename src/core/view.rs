use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::document::Document;
use crate::core::error::{EncodingError, MapError};
use crate::core::key::{encode, KeyPart, EncodedKey};
use crate::core::reduce::Reducer;

/// map 输出的一条 emission：key 为组件元组（原始 JSON），value 不透明
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    pub key: Vec<Value>,
    pub value: Value,
}

impl Emission {
    pub fn new(key: Vec<Value>, value: Value) -> Self {
        Self { key, value }
    }

    pub fn encode_key(&self) -> Result<EncodedKey, EncodingError> {
        let parts = self
            .key
            .iter()
            .map(KeyPart::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        encode(&parts)
    }
}

pub type MapFn = Arc<dyn Fn(&Document) -> Result<Vec<Emission>, String> + Send + Sync>;

/// 视图定义：纯 map + 可选 reduce，构建期固定（无运行时代码注入）
#[derive(Clone)]
pub struct ViewDefinition {
    pub name: String,
    /// 文档类型谓词：只有 `type` 字段相等的文档才会进入 map
    pub doc_type: Option<String>,
    /// map 逻辑变更时递增，持久化状态的签名随之失效
    pub version: String,
    pub reducer: Option<Reducer>,
    map: MapFn,
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewDefinition")
            .field("name", &self.name)
            .field("doc_type", &self.doc_type)
            .field("version", &self.version)
            .field("reducer", &self.reducer)
            .finish()
    }
}

impl ViewDefinition {
    pub fn new<F>(name: impl Into<String>, map: F) -> Self
    where
        F: Fn(&Document) -> Result<Vec<Emission>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            doc_type: None,
            version: "1".to_string(),
            reducer: None,
            map: Arc::new(map),
        }
    }

    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn applies_to(&self, doc: &Document) -> bool {
        match &self.doc_type {
            Some(t) => doc.doc_type() == Some(t.as_str()),
            None => true,
        }
    }

    /// 执行 map。类型不匹配返回空集；map 报错或 panic 均转为 MapError。
    pub fn map(&self, doc: &Document) -> Result<Vec<Emission>, MapError> {
        if !self.applies_to(doc) {
            return Ok(Vec::new());
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.map)(doc)));
        let reason = match outcome {
            Ok(Ok(emissions)) => return Ok(emissions),
            Ok(Err(reason)) => reason,
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "map function panicked".to_string()),
        };
        Err(MapError {
            view: self.name.clone(),
            doc_id: doc.id.clone(),
            reason,
        })
    }

    /// 定义签名：名称 + 类型谓词 + reducer + 版本
    pub fn signature(&self) -> u64 {
        let mut buf = Vec::new();
        for part in [
            self.name.as_str(),
            self.doc_type.as_deref().unwrap_or(""),
            self.reducer.as_ref().map(Reducer::name).unwrap_or(""),
            self.version.as_str(),
        ] {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        xxh3_64(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_predicate_filters_before_map() {
        let v = ViewDefinition::new("v", |_d: &Document| Err("must not run".to_string()))
            .with_doc_type("Answer");
        let other = Document::new("c1", "1-a", json!({"type": "Content"}));
        assert_eq!(v.map(&other).unwrap(), Vec::new());
    }

    #[test]
    fn panics_become_map_errors() {
        let v = ViewDefinition::new("boom", |_d: &Document| -> Result<Vec<Emission>, String> {
            panic!("bad field")
        });
        let d = Document::new("a1", "1-a", json!({}));
        let err = v.map(&d).unwrap_err();
        assert_eq!(err.doc_id, "a1");
        assert_eq!(err.reason, "bad field");
    }

    #[test]
    fn signature_tracks_version() {
        let a = ViewDefinition::new("v", |_d: &Document| Ok(Vec::new()));
        let b = a.clone().with_version("2");
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), a.clone().signature());
    }
}
