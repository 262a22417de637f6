use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::EncodingError;

// 组件标签：标签字节决定跨类型顺序 null < false < true < number < string < array
const TAG_NULL: u8 = 0x10;
const TAG_FALSE: u8 = 0x20;
const TAG_TRUE: u8 = 0x21;
const TAG_NUMBER: u8 = 0x30;
const TAG_TEXT: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;
const ARRAY_END: u8 = 0x00;

const SIGN_BIT: u64 = 1u64 << 63;

/// 组合键的单个组件。
///
/// 只接受可全序比较的 JSON 原子值与数组；object 与非有限数字在
/// 转换时即被拒绝。
#[derive(Clone, Debug, PartialEq)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Array(Vec<KeyPart>),
}

/// 视图键：有序组件元组（标量 emit 视为 arity=1）
pub type Key = Vec<KeyPart>;

impl KeyPart {
    pub fn text(s: impl Into<String>) -> Self {
        KeyPart::Text(s.into())
    }

    fn rank(&self) -> u8 {
        match self {
            KeyPart::Null => 0,
            KeyPart::Bool(false) => 1,
            KeyPart::Bool(true) => 2,
            KeyPart::Number(_) => 3,
            KeyPart::Text(_) => 4,
            KeyPart::Array(_) => 5,
        }
    }

    /// 逻辑比较（与编码后的字节序一致，供测试与校验使用）
    pub fn collate(&self, other: &KeyPart) -> Ordering {
        match (self, other) {
            (KeyPart::Number(a), KeyPart::Number(b)) => unsigned_zero(*a).total_cmp(&unsigned_zero(*b)),
            (KeyPart::Text(a), KeyPart::Text(b)) => a.cmp(b),
            (KeyPart::Array(a), KeyPart::Array(b)) => collate_keys(a, b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyPart::Null => Value::Null,
            KeyPart::Bool(b) => Value::Bool(*b),
            KeyPart::Number(n) => number_to_json(*n),
            KeyPart::Text(s) => Value::String(s.clone()),
            KeyPart::Array(items) => Value::Array(items.iter().map(KeyPart::to_json).collect()),
        }
    }
}

fn number_to_json(n: f64) -> Value {
    // 整数值保持整数形态输出（round: 1 而不是 1.0）
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl TryFrom<&Value> for KeyPart {
    type Error = EncodingError;

    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Null => Ok(KeyPart::Null),
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Number(n) => {
                let f = n.as_f64().ok_or(EncodingError::NonFiniteNumber)?;
                if !f.is_finite() {
                    return Err(EncodingError::NonFiniteNumber);
                }
                Ok(KeyPart::Number(f))
            }
            Value::String(s) => Ok(KeyPart::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(KeyPart::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(KeyPart::Array),
            Value::Object(_) => Err(EncodingError::UnsupportedKind { kind: "object" }),
        }
    }
}

/// 从 JSON 构造键：数组按组件展开，标量视为单组件键。
pub fn key_from_json(v: &Value) -> Result<Key, EncodingError> {
    match v {
        Value::Array(items) => items.iter().map(KeyPart::try_from).collect(),
        other => Ok(vec![KeyPart::try_from(other)?]),
    }
}

pub fn key_to_json(key: &[KeyPart]) -> Value {
    Value::Array(key.iter().map(KeyPart::to_json).collect())
}

/// 逐组件比较；公共前缀相等时短者在前
pub fn collate_keys(a: &[KeyPart], b: &[KeyPart]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.collate(y) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

/// 保序编码后的键：字节序 == 逻辑序。
///
/// 每个组件是自定界、无前缀冲突的字节串，元组即组件拼接，
/// 因此元组前缀恰好是字节前缀（group_level / prefix scan 依赖这一点）。
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey(Vec<u8>);

impl fmt::Debug for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match decode(self) {
            Ok(k) => write!(f, "EncodedKey({})", key_to_json(&k)),
            Err(_) => write!(f, "EncodedKey({:02x?})", self.0),
        }
    }
}

impl EncodedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 组件数量
    pub fn arity(&self) -> Result<usize, EncodingError> {
        let mut off = 0usize;
        let mut n = 0usize;
        while off < self.0.len() {
            off += component_len(&self.0[off..])?;
            n += 1;
        }
        Ok(n)
    }

    /// 取前 `level` 个组件；不足 `level` 时返回完整键
    pub fn truncate(&self, level: usize) -> Result<EncodedKey, EncodingError> {
        let mut off = 0usize;
        for _ in 0..level {
            if off >= self.0.len() {
                break;
            }
            off += component_len(&self.0[off..])?;
        }
        Ok(EncodedKey(self.0[..off].to_vec()))
    }

    /// 是否落在 `prefix` 张成的范围内（prefix 的 arity <= 本键 arity）
    pub fn has_prefix(&self, prefix: &EncodedKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// 以本键为前缀的所有键的严格上界；全 0xFF 时无上界
    pub fn prefix_end(&self) -> Option<EncodedKey> {
        let mut out = self.0.clone();
        while let Some(last) = out.pop() {
            if last < 0xFF {
                out.push(last + 1);
                return Some(EncodedKey(out));
            }
        }
        None
    }
}

pub fn encode(key: &[KeyPart]) -> Result<EncodedKey, EncodingError> {
    let mut out = Vec::with_capacity(16 * key.len());
    for part in key {
        encode_part(&mut out, part)?;
    }
    Ok(EncodedKey(out))
}

fn encode_part(out: &mut Vec<u8>, part: &KeyPart) -> Result<(), EncodingError> {
    match part {
        KeyPart::Null => out.push(TAG_NULL),
        KeyPart::Bool(false) => out.push(TAG_FALSE),
        KeyPart::Bool(true) => out.push(TAG_TRUE),
        KeyPart::Number(n) => {
            if !n.is_finite() {
                return Err(EncodingError::NonFiniteNumber);
            }
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64_bytes(*n));
        }
        KeyPart::Text(s) => {
            out.push(TAG_TEXT);
            push_terminated_bytes(out, s.as_bytes());
        }
        KeyPart::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_part(out, item)?;
            }
            out.push(ARRAY_END);
        }
    }
    Ok(())
}

/// -0.0 归一为 0.0（比较与编码共用）
fn unsigned_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn ordered_f64_bytes(value: f64) -> [u8; 8] {
    let bits = unsigned_zero(value).to_bits();
    let ordered = if bits & SIGN_BIT == 0 {
        bits ^ SIGN_BIT
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

fn f64_from_ordered(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & SIGN_BIT != 0 {
        ordered ^ SIGN_BIT
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

// 0x00 转义为 0x00 0xFF，0x00 0x00 结束；保持字节序且无前缀冲突
fn push_terminated_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0 {
            out.extend_from_slice(&[0, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

fn read_terminated_bytes(buf: &[u8]) -> Result<(Vec<u8>, usize), EncodingError> {
    let mut out = Vec::new();
    let mut i = 0usize;
    loop {
        let b = *buf.get(i).ok_or(EncodingError::Malformed)?;
        if b != 0 {
            out.push(b);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(0xFF) => {
                out.push(0);
                i += 2;
            }
            Some(0) => return Ok((out, i + 2)),
            _ => return Err(EncodingError::Malformed),
        }
    }
}

fn component_len(buf: &[u8]) -> Result<usize, EncodingError> {
    decode_part(buf).map(|(_, n)| n)
}

fn decode_part(buf: &[u8]) -> Result<(KeyPart, usize), EncodingError> {
    let tag = *buf.first().ok_or(EncodingError::Malformed)?;
    match tag {
        TAG_NULL => Ok((KeyPart::Null, 1)),
        TAG_FALSE => Ok((KeyPart::Bool(false), 1)),
        TAG_TRUE => Ok((KeyPart::Bool(true), 1)),
        TAG_NUMBER => {
            let raw: [u8; 8] = buf
                .get(1..9)
                .ok_or(EncodingError::Malformed)?
                .try_into()
                .map_err(|_| EncodingError::Malformed)?;
            Ok((KeyPart::Number(f64_from_ordered(raw)), 9))
        }
        TAG_TEXT => {
            let (bytes, n) = read_terminated_bytes(&buf[1..])?;
            let s = String::from_utf8(bytes).map_err(|_| EncodingError::Malformed)?;
            Ok((KeyPart::Text(s), 1 + n))
        }
        TAG_ARRAY => {
            let mut items = Vec::new();
            let mut off = 1usize;
            loop {
                match buf.get(off) {
                    Some(&ARRAY_END) => return Ok((KeyPart::Array(items), off + 1)),
                    Some(_) => {
                        let (item, n) = decode_part(&buf[off..])?;
                        items.push(item);
                        off += n;
                    }
                    None => return Err(EncodingError::Malformed),
                }
            }
        }
        _ => Err(EncodingError::Malformed),
    }
}

/// 解码（仅用于输出 / 调试，排序只依赖字节）
pub fn decode(key: &EncodedKey) -> Result<Key, EncodingError> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < key.0.len() {
        let (part, n) = decode_part(&key.0[off..])?;
        out.push(part);
        off += n;
    }
    Ok(out)
}
