//! Schema-validated conversion between application values and TLV.

use crypto_bigint::{Encoding, U256};
use std::collections::BTreeMap;

use crate::error::{DecodeError, EncodeError};
use crate::schema::{Metatype, SchemaNode};
use crate::tlv::{self, TlvItem, TlvItemValue};

/// Application side representation of a data element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Integer declared wider than 8 bytes.
    Wide(U256),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "signed integer",
            Value::UInt(_) => "unsigned integer",
            Value::Wide(_) => "wide integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    /// Field of an object value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(m) => m.get(name),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// JSON input as typed by users; strings stay strings, octet strings must be built directly.
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match (n.as_u64(), n.as_i64()) {
                (Some(u), _) => Value::UInt(u),
                (None, Some(i)) => Value::Int(i),
                _ => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

fn default_width(node: &SchemaNode) -> u8 {
    match node.byte_width {
        Some(w) => w,
        None if matches!(node.metatype, Metatype::Enum) => 1,
        None => 8,
    }
}

fn encode_mismatch(node: &SchemaNode, value: &Value) -> EncodeError {
    EncodeError::DatatypeMismatch {
        expected: format!("{} ({})", node.metatype, node.name),
        found: value.kind_name().to_owned(),
    }
}

fn decode_mismatch(node: &SchemaNode, value: &TlvItemValue) -> DecodeError {
    DecodeError::mismatch(format!("{} ({})", node.metatype, node.name), value.type_name())
}

fn field_tag(node: &SchemaNode) -> Result<u8, EncodeError> {
    u8::try_from(node.id).map_err(|_| EncodeError::OutOfRange {
        name: format!("tag of {}", node.name),
        width: 1,
    })
}

fn encode_integer(node: &SchemaNode, value: &Value) -> Result<TlvItemValue, EncodeError> {
    let width = default_width(node);
    let out_of_range = || EncodeError::OutOfRange {
        name: node.name.clone(),
        width,
    };
    if width > 8 {
        let wide = match value {
            Value::Wide(w) => *w,
            Value::UInt(u) => U256::from_u64(*u),
            Value::Int(i) if *i >= 0 => U256::from_u64(*i as u64),
            _ => return Err(encode_mismatch(node, value)),
        };
        let bytes = wide.to_le_bytes();
        let width = (width as usize).min(bytes.len());
        if bytes[width..].iter().any(|b| *b != 0) {
            return Err(out_of_range());
        }
        return Ok(TlvItemValue::OctetString(bytes[..width].to_vec()));
    }
    let bits = width as u32 * 8;
    if node.signed {
        let v = value.as_i64().ok_or_else(|| encode_mismatch(node, value))?;
        if bits < 64 {
            let max = (1i64 << (bits - 1)) - 1;
            let min = -(1i64 << (bits - 1));
            if v < min || v > max {
                return Err(out_of_range());
            }
        }
        Ok(TlvItemValue::SignedInt(v))
    } else {
        let v = match value {
            Value::Int(i) if *i < 0 => return Err(out_of_range()),
            other => other.as_u64().ok_or_else(|| encode_mismatch(node, value))?,
        };
        if bits < 64 && v >> bits != 0 {
            return Err(out_of_range());
        }
        Ok(TlvItemValue::Int(v))
    }
}

fn encode_untyped(value: &Value) -> Result<TlvItemValue, EncodeError> {
    Ok(match value {
        Value::Null => TlvItemValue::Nil(),
        Value::Bool(b) => TlvItemValue::Bool(*b),
        Value::Int(i) => TlvItemValue::SignedInt(*i),
        Value::UInt(u) => TlvItemValue::Int(*u),
        Value::Wide(w) => TlvItemValue::OctetString(w.to_le_bytes().to_vec()),
        Value::Float(f) => TlvItemValue::Float(*f),
        Value::String(s) => TlvItemValue::String(s.clone()),
        Value::Bytes(b) => TlvItemValue::OctetString(b.clone()),
        Value::Array(a) => TlvItemValue::Array(
            a.iter()
                .map(|v| Ok(TlvItem::new(None, encode_untyped(v)?)))
                .collect::<Result<Vec<_>, EncodeError>>()?,
        ),
        Value::Object(m) => {
            let mut fields = Vec::with_capacity(m.len());
            for (k, v) in m {
                let tag = k.parse::<u8>().map_err(|_| EncodeError::DatatypeMismatch {
                    expected: "numeric field tag".to_owned(),
                    found: k.clone(),
                })?;
                fields.push(TlvItem::ctx(tag, encode_untyped(v)?));
            }
            TlvItemValue::Struct(fields)
        }
    })
}

/// Builds the TLV element for `value` as described by `node`.
pub fn to_item(node: &SchemaNode, tag: Option<u8>, value: &Value) -> Result<TlvItem, EncodeError> {
    let encoded = match (node.metatype, value) {
        (Metatype::Reference, _) => return Err(EncodeError::UnresolvedSchema(node.name.clone())),
        (Metatype::Any, v) => encode_untyped(v)?,
        (_, Value::Null) if node.nullable => TlvItemValue::Nil(),
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, v) => encode_integer(node, v)?,
        (Metatype::Float, Value::Float(f)) => TlvItemValue::Float(*f),
        (Metatype::Float, v) => {
            TlvItemValue::Float(v.as_i64().ok_or_else(|| encode_mismatch(node, v))? as f64)
        }
        (Metatype::Boolean, Value::Bool(b)) => TlvItemValue::Bool(*b),
        (Metatype::String, Value::String(s)) => TlvItemValue::String(s.clone()),
        (Metatype::Bytes, Value::Bytes(b)) => TlvItemValue::OctetString(b.clone()),
        (Metatype::Object, Value::Object(fields)) => {
            let mut out = Vec::with_capacity(node.children.len());
            for child in &node.children {
                match fields.get(&child.name) {
                    Some(v) => out.push(to_item(child, Some(field_tag(child)?), v)?),
                    None if child.optional => {}
                    None => return Err(EncodeError::MissingField(child.name.clone())),
                }
            }
            TlvItemValue::Struct(out)
        }
        (Metatype::Array, Value::Array(items)) => {
            let element = node
                .children
                .first()
                .ok_or_else(|| EncodeError::UnresolvedSchema(node.name.clone()))?;
            TlvItemValue::Array(
                items
                    .iter()
                    .map(|v| to_item(element, None, v))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        (_, v) => return Err(encode_mismatch(node, v)),
    };
    Ok(TlvItem::new(tag, encoded))
}

fn decode_out_of_range(node: &SchemaNode) -> DecodeError {
    DecodeError::OutOfRange {
        name: node.name.clone(),
        width: default_width(node),
    }
}

/// Decoded integers obey the same width and signedness limits as encoded ones.
fn checked_integer(node: &SchemaNode, value: Value) -> Result<Value, DecodeError> {
    match encode_integer(node, &value) {
        Ok(_) => Ok(value),
        Err(EncodeError::OutOfRange { .. }) => Err(decode_out_of_range(node)),
        Err(_) => Err(DecodeError::mismatch(format!("{} ({})", node.metatype, node.name), value.kind_name())),
    }
}

/// Reads a TLV element as described by `node`.
pub fn from_item(node: &SchemaNode, item: &TlvItemValue) -> Result<Value, DecodeError> {
    Ok(match (node.metatype, item) {
        (Metatype::Reference, _) => {
            return Err(DecodeError::Malformed(format!("schema node {} not resolved", node.name)))
        }
        (Metatype::Any, v) => decode_untyped(v),
        (_, TlvItemValue::Nil()) if node.nullable => Value::Null,
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, v) if default_width(node) > 8 => match v {
            TlvItemValue::OctetString(b) if b.len() <= 32 => {
                let mut bytes = [0u8; 32];
                bytes[..b.len()].copy_from_slice(b);
                checked_integer(node, Value::Wide(U256::from_le_bytes(bytes)))?
            }
            TlvItemValue::Int(u) => checked_integer(node, Value::Wide(U256::from_u64(*u)))?,
            other => return Err(decode_mismatch(node, other)),
        },
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, TlvItemValue::SignedInt(i)) if node.signed => {
            checked_integer(node, Value::Int(*i))?
        }
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, TlvItemValue::Int(u)) if node.signed => {
            let v = i64::try_from(*u).map_err(|_| decode_out_of_range(node))?;
            checked_integer(node, Value::Int(v))?
        }
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, TlvItemValue::Int(u)) => {
            checked_integer(node, Value::UInt(*u))?
        }
        (Metatype::Integer | Metatype::Enum | Metatype::Bitmap, TlvItemValue::SignedInt(i)) if *i >= 0 => {
            checked_integer(node, Value::UInt(*i as u64))?
        }
        (Metatype::Float, TlvItemValue::Float(f)) => Value::Float(*f),
        (Metatype::Boolean, TlvItemValue::Bool(b)) => Value::Bool(*b),
        (Metatype::String, TlvItemValue::String(s)) => Value::String(s.clone()),
        (Metatype::Bytes, TlvItemValue::OctetString(b)) => Value::Bytes(b.clone()),
        (Metatype::Object, TlvItemValue::Struct(items)) => {
            let mut out = BTreeMap::new();
            for child in &node.children {
                let found = items.iter().find(|i| i.tag.map(u32::from) == Some(child.id));
                match found {
                    Some(i) => {
                        out.insert(child.name.clone(), from_item(child, &i.value)?);
                    }
                    None if child.optional => {}
                    None => return Err(DecodeError::MissingField(child.name.clone())),
                }
            }
            Value::Object(out)
        }
        (Metatype::Array, TlvItemValue::Array(items) | TlvItemValue::List(items)) => {
            let element = node
                .children
                .first()
                .ok_or_else(|| DecodeError::Malformed(format!("array {} has no element type", node.name)))?;
            Value::Array(
                items
                    .iter()
                    .map(|i| from_item(element, &i.value))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        (_, v) => return Err(decode_mismatch(node, v)),
    })
}

/// Converts TLV without schema. Structure keys are the context tag numbers.
pub fn decode_untyped(item: &TlvItemValue) -> Value {
    match item {
        TlvItemValue::Int(u) => Value::UInt(*u),
        TlvItemValue::SignedInt(i) => Value::Int(*i),
        TlvItemValue::Bool(b) => Value::Bool(*b),
        TlvItemValue::Float(f) => Value::Float(*f),
        TlvItemValue::String(s) => Value::String(s.clone()),
        TlvItemValue::OctetString(o) => Value::Bytes(o.clone()),
        TlvItemValue::Nil() => Value::Null,
        TlvItemValue::Struct(items) => Value::Object(
            items
                .iter()
                .enumerate()
                .map(|(n, i)| (i.tag.map_or(n as u32, u32::from).to_string(), decode_untyped(&i.value)))
                .collect(),
        ),
        TlvItemValue::Array(items) | TlvItemValue::List(items) => {
            Value::Array(items.iter().map(|i| decode_untyped(&i.value)).collect())
        }
    }
}

/// Encodes `value` as an anonymous TLV element.
pub fn encode(node: &SchemaNode, value: &Value) -> Result<Vec<u8>, EncodeError> {
    Ok(to_item(node, None, value)?.encode()?)
}

pub fn decode(node: &SchemaNode, data: &[u8]) -> Result<Value, DecodeError> {
    let item = tlv::decode_tlv(data)?;
    from_item(node, &item.value)
}
