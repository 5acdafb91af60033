//! Utilities to decode/encode matter tlv

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result, Write};

use crate::error::DecodeError;

/// Buffer to encode matter tlv. Create buffer, write elements then use data member which contains encoded tlv.
/// ```
/// # use matim::tlv;
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// let mut tlv = tlv::TlvBuffer::new();
/// tlv.write_struct(1)?;
/// tlv.write_uint8(0, 100)?;
/// tlv.write_string(0, "test")?;
/// tlv.write_struct_end()?;
/// // now tlv.data contains encoded tlv buffer
/// # Ok(())
/// # }
/// ```
pub struct TlvBuffer {
    pub data: Vec<u8>,
}

const TYPE_INT_1: u8 = 0;
const TYPE_INT_2: u8 = 1;
const TYPE_INT_4: u8 = 2;
const TYPE_INT_8: u8 = 3;
const TYPE_UINT_1: u8 = 4;
const TYPE_UINT_2: u8 = 5;
const TYPE_UINT_4: u8 = 6;
const TYPE_UINT_8: u8 = 7;
const TYPE_BOOL_FALSE: u8 = 8;
const TYPE_BOOL_TRUE: u8 = 9;
const TYPE_FLOAT: u8 = 0xA;
const TYPE_DOUBLE: u8 = 0xB;
const TYPE_UTF8_L1: u8 = 0xC;
const TYPE_UTF8_L4: u8 = 0xE;
const TYPE_OCTET_STRING_L1: u8 = 0x10;
const TYPE_OCTET_STRING_L4: u8 = 0x12;
const TYPE_NULL: u8 = 0x14;

const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

const CTRL_ANON: u8 = 0;
const CTRL_CTX_L1: u8 = 1 << 5;

impl TlvBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(1024),
        }
    }
    pub fn from_vec(v: Vec<u8>) -> Self {
        Self { data: v }
    }
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.data.write_all(data)
    }
    fn write_control(&mut self, tag: Option<u8>, typ: u8) -> Result<()> {
        match tag {
            Some(tag) => {
                self.data.write_u8(CTRL_CTX_L1 | typ)?;
                self.data.write_u8(tag)
            }
            None => self.data.write_u8(CTRL_ANON | typ),
        }
    }
    pub fn write_anon_struct(&mut self) -> Result<()> {
        self.write_control(None, TYPE_STRUCT)
    }
    pub fn write_anon_list(&mut self) -> Result<()> {
        self.write_control(None, TYPE_LIST)
    }
    pub fn write_struct(&mut self, tag: u8) -> Result<()> {
        self.write_control(Some(tag), TYPE_STRUCT)
    }
    pub fn write_array(&mut self, tag: u8) -> Result<()> {
        self.write_control(Some(tag), TYPE_ARRAY)
    }
    pub fn write_list(&mut self, tag: u8) -> Result<()> {
        self.write_control(Some(tag), TYPE_LIST)
    }
    pub fn write_struct_end(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_END_CONTAINER)
    }
    pub fn write_string(&mut self, tag: u8, data: &str) -> Result<()> {
        self.write_string_tagged(Some(tag), data)
    }
    fn write_string_tagged(&mut self, tag: Option<u8>, data: &str) -> Result<()> {
        let bytes = data.as_bytes();
        self.write_len_prefixed(tag, TYPE_UTF8_L1, bytes)
    }
    pub fn write_octetstring(&mut self, tag: u8, data: &[u8]) -> Result<()> {
        self.write_len_prefixed(Some(tag), TYPE_OCTET_STRING_L1, data)
    }
    fn write_len_prefixed(&mut self, tag: Option<u8>, base_type: u8, data: &[u8]) -> Result<()> {
        if data.len() > 0xffff {
            self.write_control(tag, base_type + 2)?;
            self.data.write_u32::<LittleEndian>(data.len() as u32)?;
        } else if data.len() > 0xff {
            self.write_control(tag, base_type + 1)?;
            self.data.write_u16::<LittleEndian>(data.len() as u16)?;
        } else {
            self.write_control(tag, base_type)?;
            self.data.write_u8(data.len() as u8)?;
        }
        self.data.write_all(data)
    }
    pub fn write_int8(&mut self, tag: u8, value: i8) -> Result<()> {
        self.write_control(Some(tag), TYPE_INT_1)?;
        self.data.write_i8(value)
    }
    pub fn write_uint8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.write_control(Some(tag), TYPE_UINT_1)?;
        self.data.write_u8(value)
    }
    pub fn write_uint16(&mut self, tag: u8, value: u16) -> Result<()> {
        self.write_control(Some(tag), TYPE_UINT_2)?;
        self.data.write_u16::<LittleEndian>(value)
    }
    pub fn write_uint32(&mut self, tag: u8, value: u32) -> Result<()> {
        self.write_control(Some(tag), TYPE_UINT_4)?;
        self.data.write_u32::<LittleEndian>(value)
    }
    pub fn write_uint64(&mut self, tag: u8, value: u64) -> Result<()> {
        self.write_control(Some(tag), TYPE_UINT_8)?;
        self.data.write_u64::<LittleEndian>(value)
    }
    /// Unsigned integer in the smallest encoding that holds the value.
    pub fn write_uint(&mut self, tag: Option<u8>, value: u64) -> Result<()> {
        if value <= u8::MAX as u64 {
            self.write_control(tag, TYPE_UINT_1)?;
            self.data.write_u8(value as u8)
        } else if value <= u16::MAX as u64 {
            self.write_control(tag, TYPE_UINT_2)?;
            self.data.write_u16::<LittleEndian>(value as u16)
        } else if value <= u32::MAX as u64 {
            self.write_control(tag, TYPE_UINT_4)?;
            self.data.write_u32::<LittleEndian>(value as u32)
        } else {
            self.write_control(tag, TYPE_UINT_8)?;
            self.data.write_u64::<LittleEndian>(value)
        }
    }
    /// Signed integer in the smallest encoding that holds the value.
    pub fn write_int(&mut self, tag: Option<u8>, value: i64) -> Result<()> {
        if i8::try_from(value).is_ok() {
            self.write_control(tag, TYPE_INT_1)?;
            self.data.write_i8(value as i8)
        } else if i16::try_from(value).is_ok() {
            self.write_control(tag, TYPE_INT_2)?;
            self.data.write_i16::<LittleEndian>(value as i16)
        } else if i32::try_from(value).is_ok() {
            self.write_control(tag, TYPE_INT_4)?;
            self.data.write_i32::<LittleEndian>(value as i32)
        } else {
            self.write_control(tag, TYPE_INT_8)?;
            self.data.write_i64::<LittleEndian>(value)
        }
    }
    pub fn write_bool(&mut self, tag: u8, value: bool) -> Result<()> {
        self.write_bool_tagged(Some(tag), value)
    }
    fn write_bool_tagged(&mut self, tag: Option<u8>, value: bool) -> Result<()> {
        if value {
            self.write_control(tag, TYPE_BOOL_TRUE)
        } else {
            self.write_control(tag, TYPE_BOOL_FALSE)
        }
    }
    pub fn write_double(&mut self, tag: Option<u8>, value: f64) -> Result<()> {
        self.write_control(tag, TYPE_DOUBLE)?;
        self.data.write_f64::<LittleEndian>(value)
    }
    pub fn write_null(&mut self, tag: Option<u8>) -> Result<()> {
        self.write_control(tag, TYPE_NULL)
    }
}

impl Default for TlvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Enum containing data of decoded tlv element
#[derive(Debug, Clone, PartialEq)]
pub enum TlvItemValue {
    Int(u64),
    SignedInt(i64),
    Bool(bool),
    Float(f64),
    String(String),
    OctetString(Vec<u8>),
    Struct(Vec<TlvItem>),
    Array(Vec<TlvItem>),
    List(Vec<TlvItem>),
    Nil(),
}

impl TlvItemValue {
    /// Short name of the element type, used in datatype mismatch reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            TlvItemValue::Int(_) => "unsigned integer",
            TlvItemValue::SignedInt(_) => "signed integer",
            TlvItemValue::Bool(_) => "boolean",
            TlvItemValue::Float(_) => "float",
            TlvItemValue::String(_) => "utf8 string",
            TlvItemValue::OctetString(_) => "octet string",
            TlvItemValue::Struct(_) => "structure",
            TlvItemValue::Array(_) => "array",
            TlvItemValue::List(_) => "list",
            TlvItemValue::Nil() => "null",
        }
    }

    pub fn children(&self) -> Option<&[TlvItem]> {
        match self {
            TlvItemValue::Struct(c) | TlvItemValue::Array(c) | TlvItemValue::List(c) => Some(c),
            _ => None,
        }
    }
}

/// Decoded tlv element returned by [decode_tlv]. `tag` is None for anonymous elements.
#[derive(Debug, Clone, PartialEq)]
pub struct TlvItem {
    pub tag: Option<u8>,
    pub value: TlvItemValue,
}

impl TlvItem {
    pub fn new(tag: Option<u8>, value: TlvItemValue) -> Self {
        Self { tag, value }
    }
    pub fn ctx(tag: u8, value: TlvItemValue) -> Self {
        Self {
            tag: Some(tag),
            value,
        }
    }
    pub fn get(&self, tag: &[u8]) -> Option<&TlvItemValue> {
        self.get_item(tag).map(|i| &i.value)
    }
    pub fn get_item(&self, tag: &[u8]) -> Option<&TlvItem> {
        if !tag.is_empty() {
            if let Some(lst) = self.value.children() {
                for l in lst {
                    if l.tag == Some(tag[0]) {
                        return l.get_item(&tag[1..]);
                    };
                }
            }
            None
        } else {
            Some(self)
        }
    }
    pub fn get_children(&self, tag: &[u8]) -> Option<&[TlvItem]> {
        self.get(tag).and_then(|v| v.children())
    }
    pub fn get_int(&self, tag: &[u8]) -> Option<u64> {
        match self.get(tag) {
            Some(TlvItemValue::Int(i)) => Some(*i),
            Some(TlvItemValue::SignedInt(i)) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }
    pub fn get_bool(&self, tag: &[u8]) -> Option<bool> {
        let found = self.get(tag);
        if let Some(TlvItemValue::Bool(i)) = found {
            Some(*i)
        } else {
            None
        }
    }
    pub fn get_u8(&self, tag: &[u8]) -> Option<u8> {
        self.get_int(tag).and_then(|i| u8::try_from(i).ok())
    }
    pub fn get_u16(&self, tag: &[u8]) -> Option<u16> {
        self.get_int(tag).and_then(|i| u16::try_from(i).ok())
    }
    pub fn get_u32(&self, tag: &[u8]) -> Option<u32> {
        self.get_int(tag).and_then(|i| u32::try_from(i).ok())
    }
    pub fn get_u64(&self, tag: &[u8]) -> Option<u64> {
        self.get_int(tag)
    }
    pub fn get_octet_string(&self, tag: &[u8]) -> Option<&[u8]> {
        let found = self.get(tag);
        if let Some(TlvItemValue::OctetString(o)) = found {
            Some(o)
        } else {
            None
        }
    }
    pub fn get_string_owned(&self, tag: &[u8]) -> Option<String> {
        let found = self.get(tag);
        if let Some(TlvItemValue::String(o)) = found {
            Some(o.clone())
        } else {
            None
        }
    }

    pub fn encode_into(&self, buf: &mut TlvBuffer) -> Result<()> {
        let tag = self.tag;
        match &self.value {
            TlvItemValue::Int(i) => buf.write_uint(tag, *i),
            TlvItemValue::SignedInt(i) => buf.write_int(tag, *i),
            TlvItemValue::Bool(b) => buf.write_bool_tagged(tag, *b),
            TlvItemValue::Float(f) => buf.write_double(tag, *f),
            TlvItemValue::String(s) => buf.write_string_tagged(tag, s),
            TlvItemValue::OctetString(o) => buf.write_len_prefixed(tag, TYPE_OCTET_STRING_L1, o),
            TlvItemValue::Nil() => buf.write_null(tag),
            TlvItemValue::Struct(c) => Self::encode_container(buf, tag, TYPE_STRUCT, c),
            TlvItemValue::Array(c) => Self::encode_container(buf, tag, TYPE_ARRAY, c),
            TlvItemValue::List(c) => Self::encode_container(buf, tag, TYPE_LIST, c),
        }
    }

    fn encode_container(buf: &mut TlvBuffer, tag: Option<u8>, typ: u8, children: &[TlvItem]) -> Result<()> {
        buf.write_control(tag, typ)?;
        for c in children {
            c.encode_into(buf)?;
        }
        buf.write_struct_end()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut tlv = TlvBuffer::new();
        self.encode_into(&mut tlv)?;
        Ok(tlv.data)
    }
}

fn read_tag(tagctrl: u8, cursor: &mut Cursor<&[u8]>) -> std::result::Result<Option<u8>, DecodeError> {
    match tagctrl {
        0 => Ok(None),
        1 => Ok(Some(cursor.read_u8()?)),
        other => Err(DecodeError::UnsupportedTag(other)),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, size: u64) -> std::result::Result<Vec<u8>, DecodeError> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if size > remaining {
        return Err(DecodeError::Truncated);
    }
    let mut value = vec![0; size as usize];
    cursor.read_exact(&mut value)?;
    Ok(value)
}

/// Reads one element; returns None when the element is an end-of-container marker.
fn decode_element(cursor: &mut Cursor<&[u8]>) -> std::result::Result<Option<TlvItem>, DecodeError> {
    let fb = cursor.read_u8()?;
    let tp = fb & 0x1f;
    let tagctrl = fb >> 5;
    if tp == TYPE_END_CONTAINER {
        return Ok(None);
    }
    let tag = read_tag(tagctrl, cursor)?;
    let value = match tp {
        TYPE_INT_1 => TlvItemValue::SignedInt(cursor.read_i8()? as i64),
        TYPE_INT_2 => TlvItemValue::SignedInt(cursor.read_i16::<LittleEndian>()? as i64),
        TYPE_INT_4 => TlvItemValue::SignedInt(cursor.read_i32::<LittleEndian>()? as i64),
        TYPE_INT_8 => TlvItemValue::SignedInt(cursor.read_i64::<LittleEndian>()?),
        TYPE_UINT_1 => TlvItemValue::Int(cursor.read_u8()? as u64),
        TYPE_UINT_2 => TlvItemValue::Int(cursor.read_u16::<LittleEndian>()? as u64),
        TYPE_UINT_4 => TlvItemValue::Int(cursor.read_u32::<LittleEndian>()? as u64),
        TYPE_UINT_8 => TlvItemValue::Int(cursor.read_u64::<LittleEndian>()?),
        TYPE_BOOL_FALSE => TlvItemValue::Bool(false),
        TYPE_BOOL_TRUE => TlvItemValue::Bool(true),
        TYPE_FLOAT => TlvItemValue::Float(cursor.read_f32::<LittleEndian>()? as f64),
        TYPE_DOUBLE => TlvItemValue::Float(cursor.read_f64::<LittleEndian>()?),
        TYPE_UTF8_L1..=TYPE_UTF8_L4 => {
            let size = read_len(cursor, tp - TYPE_UTF8_L1)?;
            let value = read_bytes(cursor, size)?;
            TlvItemValue::String(String::from_utf8(value).map_err(|_| DecodeError::InvalidUtf8)?)
        }
        TYPE_OCTET_STRING_L1..=TYPE_OCTET_STRING_L4 => {
            let size = read_len(cursor, tp - TYPE_OCTET_STRING_L1)?;
            TlvItemValue::OctetString(read_bytes(cursor, size)?)
        }
        TYPE_NULL => TlvItemValue::Nil(),
        TYPE_STRUCT => TlvItemValue::Struct(decode_container(cursor)?),
        TYPE_ARRAY => TlvItemValue::Array(decode_container(cursor)?),
        TYPE_LIST => TlvItemValue::List(decode_container(cursor)?),
        _ => return Err(DecodeError::Malformed(format!("unknown tlv type 0x{:x}", tp))),
    };
    Ok(Some(TlvItem { tag, value }))
}

fn read_len(cursor: &mut Cursor<&[u8]>, width_code: u8) -> std::result::Result<u64, DecodeError> {
    Ok(match width_code {
        0 => cursor.read_u8()? as u64,
        1 => cursor.read_u16::<LittleEndian>()? as u64,
        _ => cursor.read_u32::<LittleEndian>()? as u64,
    })
}

fn decode_container(cursor: &mut Cursor<&[u8]>) -> std::result::Result<Vec<TlvItem>, DecodeError> {
    let mut container = Vec::new();
    while let Some(item) = decode_element(cursor)? {
        container.push(item);
    }
    Ok(container)
}

/// decode raw buffer with tlv data
pub fn decode_tlv(data: &[u8]) -> std::result::Result<TlvItem, DecodeError> {
    let mut cursor = std::io::Cursor::new(data);
    let mut container = Vec::new();
    while cursor.position() < data.len() as u64 {
        match decode_element(&mut cursor)? {
            Some(item) => container.push(item),
            None => return Err(DecodeError::Malformed("unbalanced end of container".to_owned())),
        }
    }
    if container.len() == 1 {
        container.pop().ok_or(DecodeError::Truncated)
    } else if container.is_empty() {
        Err(DecodeError::Truncated)
    } else {
        Ok(TlvItem {
            tag: None,
            value: TlvItemValue::List(container),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_tlv, TlvBuffer, TlvItem, TlvItemValue};
    use crate::error::DecodeError;

    #[test]
    fn test_struct_with_context_tags() {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_uint8(0, 6).unwrap();
        tlv.write_octetstring(0x1, &[1, 2, 3]).unwrap();
        tlv.write_struct_end().unwrap();
        assert_eq!(hex::encode(&tlv.data), "1524000630010301020318");

        let item = decode_tlv(&tlv.data).unwrap();
        assert_eq!(item.get_u8(&[0]), Some(6));
        assert_eq!(item.get_octet_string(&[1]), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_signed_and_minimal_width() {
        let mut tlv = TlvBuffer::new();
        tlv.write_anon_struct().unwrap();
        tlv.write_int(Some(1), -2).unwrap();
        tlv.write_uint(Some(2), 0x1234).unwrap();
        tlv.write_uint(Some(3), u64::MAX).unwrap();
        tlv.write_struct_end().unwrap();
        let item = decode_tlv(&tlv.data).unwrap();
        assert_eq!(item.get(&[1]), Some(&TlvItemValue::SignedInt(-2)));
        assert_eq!(item.get_u16(&[2]), Some(0x1234));
        assert_eq!(item.get_u64(&[3]), Some(u64::MAX));
        // uint width is not preserved, minimal encoding is
        assert_eq!(tlv.data[4], 0x25);
    }

    #[test]
    fn test_truncated_container() {
        // struct with one uint8 but without end marker
        let data = hex::decode("15240006").unwrap();
        assert_eq!(decode_tlv(&data), Err(DecodeError::Truncated));
        // octet string claiming more bytes than present
        let data = hex::decode("3001050102").unwrap();
        assert_eq!(decode_tlv(&data), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_item_reencode() {
        let item = TlvItem::new(
            None,
            TlvItemValue::Struct(vec![
                TlvItem::ctx(0, TlvItemValue::Array(vec![TlvItem::new(None, TlvItemValue::Int(7))])),
                TlvItem::ctx(1, TlvItemValue::String("kitchen".to_owned())),
                TlvItem::ctx(2, TlvItemValue::Nil()),
                TlvItem::ctx(3, TlvItemValue::Float(1.5)),
            ]),
        );
        let bytes = item.encode().unwrap();
        assert_eq!(decode_tlv(&bytes).unwrap(), item);
    }
}
