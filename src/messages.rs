//! Message headers, secure channel helpers and interaction model actions.

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Read, Write};

use crate::error::{DecodeError, EncodeError};
use crate::report::{AttributePathFilter, ConcreteCommandPath, EventPathFilter};
use crate::status::StatusCode;
use crate::tlv::{self, TlvItem, TlvItemValue};

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<Vec<u8>>,
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.as_ref().is_some_and(|x| x.len() == 8) {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        if let Some(destination_node_id) = &self.destination_node_id {
            if destination_node_id.len() == 2 {
                flags |= Self::DSIZ_16
            } else if destination_node_id.len() == 8 {
                flags |= Self::DSIZ_64
            }
        }
        let mut out = Vec::with_capacity(1024);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(sn) = &self.source_node_id {
            if sn.len() == 8 {
                out.write_all(sn)?;
            }
        }
        if let Some(destination_node_id) = &self.destination_node_id {
            if destination_node_id.len() == 2 || destination_node_id.len() == 8 {
                out.write_all(destination_node_id)?;
            }
        }
        Ok(out)
    }
    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            let mut sn = vec![0; 8];
            cursor.read_exact(sn.as_mut())?;
            Some(sn)
        } else {
            None
        };
        let dst_size = match flags & 3 {
            Self::DSIZ_64 => 8,
            Self::DSIZ_16 => 2,
            _ => 0,
        };
        let destination_node_id = if dst_size > 0 {
            let mut dn = vec![0; dst_size];
            cursor.read_exact(dn.as_mut())?;
            Some(dn)
        } else {
            None
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolMessageHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub vendor_id: Option<u16>,
    pub protocol_id: u16,
    pub ack_counter: Option<u32>,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;
    pub const FLAG_SECURED_EXTENSIONS: u8 = 8;
    pub const FLAG_VENDOR: u8 = 0x10;

    pub const OPCODE_ACK: u8 = 0x10;
    pub const OPCODE_STATUS: u8 = 0x40;

    pub const INTERACTION_OPCODE_STATUS_RESP: u8 = 0x1;
    pub const INTERACTION_OPCODE_READ_REQ: u8 = 0x2;
    pub const INTERACTION_OPCODE_SUBSCRIBE_REQ: u8 = 0x3;
    pub const INTERACTION_OPCODE_SUBSCRIBE_RESP: u8 = 0x4;
    pub const INTERACTION_OPCODE_REPORT_DATA: u8 = 0x5;
    pub const INTERACTION_OPCODE_WRITE_REQ: u8 = 0x6;
    pub const INTERACTION_OPCODE_WRITE_RESP: u8 = 0x7;
    pub const INTERACTION_OPCODE_INVOKE_REQ: u8 = 0x8;
    pub const INTERACTION_OPCODE_INVOKE_RESP: u8 = 0x9;
    pub const INTERACTION_OPCODE_TIMED_REQ: u8 = 0xa;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;
    pub const PROTOCOL_ID_INTERACTION: u16 = 1;

    pub fn is_initiator(&self) -> bool {
        self.exchange_flags & Self::FLAG_INITIATOR != 0
    }
    pub fn needs_ack(&self) -> bool {
        self.exchange_flags & Self::FLAG_RELIABILITY != 0
    }
    pub fn is_standalone_ack(&self) -> bool {
        self.protocol_id == Self::PROTOCOL_ID_SECURE_CHANNEL && self.opcode == Self::OPCODE_ACK
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags = self.exchange_flags & !(Self::FLAG_ACK | Self::FLAG_VENDOR | Self::FLAG_SECURED_EXTENSIONS);
        if self.ack_counter.is_some() {
            flags |= Self::FLAG_ACK;
        }
        if self.vendor_id.is_some() {
            flags |= Self::FLAG_VENDOR;
        }
        let mut out = Vec::with_capacity(1024);
        out.write_u8(flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        if let Some(vendor) = self.vendor_id {
            out.write_u16::<LittleEndian>(vendor)?;
        }
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if let Some(ack) = self.ack_counter {
            out.write_u32::<LittleEndian>(ack)?;
        }
        Ok(out)
    }
    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let vendor_id = if (exchange_flags & Self::FLAG_VENDOR) != 0 {
            Some(cursor.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let ack_counter = if (exchange_flags & Self::FLAG_ACK) != 0 {
            Some(cursor.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        if (exchange_flags & Self::FLAG_SECURED_EXTENSIONS) != 0 {
            let len = cursor.read_u16::<LittleEndian>()?;
            let mut ext = vec![0; len as usize];
            cursor.read_exact(&mut ext)?;
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                vendor_id,
                protocol_id,
                ack_counter,
            },
            rest,
        ))
    }
}

/// Secure channel status report. Only CloseSession is acted upon.
#[derive(Debug, Clone, Copy)]
pub struct StatusReportInfo {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl StatusReportInfo {
    const PROTOCOL_CODE_CLOSE_SESSION: u16 = 3;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let general_code = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u32::<LittleEndian>()?;
        let protocol_code = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            general_code,
            protocol_id,
            protocol_code,
        })
    }
    pub fn is_close_session(&self) -> bool {
        self.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32
            && self.protocol_code == Self::PROTOCOL_CODE_CLOSE_SESSION
    }
}

impl std::fmt::Display for StatusReportInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StatusReportInfo: general_code={}, protocol_id={}, protocol_code={}",
            self.general_code, self.protocol_id, self.protocol_code
        )
    }
}

/// Decrypted message: both headers plus the undecoded application payload.
#[derive(Clone)]
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, payload) = ProtocolMessageHeader::decode(&rest)?;
        Ok(Self {
            message_header,
            protocol_header,
            payload,
        })
    }
}

/// Protocol header and empty payload of a standalone acknowledgement.
pub fn ack(exchange: u16, ack: u32, initiator: bool) -> Result<Vec<u8>> {
    let flags = if initiator {
        ProtocolMessageHeader::FLAG_INITIATOR
    } else {
        0
    };
    ProtocolMessageHeader {
        exchange_flags: flags,
        opcode: ProtocolMessageHeader::OPCODE_ACK,
        exchange_id: exchange,
        vendor_id: None,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: Some(ack),
    }
    .encode()
}

/// Secure channel status report asking the peer to drop the session.
pub fn close_session(exchange: u16) -> Result<Vec<u8>> {
    let mut b = ProtocolMessageHeader {
        exchange_flags: ProtocolMessageHeader::FLAG_INITIATOR,
        opcode: ProtocolMessageHeader::OPCODE_STATUS,
        exchange_id: exchange,
        vendor_id: None,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ack_counter: None,
    }
    .encode()?;
    b.write_u16::<LittleEndian>(0)?;
    b.write_u32::<LittleEndian>(ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL as u32)?;
    b.write_u16::<LittleEndian>(StatusReportInfo::PROTOCOL_CODE_CLOSE_SESSION)?;
    Ok(b)
}

const TAG_IM_REVISION: u8 = 0xff;
const IM_REVISION: u64 = 10;

fn uint(tag: u8, v: u64) -> TlvItem {
    TlvItem::ctx(tag, TlvItemValue::Int(v))
}
fn boolean(tag: u8, v: bool) -> TlvItem {
    TlvItem::ctx(tag, TlvItemValue::Bool(v))
}
fn anon_struct(fields: Vec<TlvItem>) -> TlvItem {
    TlvItem::new(None, TlvItemValue::Struct(fields))
}
fn message(mut fields: Vec<TlvItem>) -> TlvItem {
    fields.push(uint(TAG_IM_REVISION, IM_REVISION));
    anon_struct(fields)
}

fn missing(what: &str, tag: u8) -> DecodeError {
    DecodeError::MissingField(format!("{} tag {}", what, tag))
}
fn req_u64(item: &TlvItem, what: &str, tag: u8) -> Result<u64, DecodeError> {
    item.get_int(&[tag]).ok_or_else(|| missing(what, tag))
}
fn req_u16(item: &TlvItem, what: &str, tag: u8) -> Result<u16, DecodeError> {
    item.get_u16(&[tag]).ok_or_else(|| missing(what, tag))
}
fn req_u32(item: &TlvItem, what: &str, tag: u8) -> Result<u32, DecodeError> {
    item.get_u32(&[tag]).ok_or_else(|| missing(what, tag))
}
fn opt_bool(item: &TlvItem, tag: u8) -> bool {
    item.get_bool(&[tag]).unwrap_or(false)
}
fn req_item<'a>(item: &'a TlvItem, what: &str, tag: u8) -> Result<&'a TlvItem, DecodeError> {
    item.get_item(&[tag]).ok_or_else(|| missing(what, tag))
}
/// Elements of an optional array field; a missing field is an empty array.
fn array_of<'a>(item: &'a TlvItem, tag: u8) -> Result<&'a [TlvItem], DecodeError> {
    match item.get(&[tag]) {
        None => Ok(&[]),
        Some(TlvItemValue::Array(a)) | Some(TlvItemValue::List(a)) => Ok(a),
        Some(other) => Err(DecodeError::mismatch("array", other.type_name())),
    }
}
fn expect_struct(item: &TlvItem, what: &str) -> Result<(), DecodeError> {
    match &item.value {
        TlvItemValue::Struct(_) | TlvItemValue::List(_) => Ok(()),
        other => Err(DecodeError::mismatch(what, other.type_name())),
    }
}

fn attribute_path_to_tlv(p: &AttributePathFilter, tag: Option<u8>) -> TlvItem {
    let mut f = Vec::new();
    if let Some(n) = p.node_id {
        f.push(uint(1, n));
    }
    if let Some(e) = p.endpoint_id {
        f.push(uint(2, e as u64));
    }
    if let Some(c) = p.cluster_id {
        f.push(uint(3, c as u64));
    }
    if let Some(a) = p.attribute_id {
        f.push(uint(4, a as u64));
    }
    TlvItem::new(tag, TlvItemValue::List(f))
}

fn attribute_path_from_tlv(item: &TlvItem) -> Result<AttributePathFilter, DecodeError> {
    expect_struct(item, "attribute path")?;
    Ok(AttributePathFilter {
        node_id: item.get_u64(&[1]),
        endpoint_id: item.get_u16(&[2]),
        cluster_id: item.get_u32(&[3]),
        attribute_id: item.get_u32(&[4]),
    })
}

fn event_path_to_tlv(p: &EventPathFilter, tag: Option<u8>) -> TlvItem {
    let mut f = Vec::new();
    if let Some(n) = p.node_id {
        f.push(uint(0, n));
    }
    if let Some(e) = p.endpoint_id {
        f.push(uint(1, e as u64));
    }
    if let Some(c) = p.cluster_id {
        f.push(uint(2, c as u64));
    }
    if let Some(e) = p.event_id {
        f.push(uint(3, e as u64));
    }
    if p.is_urgent {
        f.push(boolean(4, true));
    }
    TlvItem::new(tag, TlvItemValue::List(f))
}

fn event_path_from_tlv(item: &TlvItem) -> Result<EventPathFilter, DecodeError> {
    expect_struct(item, "event path")?;
    Ok(EventPathFilter {
        node_id: item.get_u64(&[0]),
        endpoint_id: item.get_u16(&[1]),
        cluster_id: item.get_u32(&[2]),
        event_id: item.get_u32(&[3]),
        is_urgent: opt_bool(item, 4),
    })
}

fn command_path_to_tlv(p: &ConcreteCommandPath, tag: u8) -> TlvItem {
    TlvItem::ctx(
        tag,
        TlvItemValue::List(vec![
            uint(0, p.endpoint_id as u64),
            uint(1, p.cluster_id as u64),
            uint(2, p.command_id as u64),
        ]),
    )
}

fn command_path_from_tlv(item: &TlvItem) -> Result<ConcreteCommandPath, DecodeError> {
    expect_struct(item, "command path")?;
    Ok(ConcreteCommandPath {
        endpoint_id: req_u16(item, "command path endpoint", 0)?,
        cluster_id: req_u32(item, "command path cluster", 1)?,
        command_id: req_u32(item, "command path command", 2)?,
    })
}

fn status_ib_to_tlv(status: StatusCode, cluster_status: Option<u8>, tag: u8) -> TlvItem {
    let mut f = vec![uint(0, status.code() as u64)];
    if let Some(cs) = cluster_status {
        f.push(uint(1, cs as u64));
    }
    TlvItem::ctx(tag, TlvItemValue::Struct(f))
}

fn status_ib_from_tlv(item: &TlvItem) -> Result<(StatusCode, Option<u8>), DecodeError> {
    let code = item.get_u8(&[0]).ok_or_else(|| missing("status", 0))?;
    Ok((StatusCode::from(code), item.get_u8(&[1])))
}

fn event_filters_to_tlv(event_min: Option<u64>, tag: u8) -> Option<TlvItem> {
    event_min.map(|min| TlvItem::ctx(tag, TlvItemValue::Array(vec![anon_struct(vec![uint(1, min)])])))
}

fn event_filters_from_tlv(item: &TlvItem, tag: u8) -> Result<Option<u64>, DecodeError> {
    Ok(array_of(item, tag)?.iter().filter_map(|f| f.get_int(&[1])).min())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDataIb {
    pub data_version: Option<u32>,
    pub path: AttributePathFilter,
    pub data: TlvItemValue,
}

impl AttributeDataIb {
    fn to_tlv(&self, tag: Option<u8>) -> TlvItem {
        let mut f = Vec::with_capacity(3);
        if let Some(v) = self.data_version {
            f.push(uint(0, v as u64));
        }
        f.push(attribute_path_to_tlv(&self.path, Some(1)));
        f.push(TlvItem::ctx(2, self.data.clone()));
        TlvItem::new(tag, TlvItemValue::Struct(f))
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        expect_struct(item, "attribute data")?;
        Ok(Self {
            data_version: item.get_u32(&[0]),
            path: attribute_path_from_tlv(req_item(item, "attribute data path", 1)?)?,
            data: req_item(item, "attribute data", 2)?.value.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeStatusIb {
    pub path: AttributePathFilter,
    pub status: StatusCode,
    pub cluster_status: Option<u8>,
}

impl AttributeStatusIb {
    fn to_tlv(&self, tag: Option<u8>) -> TlvItem {
        TlvItem::new(
            tag,
            TlvItemValue::Struct(vec![
                attribute_path_to_tlv(&self.path, Some(0)),
                status_ib_to_tlv(self.status, self.cluster_status, 1),
            ]),
        )
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        expect_struct(item, "attribute status")?;
        let (status, cluster_status) = status_ib_from_tlv(req_item(item, "attribute status", 1)?)?;
        Ok(Self {
            path: attribute_path_from_tlv(req_item(item, "attribute status path", 0)?)?,
            status,
            cluster_status,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeReportIb {
    Status(AttributeStatusIb),
    Data(AttributeDataIb),
}

impl AttributeReportIb {
    pub fn to_tlv(&self) -> TlvItem {
        match self {
            AttributeReportIb::Status(s) => anon_struct(vec![s.to_tlv(Some(0))]),
            AttributeReportIb::Data(d) => anon_struct(vec![d.to_tlv(Some(1))]),
        }
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        if let Some(s) = item.get_item(&[0]) {
            return Ok(AttributeReportIb::Status(AttributeStatusIb::from_tlv(s)?));
        }
        Ok(AttributeReportIb::Data(AttributeDataIb::from_tlv(req_item(
            item,
            "attribute report",
            1,
        )?)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDataIb {
    pub path: EventPathFilter,
    pub number: u64,
    pub priority: u8,
    pub epoch_timestamp: u64,
    pub data: TlvItemValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStatusIb {
    pub path: EventPathFilter,
    pub status: StatusCode,
    pub cluster_status: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventReportIb {
    Status(EventStatusIb),
    Data(EventDataIb),
}

impl EventReportIb {
    pub fn to_tlv(&self) -> TlvItem {
        match self {
            EventReportIb::Status(s) => anon_struct(vec![TlvItem::ctx(
                0,
                TlvItemValue::Struct(vec![
                    event_path_to_tlv(&s.path, Some(0)),
                    status_ib_to_tlv(s.status, s.cluster_status, 1),
                ]),
            )]),
            EventReportIb::Data(d) => anon_struct(vec![TlvItem::ctx(
                1,
                TlvItemValue::Struct(vec![
                    event_path_to_tlv(&d.path, Some(0)),
                    uint(1, d.number),
                    uint(2, d.priority as u64),
                    uint(3, d.epoch_timestamp),
                    TlvItem::ctx(7, d.data.clone()),
                ]),
            )]),
        }
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        if let Some(s) = item.get_item(&[0]) {
            let (status, cluster_status) = status_ib_from_tlv(req_item(s, "event status", 1)?)?;
            return Ok(EventReportIb::Status(EventStatusIb {
                path: event_path_from_tlv(req_item(s, "event status path", 0)?)?,
                status,
                cluster_status,
            }));
        }
        let d = req_item(item, "event report", 1)?;
        expect_struct(d, "event data")?;
        Ok(EventReportIb::Data(EventDataIb {
            path: event_path_from_tlv(req_item(d, "event data path", 0)?)?,
            number: req_u64(d, "event number", 1)?,
            priority: d.get_u8(&[2]).ok_or_else(|| missing("event priority", 2))?,
            epoch_timestamp: d.get_u64(&[3]).unwrap_or(0),
            data: req_item(d, "event data", 7)?.value.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandDataIb {
    pub path: ConcreteCommandPath,
    pub fields: TlvItemValue,
    pub command_ref: Option<u16>,
}

impl CommandDataIb {
    fn to_tlv(&self, tag: Option<u8>) -> TlvItem {
        let mut f = vec![command_path_to_tlv(&self.path, 0), TlvItem::ctx(1, self.fields.clone())];
        if let Some(r) = self.command_ref {
            f.push(uint(2, r as u64));
        }
        TlvItem::new(tag, TlvItemValue::Struct(f))
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        expect_struct(item, "command data")?;
        Ok(Self {
            path: command_path_from_tlv(req_item(item, "command path", 0)?)?,
            fields: item
                .get(&[1])
                .cloned()
                .unwrap_or(TlvItemValue::Struct(Vec::new())),
            command_ref: item.get_u16(&[2]),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeResponseIb {
    Command(CommandDataIb),
    Status {
        path: ConcreteCommandPath,
        status: StatusCode,
        cluster_status: Option<u8>,
        command_ref: Option<u16>,
    },
}

impl InvokeResponseIb {
    fn to_tlv(&self) -> TlvItem {
        match self {
            InvokeResponseIb::Command(c) => anon_struct(vec![c.to_tlv(Some(0))]),
            InvokeResponseIb::Status {
                path,
                status,
                cluster_status,
                command_ref,
            } => {
                let mut f = vec![command_path_to_tlv(path, 0), status_ib_to_tlv(*status, *cluster_status, 1)];
                if let Some(r) = command_ref {
                    f.push(uint(2, *r as u64));
                }
                anon_struct(vec![TlvItem::ctx(1, TlvItemValue::Struct(f))])
            }
        }
    }
    fn from_tlv(item: &TlvItem) -> Result<Self, DecodeError> {
        if let Some(c) = item.get_item(&[0]) {
            return Ok(InvokeResponseIb::Command(CommandDataIb::from_tlv(c)?));
        }
        let s = req_item(item, "invoke response", 1)?;
        let (status, cluster_status) = status_ib_from_tlv(req_item(s, "command status", 1)?)?;
        Ok(InvokeResponseIb::Status {
            path: command_path_from_tlv(req_item(s, "command status path", 0)?)?,
            status,
            cluster_status,
            command_ref: s.get_u16(&[2]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadRequest {
    pub attribute_paths: Vec<AttributePathFilter>,
    pub event_paths: Vec<EventPathFilter>,
    pub event_min: Option<u64>,
    pub fabric_filtered: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscribeRequest {
    pub keep_subscriptions: bool,
    pub min_interval_floor: u16,
    pub max_interval_ceiling: u16,
    pub attribute_paths: Vec<AttributePathFilter>,
    pub event_paths: Vec<EventPathFilter>,
    pub event_min: Option<u64>,
    pub fabric_filtered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResponse {
    pub subscription_id: u32,
    pub max_interval: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportData {
    pub subscription_id: Option<u32>,
    pub attribute_reports: Vec<AttributeReportIb>,
    pub event_reports: Vec<EventReportIb>,
    pub more_chunked: bool,
    pub suppress_response: bool,
}

impl ReportData {
    /// Encoded size of the message without any report in it.
    pub fn envelope_len(subscription: bool) -> usize {
        let empty = ReportData {
            subscription_id: subscription.then_some(u32::MAX),
            attribute_reports: Vec::new(),
            event_reports: Vec::new(),
            more_chunked: true,
            suppress_response: true,
        };
        // both report arrays present: control, tag and end marker each
        empty.to_tlv().encode().map(|e| e.len()).unwrap_or(0) + 6
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteRequest {
    pub suppress_response: bool,
    pub timed: bool,
    pub writes: Vec<AttributeDataIb>,
    pub more_chunked: bool,
    /// Apply all writes or none of them.
    pub atomic: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteResponse {
    pub statuses: Vec<AttributeStatusIb>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvokeRequest {
    pub suppress_response: bool,
    pub timed: bool,
    pub commands: Vec<CommandDataIb>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InvokeResponse {
    pub suppress_response: bool,
    pub responses: Vec<InvokeResponseIb>,
    pub more_chunked: bool,
}

/// Interaction model message, discriminated by opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StatusResponse(StatusCode),
    ReadRequest(ReadRequest),
    SubscribeRequest(SubscribeRequest),
    SubscribeResponse(SubscribeResponse),
    ReportData(ReportData),
    WriteRequest(WriteRequest),
    WriteResponse(WriteResponse),
    InvokeRequest(InvokeRequest),
    InvokeResponse(InvokeResponse),
    TimedRequest(u16),
}

impl Action {
    pub fn opcode(&self) -> u8 {
        match self {
            Action::StatusResponse(_) => ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESP,
            Action::ReadRequest(_) => ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ,
            Action::SubscribeRequest(_) => ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_REQ,
            Action::SubscribeResponse(_) => ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_RESP,
            Action::ReportData(_) => ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA,
            Action::WriteRequest(_) => ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_REQ,
            Action::WriteResponse(_) => ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_RESP,
            Action::InvokeRequest(_) => ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_REQ,
            Action::InvokeResponse(_) => ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP,
            Action::TimedRequest(_) => ProtocolMessageHeader::INTERACTION_OPCODE_TIMED_REQ,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::StatusResponse(_) => "StatusResponse",
            Action::ReadRequest(_) => "ReadRequest",
            Action::SubscribeRequest(_) => "SubscribeRequest",
            Action::SubscribeResponse(_) => "SubscribeResponse",
            Action::ReportData(_) => "ReportData",
            Action::WriteRequest(_) => "WriteRequest",
            Action::WriteResponse(_) => "WriteResponse",
            Action::InvokeRequest(_) => "InvokeRequest",
            Action::InvokeResponse(_) => "InvokeResponse",
            Action::TimedRequest(_) => "TimedRequest",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(self.to_tlv().encode()?)
    }

    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let item = tlv::decode_tlv(payload)?;
        expect_struct(&item, "interaction message")?;
        Ok(match opcode {
            ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESP => {
                Action::StatusResponse(StatusCode::from(item.get_u8(&[0]).ok_or_else(|| missing("status", 0))?))
            }
            ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ => Action::ReadRequest(ReadRequest {
                attribute_paths: array_of(&item, 0)?
                    .iter()
                    .map(attribute_path_from_tlv)
                    .collect::<Result<_, _>>()?,
                event_paths: array_of(&item, 1)?
                    .iter()
                    .map(event_path_from_tlv)
                    .collect::<Result<_, _>>()?,
                event_min: event_filters_from_tlv(&item, 2)?,
                fabric_filtered: opt_bool(&item, 3),
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_REQ => Action::SubscribeRequest(SubscribeRequest {
                keep_subscriptions: opt_bool(&item, 0),
                min_interval_floor: req_u16(&item, "min interval floor", 1)?,
                max_interval_ceiling: req_u16(&item, "max interval ceiling", 2)?,
                attribute_paths: array_of(&item, 3)?
                    .iter()
                    .map(attribute_path_from_tlv)
                    .collect::<Result<_, _>>()?,
                event_paths: array_of(&item, 4)?
                    .iter()
                    .map(event_path_from_tlv)
                    .collect::<Result<_, _>>()?,
                event_min: event_filters_from_tlv(&item, 5)?,
                fabric_filtered: opt_bool(&item, 7),
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_RESP => {
                Action::SubscribeResponse(SubscribeResponse {
                    subscription_id: req_u32(&item, "subscription id", 0)?,
                    max_interval: req_u16(&item, "max interval", 2)?,
                })
            }
            ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA => Action::ReportData(ReportData {
                subscription_id: item.get_u32(&[0]),
                attribute_reports: array_of(&item, 1)?
                    .iter()
                    .map(AttributeReportIb::from_tlv)
                    .collect::<Result<_, _>>()?,
                event_reports: array_of(&item, 2)?
                    .iter()
                    .map(EventReportIb::from_tlv)
                    .collect::<Result<_, _>>()?,
                more_chunked: opt_bool(&item, 3),
                suppress_response: opt_bool(&item, 4),
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_REQ => Action::WriteRequest(WriteRequest {
                suppress_response: opt_bool(&item, 0),
                timed: opt_bool(&item, 1),
                writes: array_of(&item, 2)?
                    .iter()
                    .map(AttributeDataIb::from_tlv)
                    .collect::<Result<_, _>>()?,
                more_chunked: opt_bool(&item, 3),
                atomic: opt_bool(&item, 4),
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_WRITE_RESP => Action::WriteResponse(WriteResponse {
                statuses: array_of(&item, 0)?
                    .iter()
                    .map(AttributeStatusIb::from_tlv)
                    .collect::<Result<_, _>>()?,
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_REQ => Action::InvokeRequest(InvokeRequest {
                suppress_response: opt_bool(&item, 0),
                timed: opt_bool(&item, 1),
                commands: array_of(&item, 2)?
                    .iter()
                    .map(CommandDataIb::from_tlv)
                    .collect::<Result<_, _>>()?,
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_INVOKE_RESP => Action::InvokeResponse(InvokeResponse {
                suppress_response: opt_bool(&item, 0),
                responses: array_of(&item, 1)?
                    .iter()
                    .map(InvokeResponseIb::from_tlv)
                    .collect::<Result<_, _>>()?,
                more_chunked: opt_bool(&item, 2),
            }),
            ProtocolMessageHeader::INTERACTION_OPCODE_TIMED_REQ => {
                Action::TimedRequest(req_u16(&item, "timeout", 0)?)
            }
            other => return Err(DecodeError::Malformed(format!("unknown interaction opcode 0x{:x}", other))),
        })
    }

    fn to_tlv(&self) -> TlvItem {
        match self {
            Action::StatusResponse(s) => message(vec![uint(0, s.code() as u64)]),
            Action::ReadRequest(r) => {
                let mut f = Vec::new();
                if !r.attribute_paths.is_empty() {
                    f.push(TlvItem::ctx(
                        0,
                        TlvItemValue::Array(r.attribute_paths.iter().map(|p| attribute_path_to_tlv(p, None)).collect()),
                    ));
                }
                if !r.event_paths.is_empty() {
                    f.push(TlvItem::ctx(
                        1,
                        TlvItemValue::Array(r.event_paths.iter().map(|p| event_path_to_tlv(p, None)).collect()),
                    ));
                }
                f.extend(event_filters_to_tlv(r.event_min, 2));
                f.push(boolean(3, r.fabric_filtered));
                message(f)
            }
            Action::SubscribeRequest(r) => {
                let mut f = vec![
                    boolean(0, r.keep_subscriptions),
                    uint(1, r.min_interval_floor as u64),
                    uint(2, r.max_interval_ceiling as u64),
                ];
                if !r.attribute_paths.is_empty() {
                    f.push(TlvItem::ctx(
                        3,
                        TlvItemValue::Array(r.attribute_paths.iter().map(|p| attribute_path_to_tlv(p, None)).collect()),
                    ));
                }
                if !r.event_paths.is_empty() {
                    f.push(TlvItem::ctx(
                        4,
                        TlvItemValue::Array(r.event_paths.iter().map(|p| event_path_to_tlv(p, None)).collect()),
                    ));
                }
                f.extend(event_filters_to_tlv(r.event_min, 5));
                f.push(boolean(7, r.fabric_filtered));
                message(f)
            }
            Action::SubscribeResponse(r) => {
                message(vec![uint(0, r.subscription_id as u64), uint(2, r.max_interval as u64)])
            }
            Action::ReportData(r) => r.to_tlv(),
            Action::WriteRequest(w) => {
                let mut f = vec![
                    boolean(0, w.suppress_response),
                    boolean(1, w.timed),
                    TlvItem::ctx(2, TlvItemValue::Array(w.writes.iter().map(|d| d.to_tlv(None)).collect())),
                    boolean(3, w.more_chunked),
                ];
                if w.atomic {
                    f.push(boolean(4, true));
                }
                message(f)
            }
            Action::WriteResponse(w) => message(vec![TlvItem::ctx(
                0,
                TlvItemValue::Array(w.statuses.iter().map(|s| s.to_tlv(None)).collect()),
            )]),
            Action::InvokeRequest(i) => message(vec![
                boolean(0, i.suppress_response),
                boolean(1, i.timed),
                TlvItem::ctx(2, TlvItemValue::Array(i.commands.iter().map(|c| c.to_tlv(None)).collect())),
            ]),
            Action::InvokeResponse(i) => {
                let mut f = vec![
                    boolean(0, i.suppress_response),
                    TlvItem::ctx(1, TlvItemValue::Array(i.responses.iter().map(|r| r.to_tlv()).collect())),
                ];
                if i.more_chunked {
                    f.push(boolean(2, true));
                }
                message(f)
            }
            Action::TimedRequest(t) => message(vec![uint(0, *t as u64)]),
        }
    }
}

impl ReportData {
    fn to_tlv(&self) -> TlvItem {
        let mut f = Vec::new();
        if let Some(id) = self.subscription_id {
            f.push(uint(0, id as u64));
        }
        if !self.attribute_reports.is_empty() {
            f.push(TlvItem::ctx(
                1,
                TlvItemValue::Array(self.attribute_reports.iter().map(|r| r.to_tlv()).collect()),
            ));
        }
        if !self.event_reports.is_empty() {
            f.push(TlvItem::ctx(
                2,
                TlvItemValue::Array(self.event_reports.iter().map(|r| r.to_tlv()).collect()),
            ));
        }
        if self.more_chunked {
            f.push(boolean(3, true));
        }
        if self.suppress_response {
            f.push(boolean(4, true));
        }
        message(f)
    }
}

/// Protocol header for an interaction model message.
pub fn im_header(exchange_id: u16, opcode: u8, initiator: bool, ack: Option<u32>) -> ProtocolMessageHeader {
    let mut flags = ProtocolMessageHeader::FLAG_RELIABILITY;
    if initiator {
        flags |= ProtocolMessageHeader::FLAG_INITIATOR;
    }
    ProtocolMessageHeader {
        exchange_flags: flags,
        opcode,
        exchange_id,
        vendor_id: None,
        protocol_id: ProtocolMessageHeader::PROTOCOL_ID_INTERACTION,
        ack_counter: ack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ConcreteAttributePath;

    #[test]
    fn decode_read_request_from_wire() {
        // read of endpoint 0, cluster 0x28, attribute 1 as sent by a controller
        let mut ph = im_header(0x6e0d, ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, true, None)
            .encode()
            .unwrap();
        assert_eq!(hex::encode(&ph), "05020d6e0100");
        let payload = hex::decode("153600172402002403282404011818280324ff0a18").unwrap();
        ph.extend_from_slice(&payload);
        let (header, rest) = ProtocolMessageHeader::decode(&ph).unwrap();
        assert!(header.is_initiator());
        assert!(header.needs_ack());
        assert_eq!(header.ack_counter, None);
        match Action::decode(header.opcode, &rest).unwrap() {
            Action::ReadRequest(r) => {
                assert_eq!(r.attribute_paths, vec![AttributePathFilter::concrete(0, 0x28, 1)]);
                assert!(!r.fabric_filtered);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn message_header_with_node_ids() {
        let mh = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0x1234,
            message_counter: 7,
            source_node_id: Some(vec![1, 0, 0, 0, 0, 0, 0, 0]),
            destination_node_id: Some(vec![2, 0, 0, 0, 0, 0, 0, 0]),
        };
        let mut data = mh.encode().unwrap();
        assert_eq!(hex::encode(&data), "053412000700000001000000000000000200000000000000");
        data.extend_from_slice(&ack(3, 99, false).unwrap());
        let m = Message::decode(&data).unwrap();
        assert_eq!(m.message_header.message_counter, 7);
        assert!(m.protocol_header.is_standalone_ack());
        assert_eq!(m.protocol_header.ack_counter, Some(99));
        assert!(!m.protocol_header.is_initiator());
        assert!(m.payload.is_empty());
    }

    #[test]
    fn secured_extensions_and_vendor_skipped() {
        // flags I|SX|V, opcode 5, exchange 1, vendor 0xfff1, protocol 1, 2 bytes of extensions
        let data = hex::decode("19050100f1ff01000200aabb1518").unwrap();
        let (h, rest) = ProtocolMessageHeader::decode(&data).unwrap();
        assert_eq!(h.vendor_id, Some(0xfff1));
        assert_eq!(h.protocol_id, 1);
        assert_eq!(rest, vec![0x15, 0x18]);
    }

    #[test]
    fn report_data_reports() {
        let report = ReportData {
            subscription_id: Some(5),
            attribute_reports: vec![
                AttributeReportIb::Data(AttributeDataIb {
                    data_version: Some(3),
                    path: ConcreteAttributePath::new(1, 6, 0).into(),
                    data: TlvItemValue::Bool(true),
                }),
                AttributeReportIb::Status(AttributeStatusIb {
                    path: AttributePathFilter::concrete(1, 6, 0x99),
                    status: StatusCode::UnsupportedAttribute,
                    cluster_status: None,
                }),
            ],
            event_reports: vec![EventReportIb::Data(EventDataIb {
                path: EventPathFilter::concrete(2, 0x3b, 1),
                number: 42,
                priority: 1,
                epoch_timestamp: 1_700_000_000_000,
                data: TlvItemValue::Struct(vec![TlvItem::ctx(0, TlvItemValue::Int(1))]),
            })],
            more_chunked: true,
            suppress_response: false,
        };
        let action = Action::ReportData(report.clone());
        let bytes = action.encode().unwrap();
        assert!(bytes.len() > ReportData::envelope_len(true));
        assert_eq!(Action::decode(action.opcode(), &bytes).unwrap(), action);
    }

    #[test]
    fn malformed_payloads() {
        assert!(matches!(
            Action::decode(ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, &[0x15, 0x36]),
            Err(DecodeError::Truncated)
        ));
        assert!(matches!(
            Action::decode(0x55, &hex::decode("1518").unwrap()),
            Err(DecodeError::Malformed(_))
        ));
        // subscribe without interval bounds
        assert!(matches!(
            Action::decode(ProtocolMessageHeader::INTERACTION_OPCODE_SUBSCRIBE_REQ, &hex::decode("1518").unwrap()),
            Err(DecodeError::MissingField(_))
        ));
    }
}
