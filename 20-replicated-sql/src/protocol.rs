//! Postgres v3 wire protocol, the subset a simple-query client needs.
//!
//! [`PgCodec`] is a `tokio_util` codec: it decodes [`FrontendMessage`]s and
//! encodes [`BackendMessage`]s. Before startup completes, frames carry no type
//! byte (just a length and a request code); afterwards every frame is
//! `tag, length, body`.

use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION_3: u32 = 196_608;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

const MAX_STARTUP_LEN: usize = 10_000;
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

pub const TEXT_OID: u32 = 25;

/// Wire type OID for a declared column type. Anything outside the table is
/// described as `text`, which every client can display.
pub fn type_oid(type_name: &str) -> u32 {
    match type_name {
        "text" => TEXT_OID,
        "pg_catalog.int4" => 23,
        "pg_catalog.int8" => 20,
        "pg_catalog.int2" => 21,
        "pg_catalog.varchar" => 1043,
        "pg_catalog.bool" => 16,
        _ => TEXT_OID,
    }
}

/// `typlen` reported alongside an OID; -1 means variable length.
fn type_len(oid: u32) -> i16 {
    match oid {
        16 => 1,
        21 => 2,
        23 => 4,
        20 => 8,
        _ => -1,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest,
    Startup { params: BTreeMap<String, String> },
    Query(String),
    Terminate,
    /// Any other message, identified by its type byte.
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Single `N` byte declining SSL or GSS encryption.
    EncryptionDenied,
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    ReadyForQuery,
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<String>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse { code: String, message: String },
}

#[derive(Debug, Default)]
pub struct PgCodec {
    started: bool,
}

impl PgCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(8..=MAX_STARTUP_LEN).contains(&len) {
            return Err(invalid(format!("bad startup packet length {len}")));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len);
        frame.advance(4);
        let message = match frame.get_u32() {
            SSL_REQUEST_CODE => FrontendMessage::SslRequest,
            GSSENC_REQUEST_CODE => FrontendMessage::GssEncRequest,
            CANCEL_REQUEST_CODE => FrontendMessage::CancelRequest,
            PROTOCOL_VERSION_3 => {
                let mut params = BTreeMap::new();
                loop {
                    let name = read_cstring(&mut frame)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut frame)?;
                    params.insert(name, value);
                }
                self.started = true;
                FrontendMessage::Startup { params }
            }
            other => return Err(invalid(format!("unsupported protocol version {other}"))),
        };
        Ok(Some(message))
    }
}

impl Decoder for PgCodec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
        if !self.started {
            return self.decode_startup(src);
        }
        if src.len() < 5 {
            return Ok(None);
        }
        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(invalid(format!("bad message length {len}")));
        }
        if src.len() < 1 + len {
            src.reserve(1 + len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(1 + len);
        frame.advance(5);
        let message = match tag {
            b'Q' => FrontendMessage::Query(read_cstring(&mut frame)?),
            b'X' => FrontendMessage::Terminate,
            other => FrontendMessage::Other(other),
        };
        Ok(Some(message))
    }
}

impl Encoder<BackendMessage> for PgCodec {
    type Error = io::Error;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> io::Result<()> {
        match item {
            BackendMessage::EncryptionDenied => dst.put_u8(b'N'),
            BackendMessage::AuthenticationOk => write_frame(dst, b'R', |body| body.put_i32(0)),
            BackendMessage::ParameterStatus { name, value } => write_frame(dst, b'S', |body| {
                put_cstring(body, &name);
                put_cstring(body, &value);
            }),
            BackendMessage::ReadyForQuery => write_frame(dst, b'Z', |body| body.put_u8(b'I')),
            BackendMessage::RowDescription(fields) => write_frame(dst, b'T', |body| {
                body.put_i16(fields.len() as i16);
                for field in &fields {
                    put_cstring(body, &field.name);
                    body.put_i32(0); // table oid
                    body.put_i16(0); // attribute number
                    body.put_u32(field.type_oid);
                    body.put_i16(type_len(field.type_oid));
                    body.put_i32(-1); // type modifier
                    body.put_i16(0); // text format
                }
            }),
            BackendMessage::DataRow(values) => write_frame(dst, b'D', |body| {
                body.put_i16(values.len() as i16);
                for value in &values {
                    match value {
                        Some(text) => {
                            body.put_i32(text.len() as i32);
                            body.put_slice(text.as_bytes());
                        }
                        None => body.put_i32(-1),
                    }
                }
            }),
            BackendMessage::CommandComplete(tag) => {
                write_frame(dst, b'C', |body| put_cstring(body, &tag))
            }
            BackendMessage::EmptyQueryResponse => write_frame(dst, b'I', |_| {}),
            BackendMessage::ErrorResponse { code, message } => write_frame(dst, b'E', |body| {
                body.put_u8(b'S');
                put_cstring(body, "ERROR");
                body.put_u8(b'V');
                put_cstring(body, "ERROR");
                body.put_u8(b'C');
                put_cstring(body, &code);
                body.put_u8(b'M');
                put_cstring(body, &message);
                body.put_u8(0);
            }),
        }
        Ok(())
    }
}

/// Writes `tag`, a length placeholder, the body, then patches the length.
fn write_frame(dst: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(tag);
    let len_at = dst.len();
    dst.put_u32(0);
    body(dst);
    let len = (dst.len() - len_at) as u32;
    dst[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

fn read_cstring(src: &mut BytesMut) -> io::Result<String> {
    let Some(end) = src.iter().position(|b| *b == 0) else {
        return Err(invalid("missing string terminator".to_string()));
    };
    let raw = src.split_to(end);
    src.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|err| invalid(err.to_string()))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
