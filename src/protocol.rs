//! Wire protocol message encoding and decoding.
//!
//! Every message travels in an envelope:
//!
//! ```text
//! +---------+------+------------------+-----------+
//! | version | kind | payload length   | payload   |
//! +---------+------+------------------+-----------+
//!   1 byte   1 byte  8 bytes, LE u64    length bytes
//! ```
//!
//! Control messages are JSON objects (kind 1), row data is raw binary (kind 2).

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{DriverError, DriverResult, ValueError};
use crate::types::{Column, ColumnType};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Protocol version spoken by this driver.
pub const PROTOCOL_VERSION: u8 = 8;

/// Size of the envelope header: version + kind + u64 length.
pub const HEADER_SIZE: usize = 10;

/// Largest payload accepted in either direction (1 GiB, exclusive).
pub const MAX_PAYLOAD_SIZE: usize = 1 << 30;

/// Payload kind carried in the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Json = 1,
    Binary = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = DriverError;

    fn try_from(b: u8) -> DriverResult<Self> {
        match b {
            1 => Ok(MessageKind::Json),
            2 => Ok(MessageKind::Binary),
            other => Err(DriverError::protocol(format!(
                "unknown message kind: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub length: u64,
}

impl Header {
    pub fn new(kind: MessageKind, length: usize) -> DriverResult<Self> {
        check_payload_size(length)?;
        Ok(Self {
            kind,
            length: length as u64,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.length);
    }

    /// Decode a received header, rejecting foreign protocol versions.
    pub fn decode(mut raw: &[u8]) -> DriverResult<Self> {
        if raw.remaining() < HEADER_SIZE {
            return Err(DriverError::protocol("incomplete message header"));
        }

        let version = raw.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DriverError::protocol(format!(
                "protocol version mismatch: server speaks {}, driver speaks {}",
                version, PROTOCOL_VERSION
            )));
        }

        let kind = MessageKind::try_from(raw.get_u8())?;
        let length = raw.get_u64_le();
        if length >= MAX_PAYLOAD_SIZE as u64 {
            return Err(DriverError::protocol(format!(
                "message of {} bytes exceeds the payload limit",
                length
            )));
        }

        Ok(Self { kind, length })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// Fail before anything is written when a payload cannot be framed.
pub fn check_payload_size(len: usize) -> DriverResult<()> {
    if len >= MAX_PAYLOAD_SIZE {
        return Err(ValueError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        }
        .into());
    }
    Ok(())
}

/// Frame a payload into a single contiguous buffer.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> DriverResult<BytesMut> {
    let header = Header::new(kind, payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf)
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A JSON control message.
pub trait FrontendMessage: Serialize {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn to_json(&self) -> DriverResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn encode(&self) -> DriverResult<BytesMut> {
        encode_frame(MessageKind::Json, &self.to_json()?)
    }
}

/// Argument-less commands, encoded as `{"<name>":"<name>"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CloseConnection,
    CloseStatement,
    GetStatementId,
    QueryTypeOut,
    QueryTypeIn,
    Execute,
    Fetch,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::CloseConnection => "closeConnection",
            Command::CloseStatement => "closeStatement",
            Command::GetStatementId => "getStatementId",
            Command::QueryTypeOut => "queryTypeOut",
            Command::QueryTypeIn => "queryTypeIn",
            Command::Execute => "execute",
            Command::Fetch => "fetch",
        }
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.as_str(), self.as_str())?;
        map.end()
    }
}

impl FrontendMessage for Command {
    fn name(&self) -> &'static str {
        self.as_str()
    }
}

/// Opens a session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectDatabase<'a> {
    pub service: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    #[serde(rename = "connectDatabase")]
    pub database: &'a str,
}

impl FrontendMessage for ConnectDatabase<'_> {
    fn name(&self) -> &'static str {
        "connectDatabase"
    }
}

/// Re-attaches an existing connection id to the instance a load balancer chose.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectDatabase<'a> {
    #[serde(rename = "reconnectDatabase")]
    pub database: &'a str,
    pub service: &'a str,
    #[serde(rename = "connectionId")]
    pub connection_id: u32,
    pub username: &'a str,
    pub password: &'a str,
    #[serde(rename = "listenerId")]
    pub listener_id: u32,
}

impl FrontendMessage for ReconnectDatabase<'_> {
    fn name(&self) -> &'static str {
        "reconnectDatabase"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareStatement<'a> {
    #[serde(rename = "prepareStatement")]
    pub sql: &'a str,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u32,
}

impl FrontendMessage for PrepareStatement<'_> {
    fn name(&self) -> &'static str {
        "prepareStatement"
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReconstructStatement {
    #[serde(rename = "reconstructStatement")]
    pub statement_id: u32,
}

impl FrontendMessage for ReconstructStatement {
    fn name(&self) -> &'static str {
        "reconstructStatement"
    }
}

/// Announces a binary frame holding `put` rows.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Put {
    pub put: usize,
}

impl FrontendMessage for Put {
    fn name(&self) -> &'static str {
        "put"
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// A parsed JSON reply.
#[derive(Debug, Clone)]
pub struct Reply {
    fields: Map<String, Value>,
}

/// Where a load balancer wants the statement to continue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Redirect {
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub port_ssl: Option<u16>,
    pub listener_id: u32,
}

impl Redirect {
    pub fn port_for(&self, ssl: bool) -> DriverResult<u16> {
        let port = if ssl { self.port_ssl } else { self.port };
        port.ok_or_else(|| DriverError::protocol("could not parse reconnection message"))
    }
}

/// Outcome of a prepare round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Done(bool),
    Redirect(Redirect),
}

/// One fetched chunk announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub rows: usize,
    pub block_sizes: Vec<u64>,
}

impl ChunkHeader {
    pub fn payload_len(&self) -> u64 {
        self.block_sizes.iter().sum()
    }
}

#[derive(Debug, Deserialize)]
struct ColumnReply {
    #[serde(rename = "isTrueVarChar")]
    is_true_varchar: bool,
    nullable: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    type_info: (String, u32, u32),
}

impl Reply {
    pub fn parse(payload: &[u8]) -> DriverResult<Self> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DriverError::protocol(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn server_error(&self) -> Option<String> {
        self.fields.get("error").map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Look up the field a reply must carry, surfacing `error` otherwise.
    pub fn field(&self, name: &str) -> DriverResult<&Value> {
        if let Some(value) = self.fields.get(name) {
            return Ok(value);
        }
        Err(self.missing(name))
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> DriverResult<T> {
        let value = self.field(name)?;
        serde_json::from_value(value.clone()).map_err(|e| {
            DriverError::protocol(format!("invalid value for {:?}: {}", name, e))
        })
    }

    pub fn get_opt<T: DeserializeOwned>(&self, name: &str) -> DriverResult<Option<T>> {
        match self.fields.get(name) {
            Some(_) => self.get(name).map(Some),
            None => Ok(None),
        }
    }

    /// Check an acknowledgement of the form `{"<name>":"<name>"}` or `{"<name>":true}`.
    pub fn acknowledge(&self, name: &str) -> DriverResult<()> {
        match self.field(name)? {
            Value::String(s) if s == name => Ok(()),
            Value::Bool(true) => Ok(()),
            other => Err(DriverError::protocol(format!(
                "unexpected acknowledgement {}: {}",
                name, other
            ))),
        }
    }

    pub fn prepared(&self) -> DriverResult<Prepared> {
        if matches!(self.fields.get("reconnect"), Some(Value::Bool(true))) {
            let redirect = serde_json::from_value::<Redirect>(Value::Object(self.fields.clone()))
                .map_err(|_| DriverError::protocol("could not parse reconnection message"))?;
            if redirect.port.is_none() && redirect.port_ssl.is_none() {
                return Err(DriverError::protocol("could not parse reconnection message"));
            }
            return Ok(Prepared::Redirect(redirect));
        }
        self.get::<bool>("statementPrepared").map(Prepared::Done)
    }

    /// Column descriptors for `queryTypeNamed` (output, named) or `queryType` (input).
    ///
    /// An absent or empty array yields no columns.
    pub fn columns(&self, field: &str, named: bool) -> DriverResult<Vec<Column>> {
        let array = match self.fields.get(field) {
            Some(Value::Array(items)) => items,
            _ => {
                if let Some(err) = self.server_error() {
                    return Err(DriverError::Server(err));
                }
                return Ok(Vec::new());
            }
        };

        let direction = if named { "out" } else { "in" };
        let mut columns = Vec::with_capacity(array.len());
        for item in array {
            let reply: ColumnReply = serde_json::from_value(item.clone()).map_err(|_| {
                DriverError::protocol(format!("could not parse metadata {}", direction))
            })?;
            let name = match (named, reply.name) {
                (true, Some(name)) => name,
                (true, None) => {
                    return Err(DriverError::protocol(format!(
                        "could not parse metadata {}",
                        direction
                    )))
                }
                (false, name) => name.unwrap_or_default(),
            };
            let (tag, size, scale) = reply.type_info;
            columns.push(Column {
                name,
                nullable: reply.nullable,
                is_true_varchar: reply.is_true_varchar,
                column_type: ColumnType::from_tag(&tag),
                size,
                scale,
            });
        }
        Ok(columns)
    }

    /// Parse a fetch reply; `None` signals the end of the result.
    pub fn chunk(&self) -> DriverResult<Option<ChunkHeader>> {
        if !(self.contains("colSzs") && self.contains("rows")) {
            return Err(self.missing("colSzs"));
        }

        let block_sizes = match self.fields.get("colSzs") {
            Some(Value::Array(items)) if !items.is_empty() => self.get::<Vec<u64>>("colSzs")?,
            _ => return Ok(None),
        };
        let rows = self.get::<usize>("rows")?;
        Ok(Some(ChunkHeader { rows, block_sizes }))
    }

    fn missing(&self, name: &str) -> DriverError {
        match self.server_error() {
            Some(err) => DriverError::Server(err),
            None => DriverError::protocol(format!(
                "an unknown error occurred: reply has no {:?} field",
                name
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_header_structure() {
        let frame = encode_frame(MessageKind::Json, br#"{"fetch":"fetch"}"#).unwrap();

        assert_eq!(frame[0], PROTOCOL_VERSION);
        assert_eq!(frame[1], MessageKind::Json as u8);
        let len = u64::from_le_bytes(frame[2..10].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_header_version_mismatch() {
        let raw = [7u8, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = Header::decode(&raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_command_encoding() {
        let json = Command::Fetch.to_json().unwrap();
        assert_eq!(json, br#"{"fetch":"fetch"}"#);
    }

    #[test]
    fn test_reply_error_field() {
        let reply = Reply::parse(br#"{"error":"table not found"}"#).unwrap();
        match reply.acknowledge("executed") {
            Err(DriverError::Server(msg)) => assert_eq!(msg, "table not found"),
            other => panic!("expected server error, got {:?}", other),
        }
    }
}
