//! Typed message framing shared by every gtstore role.
//!
//! Each message on the wire is an 8 byte header followed by the raw payload:
//! `type: u16` (network order), `reserved: u16`, `payload_len: u32` (network
//! order). Payloads are small text grammars described next to the handlers
//! that parse them.
use std::mem::size_of;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::ring::NodeAddress;

/// Kind of arbitrary but let's make sure a single connection can't consume
/// more than 1Mb of memory per message.
const MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Message type ids. The exact numbers matter for interop - `REPL_ACK` and
/// `REPL_CONFIRM` are reserved but never sent in the current design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    ClientPut = 1,
    ClientGet = 2,
    PutOk = 3,
    GetOk = 4,
    Error = 5,
    ReplPut = 6,
    ReplAck = 7,
    Heartbeat = 8,
    HeartbeatAck = 9,
    TablePush = 10,
    StorageRegister = 11,
    ClientHello = 12,
    ReplConfirm = 13,
    GetAllKeys = 14,
    AllKeys = 15,
    ClientDelete = 16,
    DeleteOk = 17,
    PauseNode = 18,
    ResumeNode = 19,
    PauseAck = 20,
    ResumeAck = 21,
    AvailabilityCheck = 22,
    AvailableStatus = 23,
    ManagerGet = 24,
    ManagerDelete = 25,
}

impl MessageKind {
    pub fn from_u16(id: u16) -> Result<Self> {
        let kind = match id {
            1 => MessageKind::ClientPut,
            2 => MessageKind::ClientGet,
            3 => MessageKind::PutOk,
            4 => MessageKind::GetOk,
            5 => MessageKind::Error,
            6 => MessageKind::ReplPut,
            7 => MessageKind::ReplAck,
            8 => MessageKind::Heartbeat,
            9 => MessageKind::HeartbeatAck,
            10 => MessageKind::TablePush,
            11 => MessageKind::StorageRegister,
            12 => MessageKind::ClientHello,
            13 => MessageKind::ReplConfirm,
            14 => MessageKind::GetAllKeys,
            15 => MessageKind::AllKeys,
            16 => MessageKind::ClientDelete,
            17 => MessageKind::DeleteOk,
            18 => MessageKind::PauseNode,
            19 => MessageKind::ResumeNode,
            20 => MessageKind::PauseAck,
            21 => MessageKind::ResumeAck,
            22 => MessageKind::AvailabilityCheck,
            23 => MessageKind::AvailableStatus,
            24 => MessageKind::ManagerGet,
            25 => MessageKind::ManagerDelete,
            id => return Err(Error::UnknownType { id }),
        };

        Ok(kind)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A single framed protocol message.
#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Reads one message from the given reader. An unrecognized type id still
    /// drains its payload before returning [`Error::UnknownType`], so the
    /// caller may answer on the same connection.
    pub async fn try_from_async_read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let type_id = reader.read_u16().await?;
        let _reserved = reader.read_u16().await?;
        let length = reader.read_u32().await?;

        if length > MAX_PAYLOAD_SIZE {
            return Err(Error::Transport {
                reason: format!(
                    "payload length {} exceeds the {} byte cap",
                    length, MAX_PAYLOAD_SIZE
                ),
            });
        }

        let payload = if length > 0 {
            let mut buf = vec![0u8; length as usize];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        let kind = MessageKind::from_u16(type_id)?;
        Ok(Self { kind, payload })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 2 * size_of::<u32>());

        buf.put_u16(self.kind.as_u16());
        buf.put_u16(0);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());

        buf.freeze()
    }

    /// Utf8 view over the payload.
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|err| Error::BadFormat {
            reason: format!("payload is not valid utf8: {}", err),
        })
    }
}

pub async fn connect(addr: &NodeAddress) -> Result<TcpStream> {
    Ok(TcpStream::connect((addr.host.as_str(), addr.port)).await?)
}

pub async fn send_message(stream: &mut TcpStream, kind: MessageKind, payload: &str) -> Result<()> {
    let message = Message::new(kind, Bytes::copy_from_slice(payload.as_bytes()));
    stream.write_all(&message.serialize()).await?;
    Ok(())
}

pub async fn recv_message(stream: &mut TcpStream) -> Result<Message> {
    Message::try_from_async_read(stream).await
}

/// Opens a fresh connection, sends one request and reads one reply. Every
/// manager-to-storage exchange and every client attempt uses this shape.
pub async fn round_trip(addr: &NodeAddress, kind: MessageKind, payload: &str) -> Result<Message> {
    let mut stream = connect(addr).await?;
    send_message(&mut stream, kind, payload).await?;
    recv_message(&mut stream).await
}

/// Unwraps a reply of the expected kind, mapping `ERROR` replies and kind
/// mismatches to [`Error::Transport`] so callers can treat them uniformly as
/// a failed attempt.
pub fn expect_kind(message: Message, want: MessageKind) -> Result<Bytes> {
    if message.kind == want {
        return Ok(message.payload);
    }

    if message.kind == MessageKind::Error {
        return Err(Error::Transport {
            reason: format!(
                "peer answered error: {}",
                String::from_utf8_lossy(&message.payload)
            ),
        });
    }

    Err(Error::Transport {
        reason: format!("expected {:?}, got {:?}", want, message.kind),
    })
}
