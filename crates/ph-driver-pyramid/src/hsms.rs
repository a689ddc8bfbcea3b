//! HSMS framing over TCP.
//!
//! A message is a four byte big-endian length, a ten byte header and an
//! optional SECS-II body. The length covers header and body.

use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::secs::{Item, SecsError};

const HEADER_LEN: usize = 10;

/// Largest message accepted from the handler.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Session id used by control messages.
pub const CONTROL_SESSION: u16 = 0xFFFF;

#[derive(Debug, Error)]
pub enum HsmsError {
    #[error("connection closed by handler")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message length {0} out of range")]
    BadLength(usize),

    #[error("bad message body: {0}")]
    Body(#[from] SecsError),
}

/// Session type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SType {
    Data,
    SelectReq,
    SelectRsp,
    DeselectReq,
    DeselectRsp,
    LinktestReq,
    LinktestRsp,
    RejectReq,
    SeparateReq,
    Other(u8),
}

impl SType {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => SType::Data,
            1 => SType::SelectReq,
            2 => SType::SelectRsp,
            3 => SType::DeselectReq,
            4 => SType::DeselectRsp,
            5 => SType::LinktestReq,
            6 => SType::LinktestRsp,
            7 => SType::RejectReq,
            9 => SType::SeparateReq,
            other => SType::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            SType::Data => 0,
            SType::SelectReq => 1,
            SType::SelectRsp => 2,
            SType::DeselectReq => 3,
            SType::DeselectRsp => 4,
            SType::LinktestReq => 5,
            SType::LinktestRsp => 6,
            SType::RejectReq => 7,
            SType::SeparateReq => 9,
            SType::Other(other) => other,
        }
    }
}

/// One HSMS message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub session: u16,
    pub stream: u8,
    pub function: u8,
    /// Reply expected.
    pub wbit: bool,
    pub stype: SType,
    pub system: u32,
    pub body: Option<Item>,
}

impl Message {
    /// Data message `SxFy`.
    pub fn data(stream: u8, function: u8, wbit: bool, system: u32, body: Option<Item>) -> Self {
        Self {
            session: 0,
            stream,
            function,
            wbit,
            stype: SType::Data,
            system,
            body,
        }
    }

    /// Control message without body. Select.rsp carries its status in the
    /// function byte.
    pub fn control(stype: SType, system: u32, status: u8) -> Self {
        Self {
            session: CONTROL_SESSION,
            stream: 0,
            function: status,
            wbit: false,
            stype,
            system,
            body: None,
        }
    }

    pub fn is_data(&self, stream: u8, function: u8) -> bool {
        self.stype == SType::Data && self.stream == stream && self.function == function
    }

    /// `S6F11` style label for logging.
    pub fn label(&self) -> String {
        match self.stype {
            SType::Data => format!("S{}F{}", self.stream, self.function),
            other => format!("{:?}", other),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, HsmsError> {
        let mut body = BytesMut::new();
        if let Some(item) = &self.body {
            item.encode(&mut body)?;
        }
        if HEADER_LEN + body.len() > MAX_MESSAGE_LEN {
            return Err(HsmsError::BadLength(HEADER_LEN + body.len()));
        }
        let mut buf = BytesMut::with_capacity(4 + HEADER_LEN + body.len());
        buf.put_u32((HEADER_LEN + body.len()) as u32);
        buf.put_u16(self.session);
        let wbit: u8 = if self.wbit { 0x80 } else { 0 };
        buf.put_u8(wbit | (self.stream & 0x7F));
        buf.put_u8(self.function);
        buf.put_u8(0);
        buf.put_u8(self.stype.to_byte());
        buf.put_u32(self.system);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decode header and body, without the length prefix.
    pub fn decode(mut frame: &[u8]) -> Result<Self, HsmsError> {
        if frame.len() < HEADER_LEN {
            return Err(HsmsError::BadLength(frame.len()));
        }
        let session = frame.get_u16();
        let byte2 = frame.get_u8();
        let function = frame.get_u8();
        let _ptype = frame.get_u8();
        let stype = SType::from_byte(frame.get_u8());
        let system = frame.get_u32();
        let body = if frame.is_empty() {
            None
        } else {
            Some(Item::from_bytes(frame)?)
        };
        Ok(Self {
            session,
            stream: byte2 & 0x7F,
            function,
            wbit: byte2 & 0x80 != 0,
            stype,
            system,
            body,
        })
    }
}

/// Read one message.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, HsmsError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(HsmsError::Closed),
        Err(e) => return Err(e.into()),
    };
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(HsmsError::BadLength(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HsmsError::Closed
        } else {
            e.into()
        }
    })?;
    Message::decode(&frame)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), HsmsError> {
    writer.write_all(&message.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Source of system bytes for primary messages.
#[derive(Debug)]
pub struct SystemBytes(AtomicU32);

impl SystemBytes {
    const WRAP: u32 = 0x7F7F_7F7F;

    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Next id, starting over at 1 after `0x7F7F7F7F`.
    pub fn next(&self) -> u32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let following = if current >= Self::WRAP { 1 } else { current + 1 };
            match self.0.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SystemBytes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_request_layout() {
        let bytes = Message::control(SType::SelectReq, 7, 0).encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 10, 0xFF, 0xFF, 0, 0, 0, 1, 0, 0, 0, 7]
        );
    }

    #[test]
    fn data_message_layout() {
        let msg = Message::data(1, 3, true, 2, Some(Item::list([Item::u4(810)])));
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 18]);
        assert_eq!(&bytes[4..14], &[0, 0, 0x81, 3, 0, 0, 0, 0, 0, 2]);
        assert_eq!(Message::decode(&bytes[4..]).unwrap(), msg);
    }

    #[tokio::test]
    async fn reads_what_was_written() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let msg = Message::data(6, 11, true, 42, Some(Item::ascii("x")));
        write_message(&mut a, &msg).await.unwrap();
        write_message(&mut a, &Message::control(SType::LinktestReq, 43, 0))
            .await
            .unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), msg);
        let linktest = read_message(&mut b).await.unwrap();
        assert_eq!(linktest.stype, SType::LinktestReq);
        assert_eq!(linktest.body, None);

        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(HsmsError::Closed)));
    }

    #[tokio::test]
    async fn rejects_short_frames() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(HsmsError::BadLength(3))
        ));
    }

    #[test]
    fn deeply_nested_body_is_an_error() {
        let mut frame = vec![0, 0, 0, 6, 11, 0, 0, 0, 0, 9];
        for _ in 0..200_000 {
            frame.extend_from_slice(&[0x01, 0x01]);
        }
        frame.extend_from_slice(&[0x01, 0x00]);
        assert!(matches!(
            Message::decode(&frame),
            Err(HsmsError::Body(SecsError::TooDeep))
        ));
    }

    #[test]
    fn system_bytes_wrap() {
        let ids = SystemBytes::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        ids.0.store(0x7F7F_7F7F, Ordering::Relaxed);
        assert_eq!(ids.next(), 0x7F7F_7F7F);
        assert_eq!(ids.next(), 1);
    }
}
