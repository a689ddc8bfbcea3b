//! SECS-II data items.
//!
//! Every item starts with a format byte: the upper six bits name the type,
//! the lower two bits give the number of length bytes (1 to 3) that follow.
//! The length counts elements for lists and bytes for everything else.
//!
//! ```text
//! 0x41 0x05 'S' 'T' 'A' 'R' 'T'     ASCII "START"
//! 0xB1 0x04 0x00 0x00 0x20 0x6C     U4 8300
//! 0x01 0x02 <item> <item>           list of two items
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Longest length that fits into three length bytes.
const MAX_LENGTH: usize = 0xFF_FFFF;

/// Deepest list nesting accepted from the handler.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecsError {
    #[error("item data ends after {0} bytes")]
    Truncated(usize),

    #[error("unknown item format byte 0x{0:02X}")]
    UnknownFormat(u8),

    #[error("item of format 0x{format:02X} has length {len}, not a multiple of {width}")]
    BadLength { format: u8, len: usize, width: usize },

    #[error("{0} trailing bytes after the item")]
    Trailing(usize),

    #[error("lists nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("item length {0} does not fit into three length bytes")]
    TooLong(usize),
}

/// One SECS-II item.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    List(Vec<Item>),
    Binary(Vec<u8>),
    Boolean(Vec<bool>),
    Ascii(String),
    I1(Vec<i8>),
    I2(Vec<i16>),
    I4(Vec<i32>),
    I8(Vec<i64>),
    U1(Vec<u8>),
    U2(Vec<u16>),
    U4(Vec<u32>),
    U8(Vec<u64>),
    F4(Vec<f32>),
    F8(Vec<f64>),
}

mod format {
    pub const LIST: u8 = 0x00;
    pub const BINARY: u8 = 0x20;
    pub const BOOLEAN: u8 = 0x24;
    pub const ASCII: u8 = 0x40;
    pub const I8: u8 = 0x60;
    pub const I1: u8 = 0x64;
    pub const I2: u8 = 0x68;
    pub const I4: u8 = 0x70;
    pub const F8: u8 = 0x80;
    pub const F4: u8 = 0x90;
    pub const U8: u8 = 0xA0;
    pub const U1: u8 = 0xA4;
    pub const U2: u8 = 0xA8;
    pub const U4: u8 = 0xB0;
}

impl Item {
    pub fn list(items: impl IntoIterator<Item = Item>) -> Self {
        Item::List(items.into_iter().collect())
    }

    pub fn ascii(text: impl Into<String>) -> Self {
        Item::Ascii(text.into())
    }

    pub fn u4(value: u32) -> Self {
        Item::U4(vec![value])
    }

    pub fn u1(value: u8) -> Self {
        Item::U1(vec![value])
    }

    pub fn binary(value: u8) -> Self {
        Item::Binary(vec![value])
    }

    pub fn boolean(value: bool) -> Self {
        Item::Boolean(vec![value])
    }

    /// Elements of a list, `None` for any other item.
    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }

    /// Element `index` of a list.
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.as_list().and_then(|items| items.get(index))
    }

    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            Item::Ascii(text) => Some(text),
            _ => None,
        }
    }

    /// Numeric elements widened to `i64`. Booleans count as 0 and 1;
    /// floats are truncated. Lists and ASCII have none.
    pub fn integers(&self) -> Vec<i64> {
        match self {
            Item::List(_) | Item::Ascii(_) => Vec::new(),
            Item::Binary(v) | Item::U1(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::Boolean(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::I1(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::I2(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::I4(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::I8(v) => v.clone(),
            Item::U2(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::U4(v) => v.iter().map(|&x| i64::from(x)).collect(),
            Item::U8(v) => v.iter().map(|&x| x as i64).collect(),
            Item::F4(v) => v.iter().map(|&x| x as i64).collect(),
            Item::F8(v) => v.iter().map(|&x| x as i64).collect(),
        }
    }

    /// First numeric element.
    pub fn as_i64(&self) -> Option<i64> {
        self.integers().first().copied()
    }

    fn format_and_length(&self) -> (u8, usize) {
        match self {
            Item::List(v) => (format::LIST, v.len()),
            Item::Binary(v) => (format::BINARY, v.len()),
            Item::Boolean(v) => (format::BOOLEAN, v.len()),
            Item::Ascii(s) => (format::ASCII, s.len()),
            Item::I1(v) => (format::I1, v.len()),
            Item::I2(v) => (format::I2, v.len() * 2),
            Item::I4(v) => (format::I4, v.len() * 4),
            Item::I8(v) => (format::I8, v.len() * 8),
            Item::U1(v) => (format::U1, v.len()),
            Item::U2(v) => (format::U2, v.len() * 2),
            Item::U4(v) => (format::U4, v.len() * 4),
            Item::U8(v) => (format::U8, v.len() * 8),
            Item::F4(v) => (format::F4, v.len() * 4),
            Item::F8(v) => (format::F8, v.len() * 8),
        }
    }

    /// Append the encoded item to `buf`. On error `buf` may hold part of
    /// the item and should be dropped.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), SecsError> {
        let (format, len) = self.format_and_length();
        if len > MAX_LENGTH {
            return Err(SecsError::TooLong(len));
        }
        let width: u8 = match len {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            _ => 3,
        };
        buf.put_u8(format | width);
        let be = (len as u32).to_be_bytes();
        buf.put_slice(&be[4 - usize::from(width)..]);

        match self {
            Item::List(items) => {
                for item in items {
                    item.encode(buf)?;
                }
            }
            Item::Binary(v) | Item::U1(v) => buf.put_slice(v),
            Item::Boolean(v) => v.iter().for_each(|&b| buf.put_u8(u8::from(b))),
            Item::Ascii(s) => buf.put_slice(s.as_bytes()),
            Item::I1(v) => v.iter().for_each(|&x| buf.put_i8(x)),
            Item::I2(v) => v.iter().for_each(|&x| buf.put_i16(x)),
            Item::I4(v) => v.iter().for_each(|&x| buf.put_i32(x)),
            Item::I8(v) => v.iter().for_each(|&x| buf.put_i64(x)),
            Item::U2(v) => v.iter().for_each(|&x| buf.put_u16(x)),
            Item::U4(v) => v.iter().for_each(|&x| buf.put_u32(x)),
            Item::U8(v) => v.iter().for_each(|&x| buf.put_u64(x)),
            Item::F4(v) => v.iter().for_each(|&x| buf.put_f32(x)),
            Item::F8(v) => v.iter().for_each(|&x| buf.put_f64(x)),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut, SecsError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a complete message body holding exactly one item.
    pub fn from_bytes(mut data: &[u8]) -> Result<Self, SecsError> {
        let total = data.len();
        let item = Self::decode(&mut data, total, 0)?;
        if data.has_remaining() {
            return Err(SecsError::Trailing(data.remaining()));
        }
        Ok(item)
    }

    /// Decode one item from the front of `buf`. `total` is the size of the
    /// whole body, for error reporting; `depth` counts enclosing lists.
    fn decode(buf: &mut &[u8], total: usize, depth: usize) -> Result<Self, SecsError> {
        let truncated = |remaining: usize| SecsError::Truncated(total - remaining);
        if !buf.has_remaining() {
            return Err(truncated(buf.remaining()));
        }
        let head = buf.get_u8();
        let width = usize::from(head & 0x03);
        let format = head & 0xFC;
        if width == 0 || buf.remaining() < width {
            return Err(truncated(buf.remaining()));
        }
        let mut len = 0usize;
        for _ in 0..width {
            len = (len << 8) | usize::from(buf.get_u8());
        }

        if format == format::LIST {
            if depth >= MAX_DEPTH {
                return Err(SecsError::TooDeep);
            }
            let mut items = Vec::with_capacity(len.min(256));
            for _ in 0..len {
                items.push(Self::decode(buf, total, depth + 1)?);
            }
            return Ok(Item::List(items));
        }

        if buf.remaining() < len {
            return Err(truncated(buf.remaining()));
        }
        let whole: &[u8] = *buf;
        let (mut data, rest) = whole.split_at(len);
        *buf = rest;

        let width_of = |w: usize| {
            if len % w == 0 {
                Ok(len / w)
            } else {
                Err(SecsError::BadLength {
                    format,
                    len,
                    width: w,
                })
            }
        };
        let item = match format {
            format::BINARY => Item::Binary(data.to_vec()),
            format::BOOLEAN => Item::Boolean(data.iter().map(|&b| b != 0).collect()),
            format::ASCII => Item::Ascii(String::from_utf8_lossy(data).into_owned()),
            format::U1 => Item::U1(data.to_vec()),
            format::I1 => Item::I1((0..len).map(|_| data.get_i8()).collect()),
            format::I2 => Item::I2((0..width_of(2)?).map(|_| data.get_i16()).collect()),
            format::I4 => Item::I4((0..width_of(4)?).map(|_| data.get_i32()).collect()),
            format::I8 => Item::I8((0..width_of(8)?).map(|_| data.get_i64()).collect()),
            format::U2 => Item::U2((0..width_of(2)?).map(|_| data.get_u16()).collect()),
            format::U4 => Item::U4((0..width_of(4)?).map(|_| data.get_u32()).collect()),
            format::U8 => Item::U8((0..width_of(8)?).map(|_| data.get_u64()).collect()),
            format::F4 => Item::F4((0..width_of(4)?).map(|_| data.get_f32()).collect()),
            format::F8 => Item::F8((0..width_of(8)?).map(|_| data.get_f64()).collect()),
            _ => return Err(SecsError::UnknownFormat(head)),
        };
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(
            Item::ascii("START").to_bytes().unwrap().as_ref(),
            &[0x41, 0x05, b'S', b'T', b'A', b'R', b'T']
        );
        assert_eq!(
            Item::u4(8300).to_bytes().unwrap().as_ref(),
            &[0xB1, 0x04, 0x00, 0x00, 0x20, 0x6C]
        );
        assert_eq!(Item::list([]).to_bytes().unwrap().as_ref(), &[0x01, 0x00]);
        assert_eq!(Item::u1(1).to_bytes().unwrap().as_ref(), &[0xA5, 0x01, 0x01]);
        assert_eq!(Item::boolean(true).to_bytes().unwrap().as_ref(), &[0x25, 0x01, 0x01]);
    }

    #[test]
    fn long_items_use_more_length_bytes() {
        let item = Item::Binary(vec![7; 300]);
        let bytes = item.to_bytes().unwrap();
        assert_eq!(&bytes[..3], &[0x22, 0x01, 0x2C]);
        assert_eq!(Item::from_bytes(&bytes), Ok(item));
    }

    #[test]
    fn decodes_nested_event_body() {
        // L[U4 1, U4 8300, L[L[U4 6, L[L[U4 10095, L[U1 1, U1 0]]]]]]
        let body = Item::list([
            Item::u4(1),
            Item::u4(8300),
            Item::list([Item::list([
                Item::u4(6),
                Item::list([Item::list([
                    Item::u4(10095),
                    Item::list([Item::u1(1), Item::u1(0)]),
                ])]),
            ])]),
        ]);
        let decoded = Item::from_bytes(&body.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get(1).and_then(Item::as_i64), Some(8300));
        assert_eq!(decoded, body);
    }

    #[test]
    fn every_numeric_format_decodes() {
        let items = [
            Item::I1(vec![-1, 2]),
            Item::I2(vec![-300]),
            Item::I4(vec![-70000, 5]),
            Item::I8(vec![1 << 40]),
            Item::U2(vec![65535]),
            Item::U8(vec![42]),
            Item::F4(vec![1.5]),
            Item::F8(vec![-2.25]),
        ];
        for item in items {
            assert_eq!(Item::from_bytes(&item.to_bytes().unwrap()), Ok(item.clone()));
        }
        assert_eq!(Item::I4(vec![-70000, 5]).integers(), vec![-70000, 5]);
    }

    #[test]
    fn malformed_items() {
        assert_eq!(Item::from_bytes(&[]), Err(SecsError::Truncated(0)));
        assert_eq!(Item::from_bytes(&[0x41, 0x03, b'a']), Err(SecsError::Truncated(2)));
        assert_eq!(Item::from_bytes(&[0xFD, 0x00]), Err(SecsError::UnknownFormat(0xFD)));
        assert!(matches!(
            Item::from_bytes(&[0xB1, 0x03, 0, 0, 1]),
            Err(SecsError::BadLength { .. })
        ));
        assert_eq!(Item::from_bytes(&[0x01, 0x00, 0x00]), Err(SecsError::Trailing(1)));
    }

    fn nested(depth: usize) -> Vec<u8> {
        let mut body = Vec::with_capacity(depth * 2 + 3);
        for _ in 0..depth {
            body.extend_from_slice(&[0x01, 0x01]);
        }
        body.extend_from_slice(&[0xA5, 0x01, 0x07]);
        body
    }

    #[test]
    fn nesting_is_limited() {
        let inside = Item::from_bytes(&nested(MAX_DEPTH)).unwrap();
        let mut item = &inside;
        for _ in 0..MAX_DEPTH {
            item = item.get(0).unwrap();
        }
        assert_eq!(item, &Item::u1(7));

        assert_eq!(Item::from_bytes(&nested(MAX_DEPTH + 1)), Err(SecsError::TooDeep));
        assert_eq!(Item::from_bytes(&nested(200_000)), Err(SecsError::TooDeep));
    }

    #[test]
    fn oversized_items_are_not_encoded() {
        let item = Item::list([Item::u4(1), Item::Binary(vec![0; MAX_LENGTH + 1])]);
        assert_eq!(item.to_bytes(), Err(SecsError::TooLong(MAX_LENGTH + 1)));
        assert!(Item::Binary(vec![0; MAX_LENGTH]).to_bytes().is_ok());
    }
}
