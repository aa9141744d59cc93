//! Minimal DER tag-length-value reader used to walk card directory entries.

use thiserror::Error;

pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_BIT_STRING: u32 = 0x03;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_UTF8_STRING: u32 = 0x0C;
pub const TAG_SEQUENCE: u32 = 0x30;
pub const TAG_CONTEXT_0: u32 = 0xA0;
pub const TAG_CONTEXT_1: u32 = 0xA1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("unexpected end of data while parsing tag")]
    UnexpectedEndTag,
    #[error("unexpected end of data while parsing length")]
    UnexpectedEndLength,
    #[error("unexpected end of data while parsing value")]
    UnexpectedEndValue,
    #[error("invalid length encoding")]
    InvalidLength,
    #[error("only tags of up to three bytes are supported")]
    TagTooLong,
    #[error("expected tag {expected:#x}, found {found:#x}")]
    UnexpectedTag { expected: u32, found: u32 },
    #[error("{0} trailing byte(s) after element")]
    TrailingData(usize),
}

/// One decoded element borrowing its value from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u32,
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Reader over the contents of a constructed element.
    pub fn children(&self) -> TlvReader<'a> {
        TlvReader::new(self.value)
    }
}

/// Sequential reader over concatenated DER elements.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Tag of the next element without consuming it.
    pub fn peek_tag(&self) -> Result<Option<u32>, TlvError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut probe = self.clone();
        probe.read_tag().map(Some)
    }

    pub fn read(&mut self) -> Result<Tlv<'a>, TlvError> {
        let tag = self.read_tag()?;
        let len = self.read_length()?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(TlvError::UnexpectedEndValue)?;
        let value = &self.data[self.pos..end];
        self.pos = end;
        Ok(Tlv { tag, value })
    }

    /// Read the next element and require it to carry `tag`.
    pub fn expect(&mut self, tag: u32) -> Result<Tlv<'a>, TlvError> {
        let tlv = self.read()?;
        if tlv.tag != tag {
            return Err(TlvError::UnexpectedTag {
                expected: tag,
                found: tlv.tag,
            });
        }
        Ok(tlv)
    }

    /// Read the next element only if it carries `tag`.
    pub fn read_if(&mut self, tag: u32) -> Result<Option<Tlv<'a>>, TlvError> {
        if self.peek_tag()? == Some(tag) {
            self.read().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn finish(&self) -> Result<(), TlvError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(TlvError::TrailingData(n)),
        }
    }

    fn next_byte(&mut self, err: TlvError) -> Result<u8, TlvError> {
        let byte = *self.data.get(self.pos).ok_or(err)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_tag(&mut self) -> Result<u32, TlvError> {
        let first = self.next_byte(TlvError::UnexpectedEndTag)?;
        let mut tag = first as u32;
        if first & 0x1F != 0x1F {
            return Ok(tag);
        }
        for count in 1.. {
            if count > 2 {
                return Err(TlvError::TagTooLong);
            }
            let byte = self.next_byte(TlvError::UnexpectedEndTag)?;
            tag = (tag << 8) | byte as u32;
            if byte & 0x80 == 0 {
                break;
            }
        }
        Ok(tag)
    }

    fn read_length(&mut self) -> Result<usize, TlvError> {
        let first = self.next_byte(TlvError::UnexpectedEndLength)?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 3 {
            return Err(TlvError::InvalidLength);
        }
        let mut len = 0usize;
        for _ in 0..count {
            let byte = self.next_byte(TlvError::UnexpectedEndLength)?;
            len = (len << 8) | byte as usize;
        }
        Ok(len)
    }
}

/// Decode a non-negative DER INTEGER of at most four significant bytes.
pub fn decode_u32(value: &[u8]) -> Option<u32> {
    let trimmed = match value {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    let negative = value.first().is_some_and(|byte| byte & 0x80 != 0);
    if trimmed.is_empty() || trimmed.len() > 4 || negative {
        return None;
    }
    Some(trimmed.iter().fold(0u32, |acc, byte| (acc << 8) | *byte as u32))
}

/// Decode the named bits of a BIT STRING value. Bit 0 is the most
/// significant bit of the first content byte.
pub fn decode_bit_flags(value: &[u8]) -> Option<u32> {
    let (unused, bits) = value.split_first()?;
    if *unused > 7 || bits.len() > 4 {
        return None;
    }
    let mut flags = 0u32;
    for (index, byte) in bits.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                flags |= 1 << (index * 8 + bit);
            }
        }
    }
    Some(flags)
}
