//! Intel HEX reading and writing.
//!
//! An Intel HEX file is a sequence of records, one per line, of the form
//! ```text
//! :LLAAAATT[DD...]CC
//! ```
//! where `LL` is the number of data bytes, `AAAA` the low 16 bits of the
//! address, `TT` the record type and `CC` a checksum that makes all decoded
//! bytes of the line sum to zero. Extended address records move the 64KB
//! window that data records' addresses are relative to.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::FormatError;
use crate::error::UsageError;
use crate::mem::MemoryMap;

/// The default number of data bytes per record when serializing.
pub const DEFAULT_LINE_SIZE: usize = 16;

lazy_static! {
  static ref HEX_LINE: Regex =
    Regex::new(r":[0-9A-Fa-f]{10,}(?:\r\n|\r|\n|)").unwrap();
}

/// The type byte of a record.
///
/// Besides the six Intel types, this includes the block types used by
/// universal hex files.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordType {
  /// Data at the current window plus the record address.
  Data = 0x00,
  /// End of file.
  Eof = 0x01,
  /// Sets the window base to the (segment) value times 16.
  ExtendedSegment = 0x02,
  /// The CS:IP start address; ignored.
  StartSegment = 0x03,
  /// Sets the upper 16 bits of the window base.
  ExtendedLinear = 0x04,
  /// The EIP start address; ignored.
  StartLinear = 0x05,
  /// Starts a universal hex section, carrying the board id.
  BlockStart = 0x0a,
  /// Ends a universal hex section.
  BlockEnd = 0x0b,
  /// Filler inside a universal hex section.
  PaddedData = 0x0c,
  /// Data that only the section's target board should flash.
  CustomData = 0x0d,
  /// Data that no board should flash.
  OtherData = 0x0e,
}

impl RecordType {
  /// Decodes a type byte.
  pub fn from_u8(byte: u8) -> Option<Self> {
    use RecordType::*;
    Some(match byte {
      0x00 => Data,
      0x01 => Eof,
      0x02 => ExtendedSegment,
      0x03 => StartSegment,
      0x04 => ExtendedLinear,
      0x05 => StartLinear,
      0x0a => BlockStart,
      0x0b => BlockEnd,
      0x0c => PaddedData,
      0x0d => CustomData,
      0x0e => OtherData,
      _ => return None,
    })
  }
}

/// A single decoded record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
  /// The record type.
  pub ty: RecordType,
  /// The 16-bit address field.
  pub address: u16,
  /// The data bytes.
  pub data: Vec<u8>,
}

/// Computes the checksum byte for `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
  let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
  0u8.wrapping_sub(sum)
}

impl Record {
  /// Creates a data record.
  pub fn data(address: u16, data: &[u8]) -> Self {
    Self {
      ty: RecordType::Data,
      address,
      data: data.to_vec(),
    }
  }

  /// Creates an extended linear address record for the window at
  /// `upper << 16`.
  pub fn extended_linear(upper: u16) -> Self {
    Self {
      ty: RecordType::ExtendedLinear,
      address: 0,
      data: upper.to_be_bytes().to_vec(),
    }
  }

  /// Creates the end-of-file record.
  pub fn eof() -> Self {
    Self {
      ty: RecordType::Eof,
      address: 0,
      data: Vec::new(),
    }
  }

  /// Decodes the hex digits of a record, i.e., everything after the colon.
  ///
  /// `record` is used to number errors.
  pub fn from_digits(record: usize, digits: &str) -> Result<Self, FormatError> {
    let bytes = hex::decode(digits).map_err(|e| match e {
      hex::FromHexError::OddLength => FormatError::OddDigits { record },
      _ => FormatError::Unparseable {
        start: 0,
        end: digits.len(),
        text: shorten(digits),
      },
    })?;

    if bytes.len() < 5 {
      return Err(FormatError::Length {
        record,
        expected: bytes.first().copied().unwrap_or(0) as usize,
        actual: 0,
      });
    }
    let (body, cs) = bytes.split_at(bytes.len() - 1);
    let len = body[0] as usize;
    if len != body.len() - 4 {
      return Err(FormatError::Length {
        record,
        expected: len,
        actual: body.len() - 4,
      });
    }
    if checksum(body) != cs[0] {
      return Err(FormatError::Checksum {
        record,
        expected: checksum(body),
      });
    }

    let ty = RecordType::from_u8(body[3])
      .ok_or(FormatError::RecordType { record, ty: body[3] })?;
    Ok(Self {
      ty,
      address: u16::from_be_bytes([body[1], body[2]]),
      data: body[4..].to_vec(),
    })
  }

  /// Decodes one line of hex text, which must start with a colon.
  pub fn parse_line(record: usize, line: &str) -> Result<Self, FormatError> {
    let line = line.trim_end();
    match line.strip_prefix(':') {
      Some(digits) => Self::from_digits(record, digits),
      None => Err(FormatError::Unparseable {
        start: 0,
        end: line.len(),
        text: shorten(line),
      }),
    }
  }

  /// Encodes this record as a line of text, without a line terminator.
  pub fn to_line(&self) -> String {
    let mut bytes = Vec::with_capacity(self.data.len() + 5);
    bytes.push(self.data.len() as u8);
    bytes.extend_from_slice(&self.address.to_be_bytes());
    bytes.push(self.ty as u8);
    bytes.extend_from_slice(&self.data);
    bytes.push(checksum(&bytes));
    format!(":{}", hex::encode_upper(bytes))
  }
}

fn shorten(text: &str) -> String {
  text.chars().take(32).collect()
}

fn check_zero_address(record: usize, r: &Record) -> Result<(), FormatError> {
  if r.address != 0 {
    return Err(FormatError::Address { record });
  }
  Ok(())
}

fn extended_base(record: usize, r: &Record) -> Result<u32, FormatError> {
  check_zero_address(record, r)?;
  match r.data.as_slice() {
    &[hi, lo] => Ok(u16::from_be_bytes([hi, lo]) as u32),
    _ => Err(FormatError::ExtendedAddress { record }),
  }
}

/// Parses Intel HEX text into a memory image.
///
/// Any text that is not a record, any record that fails validation, or a
/// missing end-of-file record, fails the whole parse.
pub fn parse(text: &str) -> Result<MemoryMap, FormatError> {
  let mut blocks = Vec::new();
  let mut base = 0u32;
  let mut seen_eof = false;
  let mut last = 0;
  let mut count = 0;

  for (record, m) in HEX_LINE.find_iter(text).enumerate() {
    if m.start() != last {
      return Err(FormatError::Unparseable {
        start: last,
        end: m.start(),
        text: shorten(&text[last..m.start()]),
      });
    }
    last = m.end();
    count += 1;

    if seen_eof {
      return Err(FormatError::DataAfterEof { record });
    }

    let digits = m.as_str().trim_end_matches(|c: char| c == '\r' || c == '\n');
    let r = Record::from_digits(record, &digits[1..])?;
    match r.ty {
      RecordType::Data => {
        if r.address as usize + r.data.len() > 0x1_0000 {
          return Err(FormatError::Wrap { record });
        }
        blocks.push((base + r.address as u32, r.data));
      }
      RecordType::Eof => {
        check_zero_address(record, &r)?;
        seen_eof = true;
      }
      RecordType::ExtendedSegment => base = extended_base(record, &r)? << 4,
      RecordType::ExtendedLinear => base = extended_base(record, &r)? << 16,
      RecordType::StartSegment | RecordType::StartLinear => {
        check_zero_address(record, &r)?;
      }
      ty => {
        return Err(FormatError::RecordType {
          record,
          ty: ty as u8,
        })
      }
    }
  }

  if count == 0 {
    return Err(FormatError::NoRecords);
  }
  if !text[last..].trim().is_empty() {
    return Err(FormatError::Unparseable {
      start: last,
      end: text.len(),
      text: shorten(&text[last..]),
    });
  }
  if !seen_eof {
    return Err(FormatError::MissingEof);
  }

  MemoryMap::from_blocks(blocks)
}

/// Splits `map` into records of at most `line_size` data bytes.
///
/// The records include an extended linear address record before the first
/// record of every 64KB window, and end with the end-of-file record.
pub fn records(map: &MemoryMap, line_size: usize) -> Vec<Record> {
  let mut out = Vec::new();
  let mut window = None;
  for (start, data) in map.iter() {
    let mut addr = start as u64;
    let mut rest = data;
    while !rest.is_empty() {
      let upper = (addr >> 16) as u16;
      if window != Some(upper) {
        out.push(Record::extended_linear(upper));
        window = Some(upper);
      }
      let low = (addr & 0xffff) as usize;
      let n = line_size.min(rest.len()).min(0x1_0000 - low);
      out.push(Record::data(low as u16, &rest[..n]));
      rest = &rest[n..];
      addr += n as u64;
    }
  }
  out.push(Record::eof());
  out
}

/// Serializes `map` as Intel HEX text with `line_size` bytes per record.
///
/// Every line, including the final `:00000001FF`, ends in `\n`.
pub fn serialize_with(
  map: &MemoryMap,
  line_size: usize,
) -> Result<String, UsageError> {
  if line_size == 0 || line_size > 0xff {
    return Err(UsageError::LineSize(line_size));
  }
  let mut text = String::new();
  for r in records(map, line_size) {
    text.push_str(&r.to_line());
    text.push('\n');
  }
  Ok(text)
}

/// Serializes `map` with the default line size.
pub fn serialize(map: &MemoryMap) -> String {
  let mut text = String::new();
  for r in records(map, DEFAULT_LINE_SIZE) {
    text.push_str(&r.to_line());
    text.push('\n');
  }
  text
}
