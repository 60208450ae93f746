//! Scripts appended to first generation firmware.
//!
//! Before the file system existed, a single script was stored in a fixed
//! 8KB block of flash:
//! ```text
//! 0x3e000  'M' 'P' len_lo len_hi  script bytes ...  zero padding
//! ```
//! The block is padded to a whole number of 16-byte hex records.

use crate::error::CapacityError;
use crate::error::FormatError;
use crate::error::Result;
use crate::ihex;
use crate::mem::MemoryMap;
use crate::mem::ERASED;

/// Address of the block.
pub const START: u32 = 0x3e000;
/// Size of the block.
pub const LEN: usize = 8192;
/// Length of the `MP` header.
pub const HEADER_LEN: usize = 4;

const SIGNATURE: [u8; 2] = *b"MP";
const RECORD_LEN: usize = 16;

/// Older tooling marked where the script went with this line.
const INSERTION_POINT: &str = ":::::::::::::::::::::::::::::::::::::::::::\n";

fn cleanse(hex: &str) -> String {
  hex.replacen(INSERTION_POINT, "", 1)
}

/// Builds the block for `script`: header, script bytes, zero padding.
pub fn block(script: &[u8]) -> Result<Vec<u8>> {
  let mut len = HEADER_LEN + script.len();
  if len % RECORD_LEN != 0 {
    len += RECORD_LEN - len % RECORD_LEN;
  }
  if len > LEN {
    return Err(CapacityError::ScriptTooLong { len, max: LEN }.into());
  }

  let mut block = vec![0; len];
  block[..2].copy_from_slice(&SIGNATURE);
  block[2..4].copy_from_slice(&(script.len() as u16).to_le_bytes());
  block[HEADER_LEN..HEADER_LEN + script.len()].copy_from_slice(script);
  Ok(block)
}

/// Returns a copy of `firmware_hex` with `script` appended.
///
/// Any script already in the block is replaced.
pub fn encode(firmware_hex: &str, script: &str) -> Result<String> {
  let block = block(script.as_bytes())?;
  let mut map = ihex::parse(&cleanse(firmware_hex))?;
  map.remove_range(START, LEN as u64);
  map.put(START, &block)?;
  tracing::debug!(len = script.len(), "appended script");
  Ok(ihex::serialize(&map))
}

/// Extracts the appended script from a memory image.
///
/// Returns an empty string if there is none.
pub fn decode_map(map: &MemoryMap) -> String {
  let bytes = match map.contiguous_from(START) {
    Some(bytes) if bytes.starts_with(&SIGNATURE) => bytes,
    _ => return String::new(),
  };
  let end = bytes.len().min(LEN);
  let script = bytes[HEADER_LEN.min(end)..end]
    .iter()
    .copied()
    .filter(|&b| b != 0)
    .collect::<Vec<_>>();
  String::from_utf8_lossy(&script).into_owned()
}

/// Extracts the appended script from hex text.
pub fn decode(hex: &str) -> Result<String> {
  Ok(decode_map(&ihex::parse(&cleanse(hex))?))
}

/// Returns true if `map` has the block signature. The length is not checked.
pub fn is_present(map: &MemoryMap) -> bool {
  map.slice_pad(START, SIGNATURE.len(), ERASED) == SIGNATURE
}

/// Like `is_present()`, for hex text.
pub fn is_present_in_hex(hex: &str) -> std::result::Result<bool, FormatError> {
  Ok(is_present(&ihex::parse(&cleanse(hex))?))
}
