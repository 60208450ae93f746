//! Sparse memory images.
//!
//! A [`MemoryMap`] maps 32-bit addresses to contiguous blocks of bytes. Blocks
//! never overlap and are never empty; blocks that touch are coalesced, so two
//! maps holding the same bytes compare equal regardless of how they were
//! built.
//!
//! [`MemoryMap`]: struct.MemoryMap.html

use std::collections::BTreeMap;
use std::io;

use crate::error::FormatError;

/// The value of erased flash, used wherever a map has no data.
pub const ERASED: u8 = 0xff;

/// A sparse, ordered, overlap-free memory image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryMap {
  blocks: BTreeMap<u32, Vec<u8>>,
}

fn end_of(addr: u32, len: usize) -> u64 {
  addr as u64 + len as u64
}

fn check_range(addr: u32, len: usize) -> Result<(), FormatError> {
  if end_of(addr, len) > 1 << 32 {
    return Err(FormatError::AddressOverflow { addr });
  }
  Ok(())
}

impl MemoryMap {
  /// Creates an empty map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Builds a map out of unordered blocks, which must not overlap.
  ///
  /// Empty blocks are ignored, and adjacent blocks are joined.
  pub fn from_blocks(
    blocks: impl IntoIterator<Item = (u32, Vec<u8>)>,
  ) -> Result<Self, FormatError> {
    let mut blocks = blocks
      .into_iter()
      .filter(|(_, data)| !data.is_empty())
      .collect::<Vec<_>>();
    blocks.sort_by_key(|&(addr, _)| addr);

    let mut map = Self::new();
    let mut last: Option<(u32, u64)> = None;
    for (addr, data) in blocks {
      check_range(addr, data.len())?;
      let end = end_of(addr, data.len());
      match last {
        Some((_, last_end)) if (addr as u64) < last_end => {
          return Err(FormatError::Overlap { addr });
        }
        Some((start, last_end)) if addr as u64 == last_end => {
          if let Some(block) = map.blocks.get_mut(&start) {
            block.extend_from_slice(&data);
          }
          last = Some((start, end));
        }
        _ => {
          map.blocks.insert(addr, data);
          last = Some((addr, end));
        }
      }
    }
    Ok(map)
  }

  /// Returns true if this map holds no bytes.
  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  /// Returns the number of (coalesced) blocks.
  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  /// Returns the total number of bytes held.
  pub fn byte_count(&self) -> usize {
    self.blocks.values().map(Vec::len).sum()
  }

  /// Iterates over `(start, bytes)` for each block, in address order.
  pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
    self.blocks.iter().map(|(&addr, data)| (addr, data.as_slice()))
  }

  /// Returns true if `addr` holds a byte.
  pub fn contains(&self, addr: u32) -> bool {
    self.contiguous_from(addr).is_some()
  }

  /// Returns the bytes from `addr` to the end of the block containing it.
  pub fn contiguous_from(&self, addr: u32) -> Option<&[u8]> {
    let (&start, data) = self.blocks.range(..=addr).next_back()?;
    let offset = (addr - start) as usize;
    if offset < data.len() {
      Some(&data[offset..])
    } else {
      None
    }
  }

  /// Writes `data` at `addr`, replacing any bytes already there.
  pub fn put(&mut self, addr: u32, data: &[u8]) -> Result<(), FormatError> {
    if data.is_empty() {
      return Ok(());
    }
    check_range(addr, data.len())?;
    let end = end_of(addr, data.len());

    // Collect every block that overlaps or touches `addr..end`. Blocks are
    // sorted and disjoint, so their ends ascend as well.
    let upper = if end > u32::MAX as u64 {
      u32::MAX
    } else {
      end as u32
    };
    let touching = self
      .blocks
      .range(..=upper)
      .rev()
      .take_while(|(&start, block)| end_of(start, block.len()) >= addr as u64)
      .map(|(&start, _)| start)
      .collect::<Vec<_>>();

    let mut start = addr;
    let mut stop = end;
    for &s in &touching {
      let len = self.blocks.get(&s).map_or(0, Vec::len);
      start = start.min(s);
      stop = stop.max(end_of(s, len));
    }

    let mut merged = vec![ERASED; (stop - start as u64) as usize];
    for s in touching {
      if let Some(block) = self.blocks.remove(&s) {
        let offset = (s - start) as usize;
        merged[offset..offset + block.len()].copy_from_slice(&block);
      }
    }
    let offset = (addr - start) as usize;
    merged[offset..offset + data.len()].copy_from_slice(data);
    self.blocks.insert(start, merged);
    Ok(())
  }

  /// Drops every byte in `start..start + len`.
  pub fn remove_range(&mut self, start: u32, len: u64) {
    let stop = start as u64 + len;
    let mut kept = BTreeMap::new();
    for (addr, data) in std::mem::take(&mut self.blocks) {
      let block_end = end_of(addr, data.len());
      if block_end <= start as u64 || addr as u64 >= stop {
        kept.insert(addr, data);
        continue;
      }
      if addr < start {
        kept.insert(addr, data[..(start - addr) as usize].to_vec());
      }
      if block_end > stop {
        let cut = (stop - addr as u64) as usize;
        kept.insert(stop as u32, data[cut..].to_vec());
      }
    }
    self.blocks = kept;
  }

  /// Finds an address claimed by both `self` and `other`, if there is one.
  pub fn overlap(&self, other: &MemoryMap) -> Option<u32> {
    // Build a list of all the endpoints of all the blocks, sort it, and look
    // for two starts in a row.
    #[derive(Copy, Clone)]
    struct Endpoint {
      value: u64,
      is_start: bool,
    }

    let mut endpoints = Vec::new();
    for (start, block) in self.iter().chain(other.iter()) {
      endpoints.push(Endpoint {
        value: start as u64,
        is_start: true,
      });
      endpoints.push(Endpoint {
        value: end_of(start, block.len()),
        is_start: false,
      });
    }

    endpoints.sort_by(|a, b| {
      a.value
        .cmp(&b.value)
        // Sort ends before starts, so touching blocks do not count. Recall
        // that false < true.
        .then(a.is_start.cmp(&b.is_start))
    });

    endpoints
      .windows(2)
      .find(|pair| pair[0].is_start && pair[1].is_start)
      .map(|pair| pair[1].value as u32)
  }

  /// Adds all of `other`'s blocks to this map; the two must not overlap.
  pub fn merge(&mut self, other: &MemoryMap) -> Result<(), FormatError> {
    if let Some(addr) = self.overlap(other) {
      return Err(FormatError::Overlap { addr });
    }
    for (addr, data) in other.iter() {
      self.put(addr, data)?;
    }
    Ok(())
  }

  /// Copies the bytes in `start..start + len` into a new map.
  pub fn slice(&self, start: u32, len: u64) -> MemoryMap {
    let stop = start as u64 + len;
    let mut out = MemoryMap::new();
    let first = match self.blocks.range(..=start).next_back() {
      Some((&addr, _)) => addr,
      None => start,
    };
    for (&addr, data) in self.blocks.range(first..) {
      let block_end = end_of(addr, data.len());
      if addr as u64 >= stop {
        break;
      }
      if block_end <= start as u64 {
        continue;
      }
      let from = start.max(addr);
      let to = stop.min(block_end);
      let bytes = &data[(from - addr) as usize..(to - addr as u64) as usize];
      out.blocks.insert(from, bytes.to_vec());
    }
    out
  }

  /// Copies everything at or above `start` into a new map.
  pub fn slice_from(&self, start: u32) -> MemoryMap {
    self.slice(start, (1u64 << 32) - start as u64)
  }

  /// Copies `start..start + len` into a flat buffer, filling gaps with `pad`.
  pub fn slice_pad(&self, start: u32, len: usize, pad: u8) -> Vec<u8> {
    let mut out = vec![pad; len];
    for (addr, data) in self.slice(start, len as u64).iter() {
      let offset = (addr - start) as usize;
      out[offset..offset + data.len()].copy_from_slice(data);
    }
    out
  }

  fn read_le(&self, addr: u32, len: usize) -> u64 {
    self
      .slice_pad(addr, len, ERASED)
      .iter()
      .rev()
      .fold(0, |acc, &b| (acc << 8) | b as u64)
  }

  /// Reads a byte; unmapped bytes read as erased flash.
  pub fn read_u8(&self, addr: u32) -> u8 {
    self.read_le(addr, 1) as u8
  }

  /// Reads a little-endian `u16`.
  pub fn read_u16(&self, addr: u32) -> u16 {
    self.read_le(addr, 2) as u16
  }

  /// Reads a little-endian `u32`.
  pub fn read_u32(&self, addr: u32) -> u32 {
    self.read_le(addr, 4) as u32
  }

  /// Reads a little-endian `u64`.
  pub fn read_u64(&self, addr: u32) -> u64 {
    self.read_le(addr, 8)
  }

  /// Reads a NUL-terminated string starting at `addr`.
  ///
  /// The terminator must lie within the same block; if it does not, or if
  /// `addr` is unmapped, the string is empty.
  pub fn read_cstr(&self, addr: u32) -> String {
    let bytes = match self.contiguous_from(addr) {
      Some(bytes) => bytes,
      None => return String::new(),
    };
    match bytes.iter().position(|&b| b == 0) {
      Some(nul) => String::from_utf8_lossy(&bytes[..nul]).into_owned(),
      None => String::new(),
    }
  }

  /// Returns the start of every `page_size`-aligned page holding data.
  pub fn pages(&self, page_size: u32) -> Vec<u32> {
    let mut pages = Vec::new();
    for (addr, data) in self.iter() {
      let mut page = addr - addr % page_size;
      let end = end_of(addr, data.len());
      while (page as u64) < end {
        if pages.last() != Some(&page) {
          pages.push(page);
        }
        match page.checked_add(page_size) {
          Some(next) => page = next,
          None => break,
        }
      }
    }
    pages
  }

  /// Dumps the (interesting) contents of this map to the given `Write`.
  ///
  /// Rows that are entirely erased flash are skipped.
  pub fn dump(&self, mut w: impl io::Write) -> io::Result<()> {
    let mut ascii_str = String::new();
    for row in self.pages(32) {
      let chunk = self.slice_pad(row, 32, ERASED);
      if chunk.iter().all(|&byte| byte == ERASED) {
        continue;
      }
      write!(w, "{:08x}:", row)?;

      ascii_str.clear();
      for &byte in &chunk {
        write!(w, " {:02x}", byte)?;

        if 0x20 <= byte && byte <= 0x7e {
          ascii_str.push(byte as char);
        } else {
          ascii_str.push('.');
        }
      }
      writeln!(w, "  |{}|", ascii_str)?;
    }
    Ok(())
  }
}
