//! The 128-byte chunks that files are stored in.
//!
//! ```text
//! | marker | 126 bytes of file data ... | tail |
//! ```
//! The marker is either a sentinel (see [`marker`]) or, for all but the first
//! chunk of a file, the index of the previous chunk. The tail is the index of
//! the next chunk, or `marker::UNUSED` in a file's last chunk.
//!
//! [`marker`]: marker/index.html

use crate::mem::MemoryMap;
use crate::mem::ERASED;

/// Length of a chunk.
pub const CHUNK_LEN: usize = 128;
/// File bytes carried by one chunk.
pub const DATA_LEN: usize = CHUNK_LEN - 2;
/// Offset of the tail byte.
pub const TAIL: usize = CHUNK_LEN - 1;
/// Largest number of chunks a file system can have.
pub const MAX_CHUNKS: usize = 252;

/// Marker sentinels.
pub mod marker {
  /// A chunk that was used and then deleted.
  pub const FREED: u8 = 0x00;
  /// The first byte of the persistent data page.
  pub const PERSISTENT_DATA: u8 = 0xfd;
  /// The first chunk of a file.
  pub const FILE_START: u8 = 0xfe;
  /// Erased flash.
  pub const UNUSED: u8 = 0xff;
}

/// A 1-based chunk index.
///
/// Zero is never a chunk; neither are the sentinel values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u8);

impl ChunkId {
  /// Wraps `index`, if it can name a chunk.
  pub fn new(index: u8) -> Option<Self> {
    if index == 0 || index as usize > MAX_CHUNKS {
      return None;
    }
    Some(Self(index))
  }

  /// Returns the raw index.
  pub fn get(self) -> u8 {
    self.0
  }

  fn slot(self) -> usize {
    self.0 as usize - 1
  }
}

/// What a marker byte says about its chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
  /// Never written.
  Unused,
  /// Deleted.
  Freed,
  /// Not a chunk, but the persistent data marker.
  Persistent,
  /// First chunk of a file.
  FileStart,
  /// A later chunk of a file, whose predecessor is the given index.
  Continuation(u8),
}

impl Kind {
  /// Classifies a marker byte.
  pub fn of(marker: u8) -> Self {
    match marker {
      marker::UNUSED => Self::Unused,
      marker::FREED => Self::Freed,
      marker::PERSISTENT_DATA => Self::Persistent,
      marker::FILE_START => Self::FileStart,
      prev => Self::Continuation(prev),
    }
  }

  /// Returns true if the chunk may be allocated.
  pub fn is_free(self) -> bool {
    matches!(self, Self::Unused | Self::Freed)
  }
}

/// The raw bytes of one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk(pub [u8; CHUNK_LEN]);

impl Chunk {
  /// An erased chunk.
  pub fn erased() -> Self {
    Chunk([ERASED; CHUNK_LEN])
  }

  /// Returns the marker byte.
  pub fn marker(&self) -> u8 {
    self.0[0]
  }

  /// Classifies this chunk by its marker.
  pub fn kind(&self) -> Kind {
    Kind::of(self.marker())
  }

  /// Returns the tail byte.
  pub fn tail(&self) -> u8 {
    self.0[TAIL]
  }

  /// Returns the bytes in `range`, if they lie within the chunk.
  pub fn bytes(&self, range: std::ops::Range<usize>) -> Option<&[u8]> {
    self.0.get(range)
  }
}

/// The chunks of a file system region, loaded out of a memory image.
#[derive(Clone, Debug)]
pub struct Arena {
  chunks: Vec<Chunk>,
}

impl Arena {
  /// Loads `count` chunks starting at `start`.
  pub fn load(map: &MemoryMap, start: u32, count: usize) -> Self {
    let bytes = map.slice_pad(start, count * CHUNK_LEN, ERASED);
    let chunks = bytes
      .chunks(CHUNK_LEN)
      .map(|c| {
        let mut chunk = Chunk::erased();
        chunk.0.copy_from_slice(c);
        chunk
      })
      .collect();
    Self { chunks }
  }

  /// Returns the number of chunks.
  pub fn len(&self) -> usize {
    self.chunks.len()
  }

  /// Returns the chunk with index `id`, if the region has one.
  pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
    self.chunks.get(id.slot())
  }

  /// Iterates over every chunk with its index.
  pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &Chunk)> + '_ {
    self
      .chunks
      .iter()
      .zip(1..=MAX_CHUNKS as u8)
      .map(|(chunk, i)| (ChunkId(i), chunk))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn ids() {
    assert_eq!(ChunkId::new(0), None);
    assert_eq!(ChunkId::new(1).map(ChunkId::get), Some(1));
    assert_eq!(ChunkId::new(252).map(ChunkId::get), Some(252));
    assert_eq!(ChunkId::new(253), None);
  }

  #[test]
  fn kinds() {
    assert_eq!(Kind::of(0xff), Kind::Unused);
    assert_eq!(Kind::of(0x00), Kind::Freed);
    assert_eq!(Kind::of(0xfd), Kind::Persistent);
    assert_eq!(Kind::of(0xfe), Kind::FileStart);
    assert_eq!(Kind::of(0x07), Kind::Continuation(7));
    assert!(Kind::Freed.is_free());
    assert!(!Kind::Persistent.is_free());
  }

  #[test]
  fn arena_indices() {
    let mut map = MemoryMap::new();
    map.put(0x1000 + 128, &[marker::FILE_START]).unwrap();
    let arena = Arena::load(&map, 0x1000, 4);
    assert_eq!(arena.len(), 4);

    let kinds = arena.iter().map(|(id, c)| (id.get(), c.kind())).collect::<Vec<_>>();
    assert_eq!(
      kinds,
      vec![
        (1, Kind::Unused),
        (2, Kind::FileStart),
        (3, Kind::Unused),
        (4, Kind::Unused),
      ]
    );
    assert!(arena.get(ChunkId(5)).is_none());
  }
}
