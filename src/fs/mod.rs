//! The MicroPython chunk file system.
//!
//! Files are stored as doubly linked chains of 128-byte chunks (see
//! [`chunk`]) inside the file system region of a firmware image. A file's
//! bytes, as laid out across its chunks, are
//! ```text
//! | end offset | name len | name ... | data ... | 0xff |
//! ```
//! where the end offset is the position of the final data byte within the
//! last chunk.
//!
//! The last page of the region is not used for chunks. Its first byte is set
//! to `marker::PERSISTENT_DATA` whenever a file is written, which tells
//! MicroPython to erase the region on first boot.
//!
//! [`chunk`]: chunk/index.html

use crate::appended;
use crate::device::DeviceMemInfo;
use crate::device::DeviceVersion;
use crate::error::CapacityError;
use crate::error::IntegrityError;
use crate::error::LayoutError;
use crate::error::Result;
use crate::error::UsageError;
use crate::mem::MemoryMap;

pub mod chunk;

use chunk::marker;
use chunk::Arena;
use chunk::ChunkId;
use chunk::Kind;
use chunk::CHUNK_LEN;
use chunk::DATA_LEN;
use chunk::MAX_CHUNKS;
use chunk::TAIL;

/// Longest file name, in bytes.
pub const MAX_FILENAME_LEN: usize = 120;

/// Where the chunks of a file system live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
  start: u32,
  end: u32,
  page_size: u32,
}

impl Layout {
  /// Computes the file system layout of a firmware image.
  ///
  /// On first generation devices the last page of the file system region
  /// is reserved, and an appended script moves the end of the region down to
  /// the script's block.
  pub fn new(
    map: &MemoryMap,
    info: &DeviceMemInfo,
  ) -> std::result::Result<Self, LayoutError> {
    let page_size = info.flash_page_size;
    let mut end = info.fs_end_address;
    if info.device_version == DeviceVersion::V1 {
      if appended::is_present(map) {
        end = appended::START;
      }
      end = end.checked_sub(page_size).ok_or(LayoutError::TooSmall {
        start: info.fs_start_address,
        end,
      })?;
    }

    let max_len = (MAX_CHUNKS * CHUNK_LEN) as u32;
    let start = info.fs_start_address.max(end.saturating_sub(max_len));
    if start % page_size != 0 {
      return Err(LayoutError::Misaligned { start, page_size });
    }
    if end < start || end - start <= page_size {
      return Err(LayoutError::TooSmall { start, end });
    }

    let layout = Self {
      start,
      end,
      page_size,
    };
    tracing::debug!(
      start = layout.start,
      end = layout.end,
      chunks = layout.chunk_count(),
      "file system layout"
    );
    Ok(layout)
  }

  /// Address of chunk 1.
  pub fn start(&self) -> u32 {
    self.start
  }

  /// One past the persistent data page.
  pub fn end(&self) -> u32 {
    self.end
  }

  /// Flash page size.
  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  /// Start of the persistent data page.
  pub fn persistent_page(&self) -> u32 {
    self.end - self.page_size
  }

  /// Usable bytes, counting whole chunks.
  pub fn size(&self) -> u32 {
    self.end - self.start - self.page_size
  }

  /// Number of chunks.
  pub fn chunk_count(&self) -> usize {
    (self.size() as usize / CHUNK_LEN).min(MAX_CHUNKS)
  }

  /// Address of chunk `id`.
  pub fn chunk_addr(&self, id: ChunkId) -> u32 {
    self.start + (id.get() as u32 - 1) * CHUNK_LEN as u32
  }

  fn arena(&self, map: &MemoryMap) -> Arena {
    Arena::load(map, self.start, self.chunk_count())
  }
}

/// Checks that `name` can be stored.
pub fn validate_name(name: &str) -> Result<()> {
  if name.is_empty() {
    return Err(UsageError::InvalidFilename.into());
  }
  if name.len() > MAX_FILENAME_LEN {
    return Err(
      CapacityError::NameTooLong {
        name: name.to_string(),
        max: MAX_FILENAME_LEN,
      }
      .into(),
    );
  }
  Ok(())
}

/// Lays out the bytes a file occupies across its chunks.
fn file_stream(name: &str, data: &[u8]) -> Vec<u8> {
  let header_len = 2 + name.len();
  let mut stream = Vec::with_capacity(header_len + data.len() + 1);
  stream.push(((header_len + data.len()) % DATA_LEN) as u8);
  stream.push(name.len() as u8);
  stream.extend_from_slice(name.as_bytes());
  stream.extend_from_slice(data);
  stream.push(marker::UNUSED);
  stream
}

/// Number of chunks a file needs.
pub fn chunks_needed(name: &str, data_len: usize) -> usize {
  let stream_len = 2 + name.len() + data_len + 1;
  (stream_len + DATA_LEN - 1) / DATA_LEN
}

/// Flash a file takes up, in whole chunks.
pub fn file_size(name: &str, data: &[u8]) -> Result<u32> {
  validate_name(name)?;
  Ok((chunks_needed(name, data.len()) * CHUNK_LEN) as u32)
}

/// Lists the free chunks, lowest index first.
pub fn free_chunks(map: &MemoryMap, layout: &Layout) -> Vec<ChunkId> {
  layout
    .arena(map)
    .iter()
    .filter(|(_, c)| c.kind().is_free())
    .map(|(id, _)| id)
    .collect()
}

/// The result of classifying every chunk.
struct Scan {
  arena: Arena,
  files: Vec<(String, ChunkId)>,
}

fn scan(map: &MemoryMap, layout: &Layout) -> Result<Scan> {
  let arena = layout.arena(map);
  let mut files: Vec<(String, ChunkId)> = Vec::new();
  for (id, chunk) in arena.iter() {
    match chunk.kind() {
      Kind::Unused
      | Kind::Freed
      | Kind::Persistent
      | Kind::Continuation(_) => continue,
      Kind::FileStart => {
        let name_len = chunk.0[2] as usize;
        let name = chunk
          .bytes(3..3 + name_len)
          .ok_or(IntegrityError::Header { chunk: id.get() })?;
        let name = String::from_utf8(name.to_vec())
          .map_err(|_| IntegrityError::Name { chunk: id.get() })?;
        if files.iter().any(|(n, _)| *n == name) {
          return Err(IntegrityError::DuplicateFile { name }.into());
        }
        files.push((name, id));
      }
    }
  }
  Ok(Scan { arena, files })
}

impl Scan {
  fn find(&self, name: &str) -> Option<ChunkId> {
    self
      .files
      .iter()
      .find(|(n, _)| n == name)
      .map(|&(_, id)| id)
  }

  /// Follows the chain starting at `start`, returning its chunks and data.
  fn follow(&self, start: ChunkId) -> Result<(Vec<ChunkId>, Vec<u8>)> {
    let header = IntegrityError::Header { chunk: start.get() };
    let first = self.arena.get(start).ok_or_else(|| header.clone())?;
    let end = 1 + first.0[1] as usize;
    let mut pos = 3 + first.0[2] as usize;

    let mut chain = vec![start];
    let mut data = Vec::new();
    let mut current = start;
    loop {
      let chunk = self.arena.get(current).ok_or_else(|| header.clone())?;
      if chunk.tail() == marker::UNUSED {
        let bytes = chunk.bytes(pos..end).ok_or_else(|| header.clone())?;
        data.extend_from_slice(bytes);
        break;
      }
      let bytes = chunk.bytes(pos..TAIL).ok_or_else(|| header.clone())?;
      data.extend_from_slice(bytes);

      let dangling = IntegrityError::Dangling {
        chunk: current.get(),
        next: chunk.tail(),
      };
      let next = ChunkId::new(chunk.tail()).ok_or_else(|| dangling.clone())?;
      let next_chunk = self.arena.get(next).ok_or_else(|| dangling.clone())?;
      if next_chunk.kind().is_free() {
        return Err(dangling.into());
      }
      if next_chunk.marker() != current.get() {
        return Err(
          IntegrityError::BrokenLink {
            chunk: current.get(),
            next: next.get(),
          }
          .into(),
        );
      }

      chain.push(next);
      current = next;
      pos = 1;
    }
    Ok((chain, data))
  }
}

/// Reads every file, in order of their first chunk.
pub fn read_files(
  map: &MemoryMap,
  layout: &Layout,
) -> Result<Vec<(String, Vec<u8>)>> {
  let scan = scan(map, layout)?;
  let mut files = Vec::with_capacity(scan.files.len());
  for (name, start) in &scan.files {
    let (_, data) = scan.follow(*start)?;
    files.push((name.clone(), data));
  }
  Ok(files)
}

/// Reads the file called `name`.
pub fn read_file(map: &MemoryMap, layout: &Layout, name: &str) -> Result<Vec<u8>> {
  let scan = scan(map, layout)?;
  let start = scan.find(name).ok_or_else(|| UsageError::FileNotFound {
    name: name.to_string(),
  })?;
  Ok(scan.follow(start)?.1)
}

/// Marks every chunk of `name` as freed.
pub fn remove_file(map: &mut MemoryMap, layout: &Layout, name: &str) -> Result<()> {
  let scan = scan(map, layout)?;
  let start = scan.find(name).ok_or_else(|| UsageError::FileNotFound {
    name: name.to_string(),
  })?;
  let (chain, _) = scan.follow(start)?;
  for id in chain {
    map.put(layout.chunk_addr(id), &[marker::FREED])?;
  }
  tracing::debug!(file = name, "removed file");
  Ok(())
}

/// Stores `data` as the file `name`, replacing any file of that name.
///
/// On failure, `map` is left untouched.
pub fn write_file(
  map: &mut MemoryMap,
  layout: &Layout,
  name: &str,
  data: &[u8],
) -> Result<()> {
  validate_name(name)?;
  if data.is_empty() {
    return Err(
      UsageError::MissingContent {
        name: name.to_string(),
      }
      .into(),
    );
  }

  let mut next = map.clone();
  if scan(&next, layout)?.find(name).is_some() {
    remove_file(&mut next, layout, name)?;
  }

  let free = free_chunks(&next, layout);
  let needed = chunks_needed(name, data.len());
  if free.is_empty() {
    return Err(CapacityError::NoSpace.into());
  }
  if free.len() < needed {
    return Err(
      CapacityError::FileTooLarge {
        name: name.to_string(),
      }
      .into(),
    );
  }

  let stream = file_stream(name, data);
  for (i, piece) in stream.chunks(DATA_LEN).enumerate() {
    let mut bytes = [marker::UNUSED; CHUNK_LEN];
    bytes[0] = match i {
      0 => marker::FILE_START,
      _ => free[i - 1].get(),
    };
    bytes[1..1 + piece.len()].copy_from_slice(piece);
    if i + 1 < needed {
      bytes[TAIL] = free[i + 1].get();
    }
    tracing::trace!(file = name, chunk = free[i].get(), "writing chunk");
    next.put(layout.chunk_addr(free[i]), &bytes)?;
  }
  next.put(layout.persistent_page(), &[marker::PERSISTENT_DATA])?;

  tracing::debug!(file = name, len = data.len(), chunks = needed, "wrote file");
  *map = next;
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  use crate::device;
  use crate::fixture;

  fn v1() -> (MemoryMap, Layout) {
    let map = fixture::v1_map();
    let info = device::locate(&map).unwrap();
    let layout = Layout::new(&map, &info).unwrap();
    (map, layout)
  }

  fn v2() -> (MemoryMap, Layout) {
    let map = fixture::v2_map();
    let info = device::locate(&map).unwrap();
    let layout = Layout::new(&map, &info).unwrap();
    (map, layout)
  }

  #[test]
  fn layouts() {
    let (_, layout) = v1();
    assert_eq!(layout.start(), fixture::V1_RUNTIME_END);
    assert_eq!(layout.end(), 0x3fc00);
    assert_eq!(layout.persistent_page(), 0x3f800);
    assert_eq!(layout.size(), fixture::V1_FS_SIZE);
    assert_eq!(layout.chunk_count(), 216);

    let (_, layout) = v2();
    assert_eq!(layout.start(), fixture::V2_FS_START);
    assert_eq!(layout.end(), fixture::V2_FS_END);
    assert_eq!(layout.size(), fixture::V2_FS_SIZE);
    assert_eq!(layout.chunk_count(), 160);
  }

  #[test]
  fn layout_caps_chunks() {
    let (map, _) = v2();
    let mut info = device::locate(&map).unwrap();
    info.fs_start_address = 0x60000;
    info.runtime_end_address = 0x60000;
    info.fs_end_address = 0x69000 + 252 * 128;
    let layout = Layout::new(&map, &info).unwrap();
    assert_eq!(layout.start(), 0x69000);
    assert_eq!(layout.chunk_count(), 252 - 4096 / 128);

    // A capped start must still fall on a page boundary.
    let (map, _) = v1();
    let mut info = device::locate(&map).unwrap();
    info.fs_start_address = 0x30000;
    assert_eq!(
      Layout::new(&map, &info),
      Err(LayoutError::Misaligned {
        start: 0x3fc00 - 252 * 128,
        page_size: 1024,
      })
    );
  }

  #[test]
  fn layout_misaligned() {
    let (map, _) = v1();
    let mut info = device::locate(&map).unwrap();
    info.fs_start_address += 1;
    assert_eq!(
      Layout::new(&map, &info),
      Err(LayoutError::Misaligned {
        start: fixture::V1_RUNTIME_END + 1,
        page_size: 1024,
      })
    );
  }

  #[test]
  fn layout_with_appended_script() {
    let (mut map, _) = v1();
    map.put(appended::START, b"MP\x02\x00hi").unwrap();
    let info = device::locate(&map).unwrap();
    let layout = Layout::new(&map, &info).unwrap();
    assert_eq!(layout.end(), appended::START - 1024);
  }

  #[test]
  fn sizes() {
    assert_eq!(chunks_needed("a.txt", 0), 1);
    // 2 + 5 + 118 + 1 = 126 bytes.
    assert_eq!(chunks_needed("a.txt", 118), 1);
    assert_eq!(chunks_needed("a.txt", 119), 2);
    assert_eq!(file_size("a.txt", &[0; 119]).unwrap(), 256);
    assert!(matches!(
      file_size("", b"x"),
      Err(crate::error::Error::Usage(UsageError::InvalidFilename))
    ));
  }

  #[test]
  fn single_chunk_layout() {
    let (mut map, layout) = v1();
    write_file(&mut map, &layout, "a.txt", b"This is some content").unwrap();

    let chunk = map.slice_pad(layout.start(), CHUNK_LEN, 0xff);
    assert_eq!(chunk[0], marker::FILE_START);
    assert_eq!(chunk[1], 2 + 5 + 20);
    assert_eq!(chunk[2], 5);
    assert_eq!(&chunk[3..8], b"a.txt");
    assert_eq!(&chunk[8..28], b"This is some content");
    assert_eq!(chunk[28], 0xff);
    assert_eq!(chunk[TAIL], marker::UNUSED);
    assert_eq!(map.read_u8(layout.persistent_page()), marker::PERSISTENT_DATA);
  }

  #[test]
  fn multi_chunk_links() {
    let (mut map, layout) = v2();
    let data = (0..300u32).map(|i| i as u8).collect::<Vec<_>>();
    write_file(&mut map, &layout, "big.bin", &data).unwrap();

    let arena = layout.arena(&map);
    let c = |i| arena.get(ChunkId::new(i).unwrap()).unwrap();
    assert_eq!((c(1).marker(), c(1).tail()), (marker::FILE_START, 2));
    assert_eq!((c(2).marker(), c(2).tail()), (1, 3));
    assert_eq!((c(3).marker(), c(3).tail()), (2, marker::UNUSED));
    assert_eq!(c(4).kind(), Kind::Unused);

    assert_eq!(read_file(&map, &layout, "big.bin").unwrap(), data);
  }

  #[test]
  fn round_trips() {
    for (mut map, layout) in vec![v1(), v2()] {
      let files = vec![
        ("one.py", vec![b'1'; 1]),
        ("exact.py", vec![b'e'; DATA_LEN - 2 - 8]),
        ("spill.py", vec![b's'; DATA_LEN - 2 - 8 + 1]),
        ("long.py", (0..3000u32).map(|i| (i % 97) as u8).collect()),
      ];
      for (name, data) in &files {
        write_file(&mut map, &layout, name, data).unwrap();
      }
      let read = read_files(&map, &layout).unwrap();
      let expected = files
        .iter()
        .map(|(n, d)| (n.to_string(), d.clone()))
        .collect::<Vec<_>>();
      assert_eq!(read, expected);
    }
  }

  #[test]
  fn reuses_freed_chunks() {
    let (mut map, layout) = v1();
    write_file(&mut map, &layout, "a.py", &[1; 200]).unwrap();
    write_file(&mut map, &layout, "b.py", &[2; 10]).unwrap();
    remove_file(&mut map, &layout, "a.py").unwrap();
    assert_eq!(map.read_u8(layout.start()), marker::FREED);
    assert_eq!(map.read_u8(layout.start() + 128), marker::FREED);

    let free = free_chunks(&map, &layout);
    assert_eq!(free.len(), 216 - 1);
    assert_eq!(free[0].get(), 1);

    // Spans chunk 1 and 2, skips 3 (b.py), and lands in 4.
    write_file(&mut map, &layout, "c.py", &[3; 300]).unwrap();
    assert_eq!(map.read_u8(layout.start() + 3 * 128), 2);
    assert_eq!(read_file(&map, &layout, "c.py").unwrap(), vec![3; 300]);
    assert_eq!(read_file(&map, &layout, "b.py").unwrap(), vec![2; 10]);
  }

  #[test]
  fn overwrites() {
    let (mut map, layout) = v2();
    write_file(&mut map, &layout, "main.py", b"first").unwrap();
    write_file(&mut map, &layout, "main.py", b"second").unwrap();
    let files = read_files(&map, &layout).unwrap();
    assert_eq!(files, vec![("main.py".to_string(), b"second".to_vec())]);
  }

  #[test]
  fn capacity() {
    let (mut map, layout) = v2();
    let count = layout.chunk_count();
    let name = "f.bin";
    let fill = vec![0xa5; count * DATA_LEN - 2 - name.len() - 1];
    let before = map.clone();

    let mut too_big = fill.clone();
    too_big.push(0);
    assert_eq!(
      write_file(&mut map, &layout, name, &too_big),
      Err(CapacityError::FileTooLarge { name: name.into() }.into())
    );
    assert_eq!(map, before);

    write_file(&mut map, &layout, name, &fill).unwrap();
    assert!(free_chunks(&map, &layout).is_empty());
    assert_eq!(
      write_file(&mut map, &layout, "x", b"x"),
      Err(CapacityError::NoSpace.into())
    );
  }

  #[test]
  fn bad_names() {
    let (mut map, layout) = v1();
    let long = "x".repeat(MAX_FILENAME_LEN + 1);
    assert!(matches!(
      write_file(&mut map, &layout, &long, b"data"),
      Err(crate::error::Error::Capacity(CapacityError::NameTooLong { .. }))
    ));
    write_file(&mut map, &layout, &"y".repeat(MAX_FILENAME_LEN), b"ok").unwrap();
    assert_eq!(
      write_file(&mut map, &layout, "empty", b""),
      Err(UsageError::MissingContent { name: "empty".into() }.into())
    );
  }

  #[test]
  fn integrity_failures() {
    let (mut map, layout) = v1();
    write_file(&mut map, &layout, "a.py", &[1; 200]).unwrap();
    let second = layout.start() + 128;

    let mut broken = map.clone();
    broken.put(second, &[7]).unwrap();
    assert_eq!(
      read_file(&broken, &layout, "a.py"),
      Err(IntegrityError::BrokenLink { chunk: 1, next: 2 }.into())
    );

    let mut dangling = map.clone();
    dangling.put(second, &[marker::FREED]).unwrap();
    assert_eq!(
      read_file(&dangling, &layout, "a.py"),
      Err(IntegrityError::Dangling { chunk: 1, next: 2 }.into())
    );

    let mut cycle = map.clone();
    cycle.put(second + TAIL as u32, &[2]).unwrap();
    cycle.put(second, &[2]).unwrap();
    cycle.put(layout.start() + TAIL as u32, &[2]).unwrap();
    // Every chunk links back to its one predecessor, so a loop always breaks
    // a back link.
    assert_eq!(
      read_file(&cycle, &layout, "a.py"),
      Err(IntegrityError::BrokenLink { chunk: 1, next: 2 }.into())
    );

    let mut duplicate = map.clone();
    let first = duplicate.slice_pad(layout.start(), CHUNK_LEN, 0xff);
    let mut copy = first.clone();
    copy[TAIL] = marker::UNUSED;
    duplicate.put(layout.start() + 10 * 128, &copy).unwrap();
    assert_eq!(
      read_files(&duplicate, &layout),
      Err(IntegrityError::DuplicateFile { name: "a.py".into() }.into())
    );
  }

  #[test]
  fn back_links_are_checked() {
    let (mut map, layout) = v1();
    write_file(&mut map, &layout, "a.py", &[1; 300]).unwrap();
    // Chunk 2 claims to follow itself.
    let second = layout.start() + 128;
    let mut bytes = map.slice_pad(second, CHUNK_LEN, 0xff);
    bytes[0] = 2;
    bytes[TAIL] = 2;
    map.put(second, &bytes).unwrap();
    assert_eq!(
      read_file(&map, &layout, "a.py"),
      Err(IntegrityError::BrokenLink { chunk: 1, next: 2 }.into())
    );
  }
}
