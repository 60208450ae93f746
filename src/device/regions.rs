//! The flash regions table.
//!
//! Newer firmware places a table at the end of the last page used by the
//! runtime. The table is read backwards from the end of that page: a 16-byte
//! header, then one 16-byte row per region.
//! ```text
//!        row n-1 .. row 0 | magic1 | version | len | count | log2 | magic2 |
//!                         ^-- end - 16                        page end --^
//! ```
//! Each row, from its start, holds an id (u8), a hash type (u8), a start page
//! (u16), a length in bytes (u32) and eight bytes of hash data.

use crate::device::page_size;
use crate::device::DeviceMemInfo;
use crate::device::DeviceVersion;
use crate::error::LayoutError;
use crate::mem::MemoryMap;
use crate::mem::ERASED;

/// First header magic, 16 bytes before the end of the table.
pub const MAGIC_1: u32 = 0x597f_30fe;
/// Second header magic, in the last 4 bytes of the table.
pub const MAGIC_2: u32 = 0xc1b1_d79d;

/// The page size used to look for the table.
pub const SCAN_PAGE_SIZE: u32 = 4096;

/// Length of the header, and of each row.
pub const ROW_LEN: u32 = 16;

const FLASH_SIZE: u32 = 512 * 1024;

/// Well-known region ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionId {
  /// The radio/bluetooth stack.
  SoftDevice = 1,
  /// The MicroPython runtime.
  MicroPython = 2,
  /// The file system.
  Fs = 3,
}

/// How a row's hash data is to be interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashType {
  /// No hash.
  Empty,
  /// The hash is inline.
  Data,
  /// The low 32 bits point to a NUL-terminated string.
  Pointer,
  /// Anything else.
  Unknown(u8),
}

impl From<u8> for HashType {
  fn from(byte: u8) -> Self {
    match byte {
      0 => Self::Empty,
      1 => Self::Data,
      2 => Self::Pointer,
      b => Self::Unknown(b),
    }
  }
}

/// The table header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
  /// Table format version.
  pub version: u16,
  /// Table length in bytes.
  pub table_len: u16,
  /// Number of rows.
  pub region_count: u16,
  /// Flash page size.
  pub page_size: u32,
  /// One past the header, i.e., the end of the page holding it.
  pub end: u32,
  /// Start of the header; rows end here.
  pub start: u32,
}

/// One table row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
  /// Region id, see `RegionId`.
  pub id: u8,
  /// Hash interpretation.
  pub hash_type: HashType,
  /// First page of the region.
  pub start_page: u16,
  /// Length in bytes.
  pub len: u32,
  /// Raw hash data.
  pub hash_data: u64,
  /// The string pointed to, for pointer hashes.
  pub hash_string: Option<String>,
}

/// Finds the table header, scanning `scan_page`-sized pages.
pub fn find_header(map: &MemoryMap, scan_page: u32) -> Option<Header> {
  let found = map.pages(scan_page).into_iter().find(|&page| {
    let bytes = map.slice_pad(page, scan_page as usize, ERASED);
    let n = bytes.len();
    n >= ROW_LEN as usize
      && bytes[n - 4..] == MAGIC_2.to_le_bytes()
      && bytes[n - 16..n - 12] == MAGIC_1.to_le_bytes()
  })?;

  let end = found.checked_add(scan_page)?;
  let log2 = map.read_u16(end - 6) as u32;
  Some(Header {
    version: map.read_u16(end - 12),
    table_len: map.read_u16(end - 10),
    region_count: map.read_u16(end - 8),
    page_size: page_size(log2).ok()?,
    end,
    start: end - ROW_LEN,
  })
}

/// Reads the row that ends at `row_end`.
pub fn read_row(map: &MemoryMap, row_end: u32) -> Region {
  let start = row_end - ROW_LEN;
  let hash_type = HashType::from(map.read_u8(start + 1));
  let hash_data = map.read_u64(start + 8);
  let hash_string = match hash_type {
    HashType::Pointer => Some(map.read_cstr(hash_data as u32)),
    _ => None,
  };
  Region {
    id: map.read_u8(start),
    hash_type,
    start_page: map.read_u16(start + 2),
    len: map.read_u32(start + 4),
    hash_data,
    hash_string,
  }
}

/// Reads every row of the table described by `header`.
pub fn read_rows(map: &MemoryMap, header: &Header) -> Vec<Region> {
  (0..header.region_count as u32)
    .map_while(|i| header.start.checked_sub(i * ROW_LEN))
    .filter(|&row_end| row_end >= ROW_LEN)
    .map(|row_end| read_row(map, row_end))
    .collect()
}

/// Reads the layout from the flash regions table.
pub fn read(map: &MemoryMap) -> Result<DeviceMemInfo, LayoutError> {
  let header =
    find_header(map, SCAN_PAGE_SIZE).ok_or(LayoutError::RegionsTable)?;
  let rows = read_rows(map, &header);
  let row = |id: RegionId| rows.iter().rev().find(|r| r.id == id as u8);

  let runtime = row(RegionId::MicroPython).ok_or(LayoutError::RuntimeRegion)?;
  let fs = row(RegionId::Fs).ok_or(LayoutError::FsRegion)?;

  let fs_start = fs.start_page as u64 * header.page_size as u64;
  let fs_end = fs_start + fs.len as u64;
  if fs_end > u32::MAX as u64 {
    return Err(LayoutError::Inconsistent {
      runtime_end: header.end,
      fs_start: fs_start as u32,
      fs_end: fs_end as u32,
      flash_end: FLASH_SIZE,
    });
  }

  // The runtime ends with the page holding the table.
  DeviceMemInfo {
    flash_page_size: header.page_size,
    flash_size: FLASH_SIZE,
    flash_start_address: 0,
    flash_end_address: FLASH_SIZE,
    runtime_start_address: 0,
    runtime_end_address: header.end,
    fs_start_address: fs_start as u32,
    fs_end_address: fs_end as u32,
    firmware_version: runtime.hash_string.clone().unwrap_or_default(),
    device_version: DeviceVersion::V2,
  }
  .validate()
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::fixture;

  #[test]
  fn finds_header() {
    let header = find_header(&fixture::v2_map(), SCAN_PAGE_SIZE).unwrap();
    assert_eq!(header.end, fixture::V2_RUNTIME_END);
    assert_eq!(header.start, fixture::V2_RUNTIME_END - 16);
    assert_eq!(header.page_size, 4096);
    assert_eq!(header.region_count, 3);
    assert_eq!(header.table_len, 48);
  }

  #[test]
  fn reads_rows() {
    let map = fixture::v2_map();
    let header = find_header(&map, SCAN_PAGE_SIZE).unwrap();
    let rows = read_rows(&map, &header);
    let ids = rows.iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(rows[1].hash_type, HashType::Pointer);
    assert_eq!(rows[1].hash_string.as_deref(), Some(fixture::V2_VERSION));
    assert_eq!(rows[0].hash_string, None);
  }

  #[test]
  fn reads_v2() {
    let info = read(&fixture::v2_map()).unwrap();
    assert_eq!(
      info,
      DeviceMemInfo {
        flash_page_size: 4096,
        flash_size: 512 * 1024,
        flash_start_address: 0,
        flash_end_address: 512 * 1024,
        runtime_start_address: 0,
        runtime_end_address: fixture::V2_RUNTIME_END,
        fs_start_address: fixture::V2_FS_START,
        fs_end_address: fixture::V2_FS_END,
        firmware_version: fixture::V2_VERSION.to_string(),
        device_version: DeviceVersion::V2,
      }
    );
  }

  #[test]
  fn missing_rows() {
    let mut map = fixture::v2_map();
    let header = find_header(&map, SCAN_PAGE_SIZE).unwrap();
    // Row 0 is the file system row.
    map.put(header.start - ROW_LEN, &[0x7f]).unwrap();
    assert_eq!(read(&map), Err(LayoutError::FsRegion));

    map.put(header.start - 2 * ROW_LEN, &[0x7f]).unwrap();
    assert_eq!(read(&map), Err(LayoutError::RuntimeRegion));

    assert_eq!(read(&fixture::v1_map()), Err(LayoutError::RegionsTable));
  }
}
