//! Synthetic firmware images for tests.
//!
//! Neither image contains a real runtime, only the bytes that the layout
//! readers look at plus some filler around them.

use crate::device::regions;
use crate::device::uicr;
use crate::ihex;
use crate::mem::MemoryMap;

pub const V1_VERSION: &str = "micro:bit v1.0.1+b0bf4a9 on 2018-12-13; \
                              MicroPython v1.9.2-34-gd64154c73 on 2017-09-01";
pub const V1_RUNTIME_END: u32 = 227 * 1024;
pub const V1_FS_SIZE: u32 = 27 * 1024;

pub const V2_VERSION: &str = "micro:bit v2.0.0-beta.3+e8b3dd6 on 2020-11-25; \
                              MicroPython v1.13 on 2020-11-25";
pub const V2_RUNTIME_END: u32 = 0x6d000;
pub const V2_FS_START: u32 = 0x6d000;
pub const V2_FS_END: u32 = 0x73000;
pub const V2_FS_SIZE: u32 = 20 * 1024;

fn runtime(map: &mut MemoryMap, end: u32, version_at: u32, version: &str) {
  let filler = (0..0x800u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
  map.put(0, &filler).unwrap();

  let mut version = version.as_bytes().to_vec();
  version.push(0);
  map.put(version_at, &version).unwrap();

  map.put(end - 32, &[0x5a; 32]).unwrap();
}

pub fn v1_map() -> MemoryMap {
  let mut map = MemoryMap::new();
  runtime(&mut map, V1_RUNTIME_END, 0x1000, V1_VERSION);

  let mut block = Vec::new();
  block.extend_from_slice(&uicr::GENERATIONS[0].magic.to_le_bytes());
  block.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
  block.extend_from_slice(&10u32.to_le_bytes());
  block.extend_from_slice(&0u16.to_le_bytes());
  block.extend_from_slice(&((V1_RUNTIME_END / 1024) as u16).to_le_bytes());
  block.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
  block.extend_from_slice(&0x1000u32.to_le_bytes());
  block.extend_from_slice(&0u32.to_le_bytes());
  map.put(uicr::UPY_START, &block).unwrap();
  map
}

fn row(id: u8, hash_type: u8, start_page: u16, len: u32, hash: u64) -> Vec<u8> {
  let mut row = vec![id, hash_type];
  row.extend_from_slice(&start_page.to_le_bytes());
  row.extend_from_slice(&len.to_le_bytes());
  row.extend_from_slice(&hash.to_le_bytes());
  row
}

pub fn v2_map() -> MemoryMap {
  let mut map = MemoryMap::new();
  runtime(&mut map, V2_RUNTIME_END - 64, 0x2000, V2_VERSION);

  let mut table = Vec::new();
  table.extend(row(1, 0, 0, 0x1c000, 0));
  table.extend(row(2, 2, 0x1c, V2_RUNTIME_END - 0x1c000, 0x2000));
  table.extend(row(3, 0, (V2_FS_START / 4096) as u16, V2_FS_END - V2_FS_START, 0));
  table.extend_from_slice(&regions::MAGIC_1.to_le_bytes());
  table.extend_from_slice(&1u16.to_le_bytes());
  table.extend_from_slice(&48u16.to_le_bytes());
  table.extend_from_slice(&3u16.to_le_bytes());
  table.extend_from_slice(&12u16.to_le_bytes());
  table.extend_from_slice(&regions::MAGIC_2.to_le_bytes());
  map.put(V2_RUNTIME_END - table.len() as u32, &table).unwrap();
  map
}

pub fn v1_hex() -> String {
  ihex::serialize(&v1_map())
}

pub fn v2_hex() -> String {
  ihex::serialize(&v2_map())
}
