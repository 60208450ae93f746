//! The MicroPython block of the UICR customer area.
//!
//! First generation firmware (and some second generation builds) describe
//! their layout in the UICR, at a fixed address outside of flash:
//! ```text
//! 0x100010c0  magic          u32
//! 0x100010c4  end marker     u32
//! 0x100010c8  log2 page size u32
//! 0x100010cc  start page     u16
//! 0x100010ce  pages used     u16
//! 0x100010d0  delimiter      u32
//! 0x100010d4  version string u32, pointer to a NUL-terminated string
//! 0x100010d8  terminator     u32
//! ```

use crate::device::page_size;
use crate::device::DeviceMemInfo;
use crate::device::DeviceVersion;
use crate::error::LayoutError;
use crate::mem::MemoryMap;

const UICR_START: u32 = 0x1000_1000;
const CUSTOMER_OFFSET: u32 = 0x80;
const UPY_OFFSET: u32 = 0x40;

/// Start of the MicroPython data in the UICR.
pub const UPY_START: u32 = UICR_START + CUSTOMER_OFFSET + UPY_OFFSET;

/// Field addresses.
pub mod field {
  use super::UPY_START;

  /// Generation magic.
  pub const MAGIC: u32 = UPY_START;
  /// End marker.
  pub const END_MARKER: u32 = MAGIC + 4;
  /// Page size, as a power of two.
  pub const PAGE_SIZE_LOG2: u32 = END_MARKER + 4;
  /// First page of the runtime.
  pub const START_PAGE: u32 = PAGE_SIZE_LOG2 + 4;
  /// Pages taken by the runtime.
  pub const PAGES_USED: u32 = START_PAGE + 2;
  /// Delimiter.
  pub const DELIMITER: u32 = PAGES_USED + 2;
  /// Pointer to the version string.
  pub const VERSION: u32 = DELIMITER + 4;
  /// Regions terminator.
  pub const TERMINATOR: u32 = VERSION + 4;
  /// One past the block.
  pub const END: u32 = TERMINATOR + 4;
}

/// A device generation recognised by its UICR magic.
#[derive(Copy, Clone, Debug)]
pub struct Generation {
  /// The generation.
  pub version: DeviceVersion,
  /// Magic value stored at `field::MAGIC`.
  pub magic: u32,
  /// Total flash size.
  pub flash_size: u32,
  /// End of the file system region.
  pub fs_end: u32,
}

/// Known generations.
pub const GENERATIONS: [Generation; 2] = [
  Generation {
    version: DeviceVersion::V1,
    magic: 0x17ee_b07c,
    flash_size: 256 * 1024,
    fs_end: 256 * 1024,
  },
  Generation {
    version: DeviceVersion::V2,
    magic: 0x47ee_b07c,
    flash_size: 512 * 1024,
    fs_end: 0x73000,
  },
];

/// Finds the generation whose magic `map` carries.
pub fn generation(map: &MemoryMap) -> Option<Generation> {
  let magic = map.read_u32(field::MAGIC);
  GENERATIONS.iter().copied().find(|g| g.magic == magic)
}

/// Reads the layout from the UICR.
pub fn read(map: &MemoryMap) -> Result<DeviceMemInfo, LayoutError> {
  let gen = generation(map).ok_or(LayoutError::Uicr)?;

  let page = page_size(map.read_u32(field::PAGE_SIZE_LOG2))?;
  let start_page = map.read_u16(field::START_PAGE) as u64;
  let pages_used = map.read_u16(field::PAGES_USED) as u64;
  let flash_start = start_page * page as u64;
  let runtime_end = pages_used * page as u64;
  let flash_end = flash_start + gen.flash_size as u64;
  if flash_end > u32::MAX as u64 || runtime_end > u32::MAX as u64 {
    return Err(LayoutError::Inconsistent {
      runtime_end: runtime_end as u32,
      fs_start: runtime_end as u32,
      fs_end: gen.fs_end,
      flash_end: flash_end as u32,
    });
  }

  DeviceMemInfo {
    flash_page_size: page,
    flash_size: gen.flash_size,
    flash_start_address: flash_start as u32,
    flash_end_address: flash_end as u32,
    runtime_start_address: 0,
    runtime_end_address: runtime_end as u32,
    fs_start_address: runtime_end as u32,
    fs_end_address: gen.fs_end,
    firmware_version: map.read_cstr(map.read_u32(field::VERSION)),
    device_version: gen.version,
  }
  .validate()
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::fixture;

  #[test]
  fn field_layout() {
    assert_eq!(UPY_START, 0x1000_10c0);
    assert_eq!(field::START_PAGE, 0x1000_10cc);
    assert_eq!(field::VERSION, 0x1000_10d4);
    assert_eq!(field::END, 0x1000_10dc);
  }

  #[test]
  fn reads_v1() {
    let info = read(&fixture::v1_map()).unwrap();
    assert_eq!(
      info,
      DeviceMemInfo {
        flash_page_size: 1024,
        flash_size: 256 * 1024,
        flash_start_address: 0,
        flash_end_address: 256 * 1024,
        runtime_start_address: 0,
        runtime_end_address: fixture::V1_RUNTIME_END,
        fs_start_address: fixture::V1_RUNTIME_END,
        fs_end_address: 256 * 1024,
        firmware_version: fixture::V1_VERSION.to_string(),
        device_version: DeviceVersion::V1,
      }
    );
  }

  #[test]
  fn rejects_unknown_magic() {
    let mut map = fixture::v1_map();
    map.put(field::MAGIC, &0x1234_5678u32.to_le_bytes()).unwrap();
    assert_eq!(read(&map), Err(LayoutError::Uicr));
    assert_eq!(read(&fixture::v2_map()), Err(LayoutError::Uicr));
  }

  #[test]
  fn rejects_huge_pages() {
    let mut map = fixture::v1_map();
    map.put(field::PAGE_SIZE_LOG2, &40u32.to_le_bytes()).unwrap();
    assert_eq!(read(&map), Err(LayoutError::PageSize { log2: 40 }));
  }
}
