//! Discovery of a firmware image's flash layout.
//!
//! MicroPython firmware records where its runtime ends and where the file
//! system lives, but different device generations record it differently.
//! [`locate()`] tries each known format in turn:
//! - [`uicr`]: a magic value and page counts in the UICR customer area.
//! - [`regions`]: a table of flash regions at the end of the runtime.
//!
//! [`locate()`]: fn.locate.html
//! [`uicr`]: uicr/index.html
//! [`regions`]: regions/index.html

use serde::Serialize;

use crate::error::LayoutError;
use crate::mem::MemoryMap;

pub mod regions;
pub mod uicr;

/// The hardware generation a firmware image targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceVersion {
  /// 256KB flash, 1KB pages.
  V1,
  /// 512KB flash, 4KB pages.
  V2,
}

/// The flash layout of a firmware image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMemInfo {
  /// Size of an erasable flash page.
  pub flash_page_size: u32,
  /// Total flash size.
  pub flash_size: u32,
  /// First flash address.
  pub flash_start_address: u32,
  /// One past the last flash address.
  pub flash_end_address: u32,
  /// Start of the MicroPython runtime; always zero.
  pub runtime_start_address: u32,
  /// One past the end of the runtime, including any layout metadata.
  pub runtime_end_address: u32,
  /// Start of the file system region.
  pub fs_start_address: u32,
  /// One past the end of the file system region.
  pub fs_end_address: u32,
  /// The firmware's version string.
  #[serde(rename = "uPyVersion")]
  pub firmware_version: String,
  /// The targeted hardware generation.
  pub device_version: DeviceVersion,
}

impl DeviceMemInfo {
  /// Checks that the regions are ordered runtime, file system, end of flash.
  pub fn validate(self) -> Result<Self, LayoutError> {
    let ordered = self.runtime_end_address <= self.fs_start_address
      && self.fs_start_address <= self.fs_end_address
      && self.fs_end_address <= self.flash_end_address;
    if !ordered {
      return Err(LayoutError::Inconsistent {
        runtime_end: self.runtime_end_address,
        fs_start: self.fs_start_address,
        fs_end: self.fs_end_address,
        flash_end: self.flash_end_address,
      });
    }
    Ok(self)
  }
}

/// A way of reading the layout out of a memory image.
pub type Strategy = fn(&MemoryMap) -> Result<DeviceMemInfo, LayoutError>;

/// Every known strategy, in the order they are tried.
pub const STRATEGIES: &[(&str, Strategy)] =
  &[("uicr", uicr::read), ("flash regions table", regions::read)];

/// Computes `2^log2` as a page size.
pub(crate) fn page_size(log2: u32) -> Result<u32, LayoutError> {
  if log2 >= 32 {
    return Err(LayoutError::PageSize { log2 });
  }
  Ok(1 << log2)
}

/// Determines the flash layout of `map`.
///
/// The first strategy to succeed wins. If none does, the error lists each
/// strategy's failure.
pub fn locate(map: &MemoryMap) -> Result<DeviceMemInfo, LayoutError> {
  let mut failures = Vec::new();
  for &(name, strategy) in STRATEGIES {
    match strategy(map) {
      Ok(info) => {
        tracing::debug!(
          strategy = name,
          version = ?info.device_version,
          fs_start = info.fs_start_address,
          fs_end = info.fs_end_address,
          "located flash layout"
        );
        return Ok(info);
      }
      Err(e) => {
        tracing::debug!(strategy = name, error = %e, "layout strategy failed");
        failures.push(e);
      }
    }
  }
  Err(LayoutError::NotFound(failures))
}

#[cfg(test)]
mod test {
  use super::*;

  use std::collections::BTreeMap;

  use serde::de::IgnoredAny;

  use crate::fixture;

  #[test]
  fn locates_both_generations() {
    let v1 = locate(&fixture::v1_map()).unwrap();
    let v2 = locate(&fixture::v2_map()).unwrap();
    assert_eq!(v1.device_version, DeviceVersion::V1);
    assert_eq!(v2.device_version, DeviceVersion::V2);
    assert_eq!(v1.runtime_start_address, 0);
    assert_eq!(v2.runtime_start_address, 0);
    assert_ne!(v1.fs_start_address, v2.fs_start_address);

    let keys = |info: &DeviceMemInfo| {
      let text = json5::to_string(info).unwrap();
      let fields: BTreeMap<String, IgnoredAny> = json5::from_str(&text).unwrap();
      fields.into_iter().map(|(k, _)| k).collect::<Vec<_>>()
    };
    assert_eq!(keys(&v1), keys(&v2));
  }

  #[test]
  fn nothing_found() {
    let mut map = MemoryMap::new();
    map.put(0, &[0u8; 64]).unwrap();
    let err = locate(&map).unwrap_err();
    assert_eq!(
      err.to_string(),
      "Could not find valid MicroPython UICR data.\n\
       Could not find a valid MicroPython flash regions table."
    );
  }

  #[test]
  fn inconsistent_layouts() {
    let mut info = locate(&fixture::v1_map()).unwrap();
    info.fs_start_address = info.runtime_end_address - 1;
    assert!(matches!(
      info.validate(),
      Err(LayoutError::Inconsistent { .. })
    ));
  }
}
