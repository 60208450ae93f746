//! Options for the manager, and build manifests for the command line tool.
//!
//! Everything here is plain serde data, read from JSON5 text with camelCase
//! keys. A manifest looks like
//! ```text
//! {
//!   firmware: [
//!     { hex: "v1.hex", boardId: 0x9900 },
//!     { hex: "v2.hex", boardId: 0x9903 },
//!   ],
//!   files: [{ name: "main.py", path: "src/main.py" }],
//!   maxFsSize: 20480,
//! }
//! ```

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Options for constructing a [`HexFs`].
///
/// [`HexFs`]: ../manager/struct.HexFs.html
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
  /// Caps the file system size below what the firmware provides.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_fs_size: Option<u32>,
}

/// Options for importing files out of another hex.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportOptions {
  /// Replace files that already exist, instead of failing.
  pub overwrite: bool,
  /// Remove every existing file first, once the input has been read.
  pub format_first: bool,
}

/// A description of a hex to build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Manifest {
  /// Firmware images. More than one produces a universal hex.
  pub firmware: Vec<Firmware>,
  /// Files to store in every image.
  pub files: Vec<File>,
  /// See `Options::max_fs_size`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_fs_size: Option<u32>,
  /// Data bytes per record in the output.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub line_size: Option<usize>,
}

/// A firmware image in a [`Manifest`].
///
/// [`Manifest`]: struct.Manifest.html
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
  /// Path to the firmware's Intel hex.
  pub hex: PathBuf,
  /// The board the firmware is for. Required with several images.
  #[serde(default)]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub board_id: Option<u16>,
}

/// A file in a [`Manifest`].
///
/// [`Manifest`]: struct.Manifest.html
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct File {
  /// Name in the device file system. Defaults to the file name of `path`.
  #[serde(default)]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  /// Host path to read the contents from.
  pub path: PathBuf,
}

impl File {
  /// The name the file is stored under.
  pub fn device_name(&self) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => self
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default(),
    }
  }
}

impl Manifest {
  /// The options implied by this manifest.
  pub fn options(&self) -> Options {
    Options {
      max_fs_size: self.max_fs_size,
    }
  }
}

/// Parses JSON5 text into any of the types in this module.
pub fn from_json5<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, json5::Error> {
  json5::from_str(text)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn options() {
    let o: Options = from_json5("{ maxFsSize: 1024 }").unwrap();
    assert_eq!(o.max_fs_size, Some(1024));
    let o: Options = from_json5("{}").unwrap();
    assert_eq!(o, Options::default());

    let i: ImportOptions = from_json5("{ formatFirst: true }").unwrap();
    assert!(i.format_first);
    assert!(!i.overwrite);
  }

  #[test]
  fn manifest() {
    let m: Manifest = from_json5(
      r#"{
        // Both generations.
        firmware: [
          { hex: "v1.hex", boardId: 0x9900 },
          { hex: "v2.hex", boardId: 39171 },
        ],
        files: [
          { path: "src/main.py" },
          { name: "lib.py", path: "vendored/helper.py" },
        ],
        lineSize: 32,
      }"#,
    )
    .unwrap();

    assert_eq!(m.firmware.len(), 2);
    assert_eq!(m.firmware[0].board_id, Some(0x9900));
    assert_eq!(m.firmware[1].board_id, Some(0x9903));
    assert_eq!(m.files[0].device_name(), "main.py");
    assert_eq!(m.files[1].device_name(), "lib.py");
    assert_eq!(m.line_size, Some(32));
    assert_eq!(m.options(), Options::default());
  }

  #[test]
  fn missing_path() {
    assert!(from_json5::<Manifest>("{ files: [{ name: \"a.py\" }] }").is_err());
  }
}
