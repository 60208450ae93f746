//! The file system manager.
//!
//! A [`HexFs`] holds one or more clean MicroPython firmware images plus a set
//! of files. The files stay in memory, in the order they were first written,
//! until a hex is requested; each image then gets its own copy of the file
//! system.
//!
//! The part of each image below the file system never changes, so it is
//! serialized once, when the image is loaded.
//!
//! [`pack_main()`] covers the common case of flashing a single script: it
//! goes into the file system when the firmware has one, and into the
//! appended-script block otherwise.
//!
//! [`HexFs`]: struct.HexFs.html
//! [`pack_main()`]: fn.pack_main.html

use crate::appended;
use crate::config::ImportOptions;
use crate::config::Options;
use crate::device;
use crate::device::DeviceMemInfo;
use crate::error::CapacityError;
use crate::error::Error;
use crate::error::IntegrityError;
use crate::error::Result;
use crate::error::UsageError;
use crate::fs;
use crate::fs::chunk::CHUNK_LEN;
use crate::fs::Layout;
use crate::ihex;
use crate::ihex::Record;
use crate::mem::MemoryMap;
use crate::mem::ERASED;
use crate::universal;

type Files = Vec<(String, Vec<u8>)>;

/// A loaded firmware image.
#[derive(Clone, Debug)]
struct Image {
  board_id: Option<u16>,
  map: MemoryMap,
  info: DeviceMemInfo,
  layout: Layout,
  /// Hex text for everything below the file system, without the EOF record.
  prefix: String,
}

impl Image {
  fn load(hex: &str, board_id: Option<u16>) -> Result<Self> {
    if hex.trim().is_empty() {
      return Err(UsageError::InvalidHex.into());
    }
    let map = ihex::parse(hex)?;
    let info = device::locate(&map)?;
    let layout = Layout::new(&map, &info)?;
    if !fs::read_files(&map, &layout)?.is_empty() {
      return Err(UsageError::FilesInInput.into());
    }

    let text = ihex::serialize(&map.slice(0, layout.start() as u64));
    let eof = format!("{}\n", Record::eof().to_line());
    let prefix = text.strip_suffix(eof.as_str()).unwrap_or(&text).to_string();

    tracing::debug!(
      board_id = ?board_id,
      version = %info.firmware_version,
      fs_size = layout.size(),
      "loaded firmware image"
    );
    Ok(Self {
      board_id,
      map,
      info,
      layout,
      prefix,
    })
  }

  /// The file system part of the image, with `files` written into it.
  fn fs_map(&self, files: &[(String, Vec<u8>)]) -> Result<MemoryMap> {
    let mut map = self.map.slice_from(self.layout.start());
    for (name, data) in files {
      fs::write_file(&mut map, &self.layout, name, data)?;
    }
    Ok(map)
  }

  /// The whole image, with `files` written into it.
  fn full_map(&self, files: &[(String, Vec<u8>)]) -> Result<MemoryMap> {
    let mut map = self.map.clone();
    for (addr, data) in self.fs_map(files)?.iter() {
      map.put(addr, data)?;
    }
    Ok(map)
  }
}

/// Reads the files out of a single firmware hex.
fn read_hex_files(hex: &str) -> Result<Files> {
  let map = ihex::parse(hex)?;
  let info = device::locate(&map)?;
  let layout = Layout::new(&map, &info)?;
  fs::read_files(&map, &layout)
}

fn stored_size(name: &str, data: &[u8]) -> u32 {
  (fs::chunks_needed(name, data.len()) * CHUNK_LEN) as u32
}

fn used(files: &[(String, Vec<u8>)]) -> u32 {
  files.iter().map(|(n, d)| stored_size(n, d)).sum()
}

/// Manages the files of one or more MicroPython firmware images.
#[derive(Clone, Debug)]
pub struct HexFs {
  images: Vec<Image>,
  files: Files,
  storage_size: u32,
}

impl HexFs {
  /// Creates a manager for a single firmware hex.
  ///
  /// The hex must not contain any files.
  pub fn new(hex: &str, options: Options) -> Result<Self> {
    Self::from_images(vec![Image::load(hex, None)?], options)
  }

  /// Creates a manager for several firmware hexes, each identified by the
  /// board id it targets.
  pub fn with_images<S: AsRef<str>>(
    images: &[(u16, S)],
    options: Options,
  ) -> Result<Self> {
    let mut loaded: Vec<Image> = Vec::with_capacity(images.len());
    for (board_id, hex) in images {
      if loaded.iter().any(|i| i.board_id == Some(*board_id)) {
        return Err(
          UsageError::DuplicateBoard {
            board_id: *board_id,
          }
          .into(),
        );
      }
      loaded.push(Image::load(hex.as_ref(), Some(*board_id))?);
    }
    if loaded.is_empty() {
      return Err(UsageError::InvalidHex.into());
    }
    Self::from_images(loaded, options)
  }

  fn from_images(images: Vec<Image>, options: Options) -> Result<Self> {
    let mut fs = Self {
      images,
      files: Vec::new(),
      storage_size: 0,
    };
    fs.storage_size = fs.natural_size();
    if let Some(size) = options.max_fs_size {
      fs.set_storage_size(size)?;
    }
    Ok(fs)
  }

  /// The smallest file system among the images.
  fn natural_size(&self) -> u32 {
    self
      .images
      .iter()
      .map(|i| i.layout.size())
      .min()
      .unwrap_or(0)
  }

  /// The board ids of the images, in construction order.
  pub fn board_ids(&self) -> Vec<Option<u16>> {
    self.images.iter().map(|i| i.board_id).collect()
  }

  fn position(&self, name: &str) -> Option<usize> {
    self.files.iter().position(|(n, _)| n == name)
  }

  /// Finds an existing file, validating the name first.
  fn require(&self, name: &str) -> Result<usize> {
    fs::validate_name(name)?;
    match self.position(name) {
      Some(i) => Ok(i),
      None => Err(
        UsageError::FileNotFound {
          name: name.to_string(),
        }
        .into(),
      ),
    }
  }

  /// Stores a file, replacing any file with the same name.
  ///
  /// Fails without changing anything if the file alone is bigger than the
  /// file system. Files that only fail to fit together are accepted; the
  /// hex exports then fail with `CapacityError::NoSpace` until enough is
  /// removed.
  pub fn write(&mut self, name: &str, content: impl AsRef<[u8]>) -> Result<()> {
    let data = content.as_ref();
    let size = fs::file_size(name, data)?;
    if data.is_empty() {
      return Err(
        UsageError::MissingContent {
          name: name.to_string(),
        }
        .into(),
      );
    }

    if size > self.storage_size {
      return Err(
        CapacityError::FileTooLarge {
          name: name.to_string(),
        }
        .into(),
      );
    }

    match self.position(name) {
      Some(i) => self.files[i].1 = data.to_vec(),
      None => self.files.push((name.to_string(), data.to_vec())),
    }
    tracing::debug!(file = name, len = data.len(), "stored file");
    if self.storage_used() > self.storage_size {
      tracing::debug!(
        used = self.storage_used(),
        size = self.storage_size,
        "files no longer fit"
      );
    }
    Ok(())
  }

  /// Like `write()`, but fails if the file already exists.
  pub fn create(&mut self, name: &str, content: impl AsRef<[u8]>) -> Result<()> {
    fs::validate_name(name)?;
    if self.exists(name) {
      return Err(
        UsageError::FileExists {
          name: name.to_string(),
        }
        .into(),
      );
    }
    self.write(name, content)
  }

  /// Appending is not supported; this only reports why the call failed.
  pub fn append(&mut self, name: &str, _content: &str) -> Result<()> {
    self.require(name)?;
    Err(UsageError::AppendUnsupported.into())
  }

  /// Reads a file as text. Invalid UTF-8 is replaced.
  pub fn read(&self, name: &str) -> Result<String> {
    let i = self.require(name)?;
    Ok(String::from_utf8_lossy(&self.files[i].1).into_owned())
  }

  /// Reads a file's bytes.
  pub fn read_bytes(&self, name: &str) -> Result<&[u8]> {
    let i = self.require(name)?;
    Ok(&self.files[i].1)
  }

  /// Deletes a file.
  pub fn remove(&mut self, name: &str) -> Result<()> {
    let i = self.require(name)?;
    self.files.remove(i);
    tracing::debug!(file = name, "removed file");
    Ok(())
  }

  /// Returns true if the file exists.
  pub fn exists(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// Flash the file takes up, in whole chunks.
  pub fn size(&self, name: &str) -> Result<u32> {
    let i = self.require(name)?;
    Ok(stored_size(name, &self.files[i].1))
  }

  /// Lists the files, in the order they were first written.
  pub fn ls(&self) -> Vec<&str> {
    self.files.iter().map(|(n, _)| n.as_str()).collect()
  }

  /// Size of the file system, either as provided by the firmware or as
  /// limited by `set_storage_size()`.
  pub fn storage_size(&self) -> u32 {
    self.storage_size
  }

  /// Bytes taken up by the files.
  pub fn storage_used(&self) -> u32 {
    used(&self.files)
  }

  /// Bytes still free.
  pub fn storage_remaining(&self) -> u32 {
    self.storage_size.saturating_sub(self.storage_used())
  }

  /// Limits the file system size. The limit cannot exceed what every image
  /// provides.
  pub fn set_storage_size(&mut self, size: u32) -> Result<()> {
    let available = self.natural_size();
    if size > available {
      return Err(
        CapacityError::StorageLimit {
          requested: size,
          available,
        }
        .into(),
      );
    }
    self.storage_size = size;
    Ok(())
  }

  fn select(&self, board_id: Option<u16>) -> Result<&Image> {
    match board_id {
      None if self.images.len() == 1 => Ok(&self.images[0]),
      None => Err(UsageError::BoardIdRequired.into()),
      Some(id) => self
        .images
        .iter()
        .find(|i| i.board_id == Some(id))
        .ok_or_else(|| UsageError::UnknownBoard { board_id: id }.into()),
    }
  }

  fn check_capacity(&self) -> Result<()> {
    if self.storage_used() > self.storage_size {
      return Err(CapacityError::NoSpace.into());
    }
    Ok(())
  }

  /// Generates the Intel hex of an image with the files included.
  ///
  /// `board_id` may only be omitted if there is a single image.
  pub fn intel_hex(&self, board_id: Option<u16>) -> Result<String> {
    let image = self.select(board_id)?;
    self.check_capacity()?;
    let fs_map = image.fs_map(&self.files)?;
    tracing::debug!(
      board_id = ?image.board_id,
      files = self.files.len(),
      "generated intel hex"
    );
    Ok(format!("{}{}", image.prefix, ihex::serialize(&fs_map)))
  }

  /// Like `intel_hex()`, with `line_size` data bytes per record.
  pub fn intel_hex_with(
    &self,
    board_id: Option<u16>,
    line_size: usize,
  ) -> Result<String> {
    let image = self.select(board_id)?;
    self.check_capacity()?;
    let map = image.full_map(&self.files)?;
    Ok(ihex::serialize_with(&map, line_size)?)
  }

  /// Generates the flash contents of an image with the files included, with
  /// unused bytes set to `0xff`.
  pub fn intel_hex_bytes(&self, board_id: Option<u16>) -> Result<Vec<u8>> {
    let image = self.select(board_id)?;
    self.check_capacity()?;
    let map = image.full_map(&self.files)?;
    Ok(map.slice_pad(0, image.info.flash_size as usize, ERASED))
  }

  /// Generates a universal hex out of every image, each with the files
  /// included.
  pub fn universal_hex(&self) -> Result<String> {
    if self.images.len() < 2 {
      return Err(UsageError::TooFewImages.into());
    }
    let mut hexes = Vec::with_capacity(self.images.len());
    for image in &self.images {
      let board_id = image.board_id.ok_or(UsageError::BoardIdRequired)?;
      hexes.push((board_id, self.intel_hex(Some(board_id))?));
    }
    universal::create(&hexes)
  }

  /// Adds the files stored in a firmware Intel hex.
  ///
  /// Nothing changes unless every file can be imported. Returns the imported
  /// names.
  pub fn import_files_from_intel_hex(
    &mut self,
    hex: &str,
    options: ImportOptions,
  ) -> Result<Vec<String>> {
    let files = read_hex_files(hex)?;
    self.import(files, options)
  }

  /// Adds the files stored in a universal hex. Every image in it must hold
  /// the same files.
  pub fn import_files_from_universal_hex(
    &mut self,
    universal: &str,
    options: ImportOptions,
  ) -> Result<Vec<String>> {
    let mut first: Option<(Files, Files)> = None;
    for (board_id, hex) in universal::separate(universal)? {
      let files = read_hex_files(&hex)?;
      let mut sorted = files.clone();
      sorted.sort();
      if let Some((reference, _)) = &first {
        if *reference != sorted {
          tracing::debug!(board_id, "image holds different files");
          return Err(IntegrityError::Divergent.into());
        }
      } else {
        first = Some((sorted, files));
      }
    }
    let (_, files) = first.ok_or(UsageError::NotUniversal)?;
    self.import(files, options)
  }

  /// Imports from either an Intel hex or a universal hex.
  pub fn import_files_from_hex(
    &mut self,
    hex: &str,
    options: ImportOptions,
  ) -> Result<Vec<String>> {
    if universal::is_universal(hex) {
      self.import_files_from_universal_hex(hex, options)
    } else {
      self.import_files_from_intel_hex(hex, options)
    }
  }

  fn import(&mut self, files: Files, options: ImportOptions) -> Result<Vec<String>> {
    if files.is_empty() {
      return Err(UsageError::NothingToImport.into());
    }

    let mut next = if options.format_first {
      Vec::new()
    } else {
      self.files.clone()
    };
    let mut names = Vec::with_capacity(files.len());
    for (name, data) in files {
      match next.iter().position(|(n, _)| *n == name) {
        Some(_) if !options.overwrite => {
          return Err(UsageError::FileExists { name }.into())
        }
        Some(i) => next[i].1 = data,
        None => next.push((name.clone(), data)),
      }
      names.push(name);
    }
    if used(&next) > self.storage_size {
      return Err(CapacityError::NoSpace.into());
    }

    tracing::debug!(files = names.len(), "imported files");
    self.files = next;
    Ok(names)
  }
}

/// The name a script is stored under.
pub const MAIN_PY: &str = "main.py";

/// Where [`pack_main()`] put a script.
///
/// [`pack_main()`]: fn.pack_main.html
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Packing {
  /// Written to the file system as `main.py`.
  FileSystem,
  /// Stored in the appended-script block.
  Appended,
}

/// Drops a leading byte order mark, converts line endings to `\n`, and ends
/// the script with a newline.
pub fn normalize_script(script: &str) -> String {
  let script = script.strip_prefix('\u{feff}').unwrap_or(script);
  let mut out = script.replace("\r\n", "\n").replace('\r', "\n");
  if !out.ends_with('\n') {
    out.push('\n');
  }
  out
}

/// Stores `script` as `main.py` in a clean firmware hex.
///
/// Firmware whose file system cannot be located, or is too small for the
/// script, gets the script in the appended-script block instead. Any other
/// error is returned as is.
pub fn pack_main(hex: &str, script: &str) -> Result<(Packing, String)> {
  let script = normalize_script(script);
  let packed = HexFs::new(hex, Options::default()).and_then(|mut fs| {
    fs.write(MAIN_PY, &script)?;
    fs.intel_hex(None)
  });
  match packed {
    Ok(hex) => Ok((Packing::FileSystem, hex)),
    Err(e @ Error::Layout(_)) | Err(e @ Error::Capacity(_)) => {
      tracing::debug!(error = %e, "appending script instead");
      Ok((Packing::Appended, appended::encode(hex, &script)?))
    }
    Err(e) => Err(e),
  }
}
