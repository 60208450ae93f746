//! Error types and error printing facilities.
//!
//! Every fallible operation in this crate returns an [`Error`], which sorts
//! failures into five categories:
//! - [`FormatError`]: the input is not a well-formed Intel HEX image.
//! - [`LayoutError`]: the firmware's flash layout could not be determined.
//! - [`CapacityError`]: something does not fit.
//! - [`IntegrityError`]: the stored file system is corrupt.
//! - [`UsageError`]: the caller asked for something invalid.
//!
//! None of these are recovered from internally; they are surfaced as-is.
//!
//! [`Error`]: enum.Error.html
//! [`FormatError`]: enum.FormatError.html
//! [`LayoutError`]: enum.LayoutError.html
//! [`CapacityError`]: enum.CapacityError.html
//! [`IntegrityError`]: enum.IntegrityError.html
//! [`UsageError`]: enum.UsageError.html

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// A `Result` whose error type is this crate's [`Error`].
///
/// [`Error`]: enum.Error.html
pub type Result<T> = std::result::Result<T, Error>;

/// Any error produced by this crate.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
  /// Malformed hex text or an invalid memory image.
  #[error(transparent)]
  Format(#[from] FormatError),
  /// The device's flash layout could not be determined.
  #[error(transparent)]
  Layout(#[from] LayoutError),
  /// Storage exhausted, or a limit exceeded.
  #[error(transparent)]
  Capacity(#[from] CapacityError),
  /// A corrupted file system region.
  #[error(transparent)]
  Integrity(#[from] IntegrityError),
  /// Invalid use of the API.
  #[error(transparent)]
  Usage(#[from] UsageError),
}

/// Errors in Intel HEX text, or in a memory image built from it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FormatError {
  /// Some text between two records could not be parsed as a record.
  #[error(
    "Malformed hex file: Could not parse between characters {start} and {end} (\"{text}\")"
  )]
  Unparseable {
    /// Offset of the first unparseable character.
    start: usize,
    /// Offset one past the last unparseable character.
    end: usize,
    /// The offending text, shortened.
    text: String,
  },
  /// The text contains no records at all.
  #[error("Malformed .hex file, could not parse any records")]
  NoRecords,
  /// A record line is not an even number of hex digits.
  #[error("Record {record} does not contain a whole number of bytes")]
  OddDigits {
    /// Zero-based record number.
    record: usize,
  },
  /// A record's length field disagrees with its data.
  #[error(
    "Mismatched record length at record {record}: expected {expected} data bytes, found {actual}"
  )]
  Length {
    /// Zero-based record number.
    record: usize,
    /// Value of the length field.
    expected: usize,
    /// Number of data bytes actually present.
    actual: usize,
  },
  /// A record's checksum does not match its contents.
  #[error("Checksum failed at record {record} (expected {expected:#04x})")]
  Checksum {
    /// Zero-based record number.
    record: usize,
    /// The checksum the record should have carried.
    expected: u8,
  },
  /// A data record runs off the end of its 64KB window.
  #[error("Data at record {record} wraps over 0xFFFF")]
  Wrap {
    /// Zero-based record number.
    record: usize,
  },
  /// A non-data record has a non-zero address field.
  #[error("Record {record} must have 0000 as its address field")]
  Address {
    /// Zero-based record number.
    record: usize,
  },
  /// An extended address record of the wrong size.
  #[error("Extended address at record {record} must carry exactly 2 bytes")]
  ExtendedAddress {
    /// Zero-based record number.
    record: usize,
  },
  /// A record type outside of the Intel HEX set.
  #[error("Invalid record type {ty:#04x} at record {record}")]
  RecordType {
    /// Zero-based record number.
    record: usize,
    /// The type byte.
    ty: u8,
  },
  /// Records follow the end-of-file record.
  #[error("There is data after an EOF record at record {record}")]
  DataAfterEof {
    /// Zero-based record number.
    record: usize,
  },
  /// The end-of-file record is missing.
  #[error("No EOF record at end of file")]
  MissingEof,
  /// Two blocks claim the same byte.
  #[error("Overlapping data around address {addr:#010x}")]
  Overlap {
    /// An address inside both blocks.
    addr: u32,
  },
  /// A block extends past the 32-bit address space.
  #[error("Data at address {addr:#010x} extends past the 32-bit address space")]
  AddressOverflow {
    /// Start of the offending block.
    addr: u32,
  },
}

/// Errors locating or validating the device flash layout.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LayoutError {
  /// No known UICR magic value was found.
  #[error("Could not find valid MicroPython UICR data.")]
  Uicr,
  /// No page held a flash regions table header.
  #[error("Could not find a valid MicroPython flash regions table.")]
  RegionsTable,
  /// The regions table lacks the MicroPython runtime row.
  #[error("Could not find a MicroPython region in the regions table.")]
  RuntimeRegion,
  /// The regions table lacks the file system row.
  #[error("Could not find a File System region in the regions table.")]
  FsRegion,
  /// A page size of `2^log2` bytes is not usable.
  #[error("Invalid flash page size (log2 {log2}).")]
  PageSize {
    /// The stored log2 page size.
    log2: u32,
  },
  /// The region bounds contradict each other.
  #[error(
    "Inconsistent memory layout: runtime end {runtime_end:#x}, fs {fs_start:#x}..{fs_end:#x}, flash end {flash_end:#x}."
  )]
  Inconsistent {
    /// End of the runtime region.
    runtime_end: u32,
    /// Start of the file system region.
    fs_start: u32,
    /// End of the file system region.
    fs_end: u32,
    /// End of flash.
    flash_end: u32,
  },
  /// The computed file system start is not page aligned.
  #[error(
    "File system start address {start:#x} does not align with flash page size {page_size}."
  )]
  Misaligned {
    /// The computed start address.
    start: u32,
    /// The flash page size.
    page_size: u32,
  },
  /// The file system region cannot hold even the persistent data page.
  #[error("File system region {start:#x}..{end:#x} is too small.")]
  TooSmall {
    /// Start of the region.
    start: u32,
    /// End of the region.
    end: u32,
  },
  /// Every strategy failed; holds each strategy's error in order.
  #[error("{}", join_lines(.0))]
  NotFound(Vec<LayoutError>),
}

fn join_lines(errors: &[LayoutError]) -> String {
  errors
    .iter()
    .map(|e| e.to_string())
    .collect::<Vec<_>>()
    .join("\n")
}

/// Errors where data does not fit.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CapacityError {
  /// Not a single free chunk remains, or the storage budget is spent.
  #[error("There is no storage space left.")]
  NoSpace,
  /// Some chunks are free, but too few for this file.
  #[error("Not enough space for the {name} file.")]
  FileTooLarge {
    /// The file being written.
    name: String,
  },
  /// A file name longer than the on-flash header allows.
  #[error("File name \"{name}\" is too long (max {max} characters).")]
  NameTooLong {
    /// The offending name.
    name: String,
    /// Maximum encoded length.
    max: usize,
  },
  /// A storage limit above what the firmware provides.
  #[error(
    "Storage size limit provided is larger than size available in the MicroPython Filesystem ({requested} > {available})."
  )]
  StorageLimit {
    /// The requested limit.
    requested: u32,
    /// The natural capacity.
    available: u32,
  },
  /// An appended script larger than its fixed block.
  #[error("Too long: script needs {len} bytes, the appended block holds {max}.")]
  ScriptTooLong {
    /// Bytes the block would need.
    len: usize,
    /// Size of the block.
    max: usize,
  },
}

/// Errors in a stored file system.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IntegrityError {
  /// Two start chunks name the same file.
  #[error("Found multiple files named: {name}.")]
  DuplicateFile {
    /// The duplicated name.
    name: String,
  },
  /// A tail pointer names a chunk that is not in use.
  #[error("Chunk {chunk} points to unused index {next}.")]
  Dangling {
    /// The pointing chunk.
    chunk: u8,
    /// The chunk it points to.
    next: u8,
  },
  /// A chunk's back pointer does not name its predecessor.
  #[error("Chunk index {next} did not link to previous chunk index {chunk}.")]
  BrokenLink {
    /// The predecessor.
    chunk: u8,
    /// The chunk whose marker disagrees.
    next: u8,
  },
  /// A chunk whose header or end offset points outside of it.
  #[error("Chunk {chunk} has an invalid file header.")]
  Header {
    /// The offending chunk.
    chunk: u8,
  },
  /// A file name that is not valid UTF-8.
  #[error("File name in chunk {chunk} is not valid UTF-8.")]
  Name {
    /// The start chunk.
    chunk: u8,
  },
  /// The images of a universal hex store different files.
  #[error("The file systems of the images in the universal hex differ.")]
  Divergent,
}

/// Errors in how the API was called.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UsageError {
  /// The firmware hex text was empty.
  #[error("Invalid MicroPython hex.")]
  InvalidHex,
  /// The firmware hex handed to the manager already stores files.
  #[error("There are files in the constructor hex file input.")]
  FilesInInput,
  /// An empty file name.
  #[error("File was not provided a valid filename.")]
  InvalidFilename,
  /// A file with empty contents.
  #[error("File {name} does not have valid content.")]
  MissingContent {
    /// The file name.
    name: String,
  },
  /// `create` on an existing name, or an import conflict.
  #[error("File \"{name}\" already exists.")]
  FileExists {
    /// The file name.
    name: String,
  },
  /// No file by this name.
  #[error("File \"{name}\" does not exist.")]
  FileNotFound {
    /// The file name.
    name: String,
  },
  /// Appending to files is not supported.
  #[error("Append operation not yet implemented.")]
  AppendUnsupported,
  /// Several images are held and no board id was given.
  #[error("The Board ID must be specified if there are multiple MicroPythons.")]
  BoardIdRequired,
  /// No image has this board id.
  #[error("Board ID requested not found: {board_id:#06x}.")]
  UnknownBoard {
    /// The requested id.
    board_id: u16,
  },
  /// Two images share one board id.
  #[error("Board ID {board_id:#06x} is used by more than one image.")]
  DuplicateBoard {
    /// The repeated id.
    board_id: u16,
  },
  /// A universal hex needs more than one image.
  #[error(
    "A Universal Hex needs more than one MicroPython Intel Hex, at least two images."
  )]
  TooFewImages,
  /// Hex text that is not a universal hex.
  #[error("The hex is not a Universal Hex.")]
  NotUniversal,
  /// A universal hex where an Intel hex was required.
  #[error("The hex is already a Universal Hex.")]
  AlreadyUniversal,
  /// An import source without files.
  #[error("Hex does not have any files to import.")]
  NothingToImport,
  /// A line size outside `1..=255`.
  #[error("Record line size must be between 1 and 255, got {0}.")]
  LineSize(usize),
}

/// Dumps `error`, and the chain of errors that caused it, as user-displayable
/// text into `sink`.
pub fn dump_to(
  error: &dyn StdError,
  mut sink: impl io::Write,
) -> io::Result<()> {
  writeln!(sink, "error: {}", error)?;
  let mut cause = error.source();
  while let Some(e) = cause {
    writeln!(sink, "  caused by: {}", e)?;
    cause = e.source();
  }
  Ok(())
}

/// Calls `dump_to()` on `stderr`, and exits the process with `code`.
pub fn dump_and_die(error: &dyn StdError, code: i32) -> ! {
  // Writing to stderr is fairly unlikely to fail; there is nothing better to
  // do if it does.
  let _ = dump_to(error, io::stderr());
  std::process::exit(code)
}
