//! Universal hex files: several firmware images in one file.
//!
//! Each image becomes a section of records, tagged with the board id it
//! targets:
//! ```text
//! :02000004XXXXcs          extended linear address
//! :0400000ABBBBC0DEcs      block start, BBBB being the board id
//! ... data records ...     type 0x0d, or 0x00 for first generation boards
//! ... padding records ...  type 0x0c
//! :nn00000BFF...cs         block end, padding the section to 512 characters
//! ```
//! A board's bootloader flashes its own sections and skips the others.

use crate::config::Options;
use crate::error::Result;
use crate::error::UsageError;
use crate::ihex::Record;
use crate::ihex::RecordType;
use crate::manager::HexFs;

/// Board ids of first generation devices.
pub const V1_BOARD_IDS: [u16; 2] = [0x9900, 0x9901];

/// Sections are padded to a multiple of this many characters.
pub const SECTION_ALIGN: usize = 512;

const MAX_PADDING: usize = 16;

/// Length of a record line with `n` data bytes, including the newline.
fn line_len(n: usize) -> usize {
  1 + 2 * (5 + n) + 1
}

fn block_start(board_id: u16) -> Record {
  let mut data = board_id.to_be_bytes().to_vec();
  data.extend_from_slice(&[0xc0, 0xde]);
  Record {
    ty: RecordType::BlockStart,
    address: 0,
    data,
  }
}

fn filler(ty: RecordType, n: usize) -> Record {
  Record {
    ty,
    address: 0,
    data: vec![0xff; n],
  }
}

fn records(hex: &str) -> Result<Vec<Record>> {
  let mut out = Vec::new();
  for (i, line) in hex.lines().filter(|l| !l.trim().is_empty()).enumerate() {
    out.push(Record::parse_line(i, line)?);
  }
  Ok(out)
}

fn to_text(records: &[Record]) -> String {
  let mut text = String::new();
  for r in records {
    text.push_str(&r.to_line());
    text.push('\n');
  }
  text
}

/// Returns true if `hex` starts like a universal hex.
pub fn is_universal(hex: &str) -> bool {
  let mut lines = hex.lines().filter(|l| !l.trim().is_empty());
  let first = lines.next().and_then(|l| Record::parse_line(0, l).ok());
  let second = lines.next().and_then(|l| Record::parse_line(1, l).ok());
  matches!(
    (first, second),
    (Some(a), Some(b))
      if a.ty == RecordType::ExtendedLinear && b.ty == RecordType::BlockStart
  )
}

/// Converts one Intel hex image into a universal hex section.
pub fn section(board_id: u16, hex: &str) -> Result<String> {
  let mut input = records(hex)?;
  let ela = match input.first() {
    Some(r) if r.ty == RecordType::ExtendedLinear => input.remove(0),
    _ => Record::extended_linear(0),
  };
  let custom = !V1_BOARD_IDS.contains(&board_id);

  let mut out = vec![ela, block_start(board_id)];
  for mut r in input {
    match r.ty {
      RecordType::Eof => break,
      RecordType::Data if custom => {
        r.ty = RecordType::CustomData;
        out.push(r);
      }
      RecordType::BlockStart
      | RecordType::BlockEnd
      | RecordType::PaddedData
      | RecordType::CustomData
      | RecordType::OtherData => return Err(UsageError::AlreadyUniversal.into()),
      _ => out.push(r),
    }
  }

  let len = out.iter().map(|r| line_len(r.data.len())).sum::<usize>();
  let mut remaining = (SECTION_ALIGN - len % SECTION_ALIGN) % SECTION_ALIGN;
  if remaining < line_len(0) {
    remaining += SECTION_ALIGN;
  }
  while remaining > line_len(MAX_PADDING) {
    let n = MAX_PADDING.min((remaining - 2 * line_len(0)) / 2);
    out.push(filler(RecordType::PaddedData, n));
    remaining -= line_len(n);
  }
  out.push(filler(RecordType::BlockEnd, (remaining - line_len(0)) / 2));

  Ok(to_text(&out))
}

/// Combines `(board_id, intel_hex)` pairs into one universal hex.
pub fn create(images: &[(u16, String)]) -> Result<String> {
  if images.is_empty() {
    return Err(UsageError::TooFewImages.into());
  }
  let mut text = String::new();
  for (board_id, hex) in images {
    text.push_str(&section(*board_id, hex)?);
  }
  text.push_str(&Record::eof().to_line());
  text.push('\n');
  Ok(text)
}

/// Splits a universal hex back into `(board_id, intel_hex)` pairs.
pub fn separate(universal: &str) -> Result<Vec<(u16, String)>> {
  let mut images = Vec::new();
  let mut pending_ela = None;
  let mut current: Option<(u16, Vec<Record>)> = None;

  for mut r in records(universal)? {
    match r.ty {
      RecordType::BlockStart => {
        let board_id = match r.data.as_slice() {
          &[hi, lo, ..] => u16::from_be_bytes([hi, lo]),
          _ => return Err(UsageError::NotUniversal.into()),
        };
        let ela = pending_ela
          .take()
          .unwrap_or_else(|| Record::extended_linear(0));
        current = Some((board_id, vec![ela]));
      }
      RecordType::BlockEnd => {
        if let Some((board_id, mut recs)) = current.take() {
          recs.push(Record::eof());
          images.push((board_id, to_text(&recs)));
        }
      }
      RecordType::PaddedData | RecordType::OtherData => {}
      RecordType::Eof => break,
      _ => match current.as_mut() {
        Some((_, recs)) => {
          if r.ty == RecordType::CustomData {
            r.ty = RecordType::Data;
          }
          recs.push(r);
        }
        None if r.ty == RecordType::ExtendedLinear => pending_ela = Some(r),
        None => {}
      },
    }
  }

  if images.is_empty() {
    return Err(UsageError::NotUniversal.into());
  }
  Ok(images)
}

/// Writes the same files into every firmware image, and combines the images
/// into one universal hex.
///
/// At least two images are needed.
pub fn compose<N, C>(
  images: &[(u16, &str)],
  files: impl IntoIterator<Item = (N, C)>,
) -> Result<String>
where
  N: AsRef<str>,
  C: AsRef<[u8]>,
{
  if images.len() < 2 {
    return Err(UsageError::TooFewImages.into());
  }
  let mut fs = HexFs::with_images(images, Options::default())?;
  for (name, content) in files {
    fs.write(name.as_ref(), content)?;
  }
  fs.universal_hex()
}

#[cfg(test)]
mod test {
  use super::*;

  use std::collections::BTreeSet;

  use crate::error::CapacityError;
  use crate::error::Error;
  use crate::fixture;
  use crate::ihex;

  fn pair() -> Vec<(u16, String)> {
    vec![(0x9900, fixture::v1_hex()), (0x9903, fixture::v2_hex())]
  }

  #[test]
  fn block_start_line() {
    assert_eq!(block_start(0x9900).to_line(), ":0400000A9900C0DEBB");
  }

  #[test]
  fn sections_are_aligned() {
    for (board_id, hex) in pair() {
      let text = section(board_id, &hex).unwrap();
      assert_eq!(text.len() % SECTION_ALIGN, 0);
      let lines = text.lines().collect::<Vec<_>>();
      assert_eq!(lines[0], ":020000040000FA");
      assert!(lines[1].starts_with(":0400000A"));
      assert!(lines.last().unwrap()[7..9].eq_ignore_ascii_case("0B"));
    }
  }

  fn types(text: &str) -> BTreeSet<&str> {
    text.lines().map(|l| &l[7..9]).collect()
  }

  #[test]
  fn retypes_data_for_newer_boards() {
    let v1 = section(0x9900, &fixture::v1_hex()).unwrap();
    let v2 = section(0x9903, &fixture::v2_hex()).unwrap();
    assert!(types(&v1).contains("00"));
    assert!(!types(&v1).contains("0D"));
    assert!(types(&v2).contains("0D"));
    assert!(!types(&v2).contains("00"));
  }

  #[test]
  fn create_then_separate() {
    let uhex = create(&pair()).unwrap();
    assert!(is_universal(&uhex));
    assert!(!is_universal(&fixture::v1_hex()));
    assert!(uhex.ends_with(":00000001FF\n"));

    let images = separate(&uhex).unwrap();
    assert_eq!(images.len(), 2);
    for ((id, hex), (orig_id, orig)) in images.iter().zip(pair()) {
      assert_eq!(*id, orig_id);
      assert_eq!(ihex::parse(hex).unwrap(), ihex::parse(&orig).unwrap());
    }
  }

  #[test]
  fn rejects_bad_input() {
    let uhex = create(&pair()).unwrap();
    assert_eq!(
      create(&[(0x9900, uhex)]),
      Err(Error::Usage(UsageError::AlreadyUniversal))
    );
    assert_eq!(create(&[]), Err(Error::Usage(UsageError::TooFewImages)));
    assert_eq!(
      separate(&fixture::v1_hex()),
      Err(Error::Usage(UsageError::NotUniversal))
    );
  }

  #[test]
  fn compose_needs_two_images() {
    let v1 = fixture::v1_hex();
    let v2 = fixture::v2_hex();
    let files = vec![("main.py", "print('hi')")];
    assert_eq!(
      compose(&[(0x9900, v1.as_str())], files.clone()),
      Err(Error::Usage(UsageError::TooFewImages))
    );

    let uhex =
      compose(&[(0x9900, v1.as_str()), (0x9903, v2.as_str())], files).unwrap();
    let images = separate(&uhex).unwrap();
    assert_eq!(images.len(), 2);
    for (_, hex) in images {
      let mut target = HexFs::new(&v2, Options::default()).unwrap();
      let names = target
        .import_files_from_intel_hex(&hex, Default::default())
        .unwrap();
      assert_eq!(names, vec!["main.py".to_string()]);
      assert_eq!(target.read("main.py").unwrap(), "print('hi')");
    }
  }

  #[test]
  fn compose_fails_if_any_image_is_too_small() {
    let v1 = fixture::v1_hex();
    let v2 = fixture::v2_hex();
    // Fits the first generation file system, not the second.
    let big = vec![b'x'; 21 * 1024];
    assert!(fixture::V2_FS_SIZE < 22 * 1024 && 22 * 1024 < fixture::V1_FS_SIZE);

    let mut alone = HexFs::new(&v1, Options::default()).unwrap();
    alone.write("big.bin", &big).unwrap();
    alone.intel_hex(None).unwrap();

    assert!(matches!(
      compose(
        &[(0x9900, v1.as_str()), (0x9903, v2.as_str())],
        vec![("big.bin", big)]
      ),
      Err(Error::Capacity(CapacityError::FileTooLarge { .. }))
    ));
  }
}
