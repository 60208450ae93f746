//! The hexfs command line tool.

use std::error::Error as StdError;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use structopt::StructOpt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hexfs::appended;
use hexfs::config;
use hexfs::config::Manifest;
use hexfs::config::Options;
use hexfs::device;
use hexfs::device::DeviceMemInfo;
use hexfs::error;
use hexfs::error::UsageError;
use hexfs::fs;
use hexfs::fs::Layout;
use hexfs::ihex;
use hexfs::manager;
use hexfs::mem::MemoryMap;
use hexfs::universal;
use hexfs::HexFs;

type CliResult = Result<(), Box<dyn StdError>>;

#[derive(StructOpt)]
#[structopt(
  name = "hexfs",
  about = "Reads and writes files in MicroPython firmware hex files."
)]
struct Opts {
  /// Logs more; repeat for even more.
  #[structopt(short, long, parse(from_occurrences))]
  verbose: u8,

  #[structopt(subcommand)]
  command: Command,
}

#[derive(StructOpt)]
enum Command {
  /// Prints the flash layout of a firmware hex.
  Info {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
  },
  /// Lists the files stored in a firmware hex.
  Ls {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
  },
  /// Prints a file stored in a firmware hex.
  Cat {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
    name: String,
  },
  /// Stores files into a firmware hex without files.
  Add {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
    #[structopt(parse(from_os_str), required = true)]
    files: Vec<PathBuf>,
    /// Limits the file system size, in bytes.
    #[structopt(long, parse(try_from_str = parse_int))]
    max_fs_size: Option<u32>,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Deletes a file from a firmware hex.
  Rm {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
    name: String,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Builds an Intel hex, or a universal hex, from a JSON5 manifest.
  Build {
    #[structopt(parse(from_os_str))]
    manifest: PathBuf,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Stores a script as main.py, in the file system if the firmware has one
  /// and appended to the firmware otherwise.
  Pack {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
    #[structopt(parse(from_os_str))]
    script: PathBuf,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Prints, or replaces, the script appended to first generation firmware.
  Script {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
    /// Script to append.
    #[structopt(long, parse(from_os_str))]
    set: Option<PathBuf>,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Splits a universal hex into one Intel hex per board.
  Split {
    #[structopt(parse(from_os_str))]
    universal: PathBuf,
    #[structopt(short, long, parse(from_os_str))]
    output: PathBuf,
  },
  /// Merges Intel hex files that do not overlap.
  Merge {
    #[structopt(parse(from_os_str), required = true)]
    hexes: Vec<PathBuf>,
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
  },
  /// Hexdumps the occupied memory of a hex file.
  Dump {
    #[structopt(parse(from_os_str))]
    hex: PathBuf,
  },
}

/// Parses decimal, or hex with a `0x` prefix.
fn parse_int(s: &str) -> Result<u32, String> {
  match s.strip_prefix("0x") {
    Some(digits) => u32::from_str_radix(digits, 16),
    None => s.parse::<u32>(),
  }
  .map_err(|e| format!("{}: {}", s, e))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Info<'a> {
  #[serde(flatten)]
  mem: &'a DeviceMemInfo,
  bytes_in_hex: usize,
  fs_chunk_start: u32,
  fs_chunk_end: u32,
  fs_chunk_count: usize,
  appended_script: bool,
}

fn init_logging(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "hexfs=debug",
    _ => "hexfs=trace",
  };
  tracing_subscriber::registry()
    .with(EnvFilter::new(
      std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
    ))
    .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
    .init();
}

fn read_text(path: &Path) -> io::Result<String> {
  std::fs::read_to_string(path).map_err(|e| {
    io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
  })
}

fn emit(output: Option<&Path>, bytes: &[u8]) -> io::Result<()> {
  match output {
    Some(path) => File::create(path)?.write_all(bytes),
    None => io::stdout().write_all(bytes),
  }
}

/// Parses a firmware hex, and finds its file system.
fn load(
  path: &Path,
) -> Result<(MemoryMap, DeviceMemInfo, Layout), Box<dyn StdError>> {
  let map = ihex::parse(&read_text(path)?)?;
  let info = device::locate(&map)?;
  let layout = Layout::new(&map, &info)?;
  Ok((map, info, layout))
}

fn build(manifest: &Manifest, dir: &Path) -> Result<String, Box<dyn StdError>> {
  let mut images = Vec::with_capacity(manifest.firmware.len());
  for firmware in &manifest.firmware {
    images.push((firmware.board_id, read_text(&dir.join(&firmware.hex))?));
  }

  let mut hexfs = match images.as_slice() {
    [(_, hex)] => HexFs::new(hex, manifest.options())?,
    _ => {
      let mut with_ids = Vec::with_capacity(images.len());
      for (board_id, hex) in &images {
        let board_id = board_id.ok_or(UsageError::BoardIdRequired)?;
        with_ids.push((board_id, hex.as_str()));
      }
      HexFs::with_images(&with_ids, manifest.options())?
    }
  };
  for file in &manifest.files {
    let content = std::fs::read(dir.join(&file.path))?;
    hexfs.write(&file.device_name(), content)?;
  }

  if images.len() == 1 {
    let line_size = manifest.line_size.unwrap_or(ihex::DEFAULT_LINE_SIZE);
    Ok(hexfs.intel_hex_with(None, line_size)?)
  } else {
    Ok(hexfs.universal_hex()?)
  }
}

fn run(command: Command) -> CliResult {
  match command {
    Command::Info { hex } => {
      let (map, mem, layout) = load(&hex)?;
      let info = Info {
        mem: &mem,
        bytes_in_hex: map.byte_count(),
        fs_chunk_start: layout.start(),
        fs_chunk_end: layout.persistent_page(),
        fs_chunk_count: layout.chunk_count(),
        appended_script: appended::is_present(&map),
      };
      println!("{}", json5::to_string(&info)?);
    }
    Command::Ls { hex } => {
      let (map, _, layout) = load(&hex)?;
      for (name, data) in fs::read_files(&map, &layout)? {
        println!("{:>6}  {}", fs::file_size(&name, &data)?, name);
      }
    }
    Command::Cat { hex, name } => {
      let (map, _, layout) = load(&hex)?;
      emit(None, &fs::read_file(&map, &layout, &name)?)?;
    }
    Command::Add {
      hex,
      files,
      max_fs_size,
      output,
    } => {
      let mut hexfs = HexFs::new(&read_text(&hex)?, Options { max_fs_size })?;
      for path in &files {
        let name = path
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .unwrap_or_default();
        hexfs.write(&name, std::fs::read(path)?)?;
      }
      emit(output.as_deref(), hexfs.intel_hex(None)?.as_bytes())?;
    }
    Command::Rm { hex, name, output } => {
      let (mut map, _, layout) = load(&hex)?;
      fs::remove_file(&mut map, &layout, &name)?;
      emit(output.as_deref(), ihex::serialize(&map).as_bytes())?;
    }
    Command::Build { manifest, output } => {
      let text = read_text(&manifest)?;
      let parsed: Manifest = config::from_json5(&text)?;
      let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
      emit(output.as_deref(), build(&parsed, dir)?.as_bytes())?;
    }
    Command::Pack {
      hex,
      script,
      output,
    } => {
      let (packing, packed) =
        manager::pack_main(&read_text(&hex)?, &read_text(&script)?)?;
      tracing::info!(?packing, "packed script");
      emit(output.as_deref(), packed.as_bytes())?;
    }
    Command::Script { hex, set, output } => {
      let text = read_text(&hex)?;
      match set {
        Some(script) => {
          let encoded = appended::encode(&text, &read_text(&script)?)?;
          emit(output.as_deref(), encoded.as_bytes())?;
        }
        None => emit(output.as_deref(), appended::decode(&text)?.as_bytes())?,
      }
    }
    Command::Split { universal, output } => {
      std::fs::create_dir_all(&output)?;
      for (board_id, hex) in universal::separate(&read_text(&universal)?)? {
        let path = output.join(format!("{:04x}.hex", board_id));
        emit(Some(path.as_path()), hex.as_bytes())?;
        tracing::info!(path = %path.display(), "wrote image");
      }
    }
    Command::Merge { hexes, output } => {
      let mut merged = MemoryMap::new();
      for path in &hexes {
        merged.merge(&ihex::parse(&read_text(path)?)?)?;
      }
      emit(output.as_deref(), ihex::serialize(&merged).as_bytes())?;
    }
    Command::Dump { hex } => {
      let map = ihex::parse(&read_text(&hex)?)?;
      map.dump(io::stdout())?;
    }
  }
  Ok(())
}

fn main() {
  let opts = Opts::from_args();
  init_logging(opts.verbose);
  if let Err(e) = run(opts.command) {
    error::dump_and_die(&*e, 1);
  }
}
