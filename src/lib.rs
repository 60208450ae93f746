//! hexfs, a tool for reading and writing the MicroPython file system inside
//! micro:bit firmware hex files.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod appended;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod ihex;
pub mod manager;
pub mod mem;
pub mod universal;

#[cfg(test)]
pub(crate) mod fixture;

pub use manager::HexFs;
