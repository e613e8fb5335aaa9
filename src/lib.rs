//! Breadbin — a cycle-accurate Commodore 64 core.
//!
//! The crate models the complete breadbin machine: 6510 CPU, VIC-II video,
//! two 6526 CIAs, the PLA banking logic, the serial IEC bus, and the
//! 1541/1571/1581 drive family — each drive an independent machine with its
//! own 6502, chips, and media.  Host concerns (windowing, audio output,
//! input mapping) stay outside; the core exposes a frame queue, an event
//! channel, and register-level chip access.

pub mod cia;
pub mod config;
pub mod cpu;
pub mod drive;
pub mod floppy;
pub mod iec;
pub mod machine;
pub mod media;
pub mod mem;
pub mod petscii;
pub mod roms;
pub mod rs232;
pub mod sid;
pub mod state;
pub mod trace;
pub mod vic;

pub use config::Config;
pub use machine::{C64, VideoStandard};
pub use roms::{RomError, RomSet};
