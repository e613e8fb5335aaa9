//! Media attachment: PRG injection, T64/TAP tapes, CRT cartridges.
//!
//! PRG and T64 programs are injected straight into RAM once the KERNAL
//! has finished its power-on housekeeping (a fixed boot delay in
//! frames).  BASIC programs get their pointers fixed up and a `RUN`
//! keystroke queued, exactly as if the user had typed it.

pub mod cartridge;
pub mod cassette;

use std::fs;
use std::io;
use std::path::Path;

use crate::mem::MemoryBus;

pub const BASIC_PRG_START: u16 = 0x0801;
const TXTTAB: u16 = 0x002B;
const VARTAB: u16 = 0x002D;
const ARYTAB: u16 = 0x002F;
const STREND: u16 = 0x0031;

/// KERNAL keyboard buffer and its fill count.
const KEYBOARD_BUFFER: u16 = 0x0277;
const KEYBOARD_COUNT: u16 = 0x00C6;

/// Frames to wait before injecting a queued program.
const BOOT_DELAY_FRAMES: u32 = 140;

pub struct MediaManager {
    queued_prg: Option<Vec<u8>>,
    prg_delay: u32,
    prg_loaded: bool,
    prg_path: String,
}

impl MediaManager {
    pub fn new() -> Self {
        Self {
            queued_prg: None,
            prg_delay: BOOT_DELAY_FRAMES,
            prg_loaded: false,
            prg_path: String::new(),
        }
    }

    pub fn reset(&mut self) {
        self.prg_delay = BOOT_DELAY_FRAMES;
        self.prg_loaded = false;
    }

    // ── PRG ───────────────────────────────────────────────────

    pub fn attach_prg<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        self.attach_prg_bytes(bytes).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            )
        })?;
        self.prg_path = path.display().to_string();
        log::info!("queued program: {}", path.display());
        Ok(())
    }

    pub fn attach_prg_bytes(&mut self, bytes: Vec<u8>) -> Result<(), String> {
        // Skip a .P00 container header when present.
        let payload = if bytes.len() >= 26 && bytes.starts_with(b"C64File") {
            bytes[26..].to_vec()
        } else {
            bytes
        };
        if payload.len() < 3 {
            return Err("program image too small".into());
        }
        let load_addr = u16::from_le_bytes([payload[0], payload[1]]);
        if load_addr as usize + payload.len() - 2 > 0x10000 {
            return Err("program does not fit in 64 K".into());
        }
        self.queued_prg = Some(payload);
        self.prg_delay = BOOT_DELAY_FRAMES;
        self.prg_loaded = false;
        Ok(())
    }

    /// Attach the first program from a T64 archive.
    pub fn attach_t64<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let bytes = fs::read(path.as_ref())?;
        let entries = cassette::parse_t64(&bytes).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {}", path.as_ref().display(), e),
            )
        })?;
        let entry = &entries[0];
        let mut prg = Vec::with_capacity(entry.data.len() + 2);
        prg.extend_from_slice(&entry.load_addr.to_le_bytes());
        prg.extend_from_slice(&entry.data);
        self.queued_prg = Some(prg);
        self.prg_delay = BOOT_DELAY_FRAMES;
        self.prg_loaded = false;
        log::info!("queued T64 program {:?}", entry.name);
        Ok(())
    }

    pub fn has_pending_program(&self) -> bool {
        self.queued_prg.is_some() && !self.prg_loaded
    }

    /// Frame pulse: count the boot delay down, then inject.
    pub fn on_frame(&mut self, bus: &mut MemoryBus) {
        if self.prg_loaded || self.queued_prg.is_none() {
            return;
        }
        if self.prg_delay > 0 {
            self.prg_delay -= 1;
            return;
        }
        if let Some(prg) = self.queued_prg.clone() {
            inject_prg(bus, &prg);
            self.prg_loaded = true;
        }
    }
}

impl Default for MediaManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a PRG (load address + payload) into RAM.  BASIC programs get the
/// pointer fixup and an auto-RUN keystroke.
pub fn inject_prg(bus: &mut MemoryBus, prg: &[u8]) {
    if prg.len() < 2 {
        return;
    }
    let load_addr = u16::from_le_bytes([prg[0], prg[1]]);
    let payload = &prg[2..];
    for (i, &b) in payload.iter().enumerate() {
        bus.write_direct(load_addr.wrapping_add(i as u16), b);
    }
    log::debug!(
        "injected {} bytes at ${:04X}",
        payload.len(),
        load_addr
    );

    if load_addr == BASIC_PRG_START {
        let end = scan_basic_end(bus, load_addr);
        bus.write_direct(TXTTAB, (load_addr & 0xFF) as u8);
        bus.write_direct(TXTTAB + 1, (load_addr >> 8) as u8);
        for ptr in [VARTAB, ARYTAB, STREND] {
            bus.write_direct(ptr, (end & 0xFF) as u8);
            bus.write_direct(ptr + 1, (end >> 8) as u8);
        }
        queue_keys(bus, b"RUN\r");
    }
}

/// Walk the tokenized line links to find the end of a BASIC program.
fn scan_basic_end(bus: &MemoryBus, start: u16) -> u16 {
    let mut scan = start;
    let mut guard = 0;
    loop {
        let next = bus.read16_direct(scan);
        if next == 0 || guard > 10_000 {
            break;
        }
        scan = next;
        guard += 1;
    }
    scan.wrapping_add(2)
}

/// Push PETSCII keystrokes into the KERNAL keyboard buffer.
pub fn queue_keys(bus: &mut MemoryBus, keys: &[u8]) {
    let n = keys.len().min(10);
    bus.write_direct(KEYBOARD_COUNT, n as u8);
    for (i, &k) in keys.iter().take(n).enumerate() {
        bus.write_direct(KEYBOARD_BUFFER + i as u16, k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VideoStandard;

    fn bus() -> MemoryBus {
        MemoryBus::new(VideoStandard::Ntsc)
    }

    /// A one-line BASIC program: 10 SYS 2062.
    fn basic_prg() -> Vec<u8> {
        let mut prg = vec![0x01, 0x08];
        // next line ptr $080C, line 10, SYS token, " 2062", 0, end 0
        prg.extend_from_slice(&[0x0C, 0x08, 0x0A, 0x00, 0x9E, 0x32, 0x30, 0x36, 0x32, 0x00]);
        prg.extend_from_slice(&[0x00, 0x00]);
        prg
    }

    #[test]
    fn basic_prg_fixes_pointers_and_queues_run() {
        let mut b = bus();
        inject_prg(&mut b, &basic_prg());

        assert_eq!(b.read_direct(0x0801), 0x0C);
        // Program ends at $080C + 2.
        assert_eq!(b.read16_direct(VARTAB), 0x080E);
        assert_eq!(b.read16_direct(ARYTAB), 0x080E);
        assert_eq!(b.read16_direct(STREND), 0x080E);
        assert_eq!(b.read16_direct(TXTTAB), 0x0801);

        assert_eq!(b.read_direct(KEYBOARD_COUNT), 4);
        assert_eq!(b.read_direct(KEYBOARD_BUFFER), b'R');
        assert_eq!(b.read_direct(KEYBOARD_BUFFER + 3), 0x0D);
    }

    #[test]
    fn machine_code_prg_skips_the_fixup() {
        let mut b = bus();
        inject_prg(&mut b, &[0x00, 0xC0, 0xAA, 0xBB]);
        assert_eq!(b.read_direct(0xC000), 0xAA);
        assert_eq!(b.read_direct(0xC001), 0xBB);
        assert_eq!(b.read_direct(KEYBOARD_COUNT), 0, "no RUN for ML programs");
    }

    #[test]
    fn boot_delay_defers_injection() {
        let mut b = bus();
        let mut mm = MediaManager::new();
        mm.attach_prg_bytes(basic_prg()).unwrap();
        assert!(mm.has_pending_program());

        for _ in 0..BOOT_DELAY_FRAMES {
            mm.on_frame(&mut b);
        }
        assert_eq!(b.read_direct(0x0801), 0, "still waiting");
        mm.on_frame(&mut b);
        assert_eq!(b.read_direct(0x0801), 0x0C, "injected after the delay");
        assert!(!mm.has_pending_program());
    }

    #[test]
    fn p00_header_is_skipped() {
        let mut container = Vec::new();
        container.extend_from_slice(b"C64File");
        container.extend_from_slice(&[0; 19]);
        container.extend_from_slice(&[0x00, 0x10, 0x42]);
        let mut mm = MediaManager::new();
        mm.attach_prg_bytes(container).unwrap();
        let prg = mm.queued_prg.as_ref().unwrap();
        assert_eq!(u16::from_le_bytes([prg[0], prg[1]]), 0x1000);
    }

    #[test]
    fn oversized_prg_is_rejected() {
        let mut mm = MediaManager::new();
        let mut prg = vec![0x00, 0xFF];
        prg.extend_from_slice(&vec![0u8; 0x2000]);
        assert!(mm.attach_prg_bytes(prg).is_err());
    }
}
