//! Datasette: TAP pulse playback and T64 archive parsing.
//!
//! A TAP image is a pulse train; each data byte is a pulse length in
//! eighths of a clock cycle (a zero byte escapes a 24-bit length in
//! version 1 files).  Pulses arrive on CIA1's FLAG pin while the motor
//! runs.  T64 archives are not real tape at all — they carry PRG records
//! that get injected straight into memory.

const TAP_HEADER_LEN: usize = 20;
const T64_HEADER_LEN: usize = 64;
const T64_RECORD_LEN: usize = 32;

/// One program extracted from a T64 record.
#[derive(Debug, Clone)]
pub struct T64Entry {
    pub name: String,
    pub load_addr: u16,
    pub data: Vec<u8>,
}

/// Parse a T64 archive into its PRG entries.
pub fn parse_t64(bytes: &[u8]) -> Result<Vec<T64Entry>, String> {
    if bytes.len() < T64_HEADER_LEN || !bytes.starts_with(b"C64") {
        return Err("not a T64 archive".into());
    }
    let used = u16::from_le_bytes([bytes[0x24], bytes[0x25]]).max(1) as usize;

    let mut entries = Vec::new();
    for i in 0..used {
        let off = T64_HEADER_LEN + i * T64_RECORD_LEN;
        if off + T64_RECORD_LEN > bytes.len() {
            return Err("record table truncated".into());
        }
        let rec = &bytes[off..off + T64_RECORD_LEN];
        if rec[0] == 0 {
            continue; // free slot
        }
        let load_addr = u16::from_le_bytes([rec[2], rec[3]]);
        let end_addr = u16::from_le_bytes([rec[4], rec[5]]);
        let file_off = u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]) as usize;
        let len = end_addr.wrapping_sub(load_addr) as usize;
        if file_off + len > bytes.len() {
            return Err("record data truncated".into());
        }
        let name = String::from_utf8_lossy(&rec[16..32])
            .trim_end_matches([' ', '\0'])
            .to_string();
        entries.push(T64Entry {
            name,
            load_addr,
            data: bytes[file_off..file_off + len].to_vec(),
        });
    }
    if entries.is_empty() {
        return Err("archive holds no files".into());
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapeState {
    Stopped,
    Playing,
}

pub struct Cassette {
    pulses: Vec<u32>,
    position: usize,
    cycles_until_edge: u32,
    state: TapeState,
    motor_on: bool,
    read_level: bool,
}

impl Cassette {
    pub fn new() -> Self {
        Self {
            pulses: Vec::new(),
            position: 0,
            cycles_until_edge: 0,
            state: TapeState::Stopped,
            motor_on: false,
            read_level: true,
        }
    }

    /// Decode a TAP image into the pulse list.
    pub fn load_tap(&mut self, bytes: &[u8]) -> Result<(), String> {
        if bytes.len() < TAP_HEADER_LEN || !bytes.starts_with(b"C64-TAPE-RAW") {
            return Err("not a TAP image".into());
        }
        let version = bytes[12];
        let mut pulses = Vec::new();
        let mut pos = TAP_HEADER_LEN;
        while pos < bytes.len() {
            let b = bytes[pos];
            pos += 1;
            if b != 0 {
                pulses.push(b as u32 * 8);
            } else if version >= 1 {
                if pos + 3 > bytes.len() {
                    return Err("TAP long pulse truncated".into());
                }
                let long =
                    u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], 0]);
                pulses.push(long);
                pos += 3;
            } else {
                // v0: a zero byte is an overflow pulse.
                pulses.push(256 * 8);
            }
        }
        self.pulses = pulses;
        self.rewind();
        Ok(())
    }

    pub fn eject(&mut self) {
        self.pulses.clear();
        self.rewind();
    }

    pub fn is_tape_loaded(&self) -> bool {
        !self.pulses.is_empty()
    }

    pub fn play(&mut self) {
        if self.is_tape_loaded() {
            self.state = TapeState::Playing;
        }
    }

    pub fn stop(&mut self) {
        self.state = TapeState::Stopped;
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.cycles_until_edge = 0;
        self.state = TapeState::Stopped;
        self.read_level = true;
    }

    pub fn is_playing(&self) -> bool {
        self.state == TapeState::Playing
    }

    pub fn at_end(&self) -> bool {
        self.position >= self.pulses.len()
    }

    /// Sense line is low while a tape is inserted and PLAY is latched.
    pub fn sense_low(&self) -> bool {
        self.is_tape_loaded() && self.state == TapeState::Playing
    }

    /// Motor control from the processor port (bit 5, active low).
    pub fn set_motor(&mut self, on: bool) {
        self.motor_on = on;
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    /// Advance the tape; returns `true` for every pulse edge that fell
    /// inside the window, to be delivered to CIA1's FLAG pin.
    pub fn tick(&mut self, mut cycles: u32) -> u32 {
        if self.state != TapeState::Playing || !self.motor_on {
            return 0;
        }
        let mut edges = 0;
        while cycles > 0 {
            if self.cycles_until_edge == 0 {
                match self.pulses.get(self.position) {
                    Some(&len) => {
                        self.position += 1;
                        self.cycles_until_edge = len.max(8);
                        edges += 1;
                    }
                    None => {
                        self.state = TapeState::Stopped;
                        break;
                    }
                }
            }
            let step = cycles.min(self.cycles_until_edge);
            self.cycles_until_edge -= step;
            cycles -= step;
        }
        edges
    }
}

impl Default for Cassette {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap_image(pulses: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"C64-TAPE-RAW");
        out.push(1); // version
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&(pulses.len() as u32).to_le_bytes());
        out.extend_from_slice(pulses);
        out
    }

    #[test]
    fn tap_pulses_scale_by_eight() {
        let mut c = Cassette::new();
        c.load_tap(&tap_image(&[10, 20])).unwrap();
        c.play();
        c.set_motor(true);

        assert_eq!(c.tick(80), 1, "first pulse spans 80 cycles");
        assert_eq!(c.tick(160), 1);
        assert!(c.at_end());
    }

    #[test]
    fn long_pulse_escape() {
        let mut c = Cassette::new();
        let mut img = tap_image(&[]);
        img.push(0);
        img.extend_from_slice(&[0x10, 0x27, 0x00]); // 10000 cycles
        c.load_tap(&img).unwrap();
        c.play();
        c.set_motor(true);
        assert_eq!(c.tick(10_000), 1);
        assert_eq!(c.tick(1), 0);
    }

    #[test]
    fn stopped_or_motorless_tape_stays_silent() {
        let mut c = Cassette::new();
        c.load_tap(&tap_image(&[10])).unwrap();
        c.set_motor(true);
        assert_eq!(c.tick(1000), 0, "not playing");
        c.play();
        c.set_motor(false);
        assert_eq!(c.tick(1000), 0, "motor off");
    }

    #[test]
    fn sense_follows_play_state() {
        let mut c = Cassette::new();
        assert!(!c.sense_low());
        c.load_tap(&tap_image(&[10])).unwrap();
        assert!(!c.sense_low());
        c.play();
        assert!(c.sense_low());
    }

    #[test]
    fn t64_records_parse() {
        let mut img = vec![0u8; 64 + 32];
        img[..3].copy_from_slice(b"C64");
        img[0x24] = 1; // one used entry
        let rec = 64;
        img[rec] = 1; // normal file
        img[rec + 2..rec + 4].copy_from_slice(&0x0801u16.to_le_bytes());
        img[rec + 4..rec + 6].copy_from_slice(&0x0805u16.to_le_bytes());
        img[rec + 8..rec + 12].copy_from_slice(&96u32.to_le_bytes());
        img[rec + 16..rec + 21].copy_from_slice(b"DEMO ");
        img.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let entries = parse_t64(&img).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "DEMO");
        assert_eq!(entries[0].load_addr, 0x0801);
        assert_eq!(entries[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn bad_tap_and_t64_are_rejected() {
        let mut c = Cassette::new();
        assert!(c.load_tap(b"WRONG").is_err());
        assert!(parse_t64(b"NOPE").is_err());
    }
}
