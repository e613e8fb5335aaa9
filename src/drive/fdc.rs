//! WDC 177x floppy controller, used by the 1571 (MFM path) and 1581.
//!
//! Four registers: status/command, track, sector, data.  Commands decode
//! by high nibble into the four WD types; sector transfers move through
//! an internal buffer with DRQ per byte and INTRQ at completion.  Media
//! access is deferred to `tick`, where the owning drive passes itself in
//! as the `FdcHost`, so register writes never need to reach the disk.

/// Sector access supplied by the owning drive.
pub trait FdcHost {
    fn read_sector(&mut self, track: u8, sector: u8, buf: &mut [u8]) -> bool;
    fn write_sector(&mut self, track: u8, sector: u8, buf: &[u8]) -> bool;
    fn write_protected(&self) -> bool;
    fn disk_present(&self) -> bool;
}

// Status bits.
pub const ST_BUSY: u8 = 0x01;
pub const ST_DRQ: u8 = 0x02;
pub const ST_LOST_OR_TRACK0: u8 = 0x04;
pub const ST_CRC_ERROR: u8 = 0x08;
pub const ST_RECORD_NOT_FOUND: u8 = 0x10;
pub const ST_SPINUP_OR_DELETED: u8 = 0x20;
pub const ST_WRITE_PROTECT: u8 = 0x40;
pub const ST_MOTOR_ON: u8 = 0x80;

const MAX_SECTOR_SIZE: usize = 1024;

// Rough command latencies in drive cycles.
const SETTLE_CYCLES: i32 = 64;
const STEP_CYCLES: i32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    None,
    /// Restore / Seek / Step variants, waiting out the head movement.
    TypeI,
    ReadSetup,
    Reading,
    WriteSetup,
    Writing,
    Commit,
    AddressSetup,
}

pub struct Fdc {
    status: u8,
    command: u8,
    track: u8,
    sector: u8,
    data: u8,

    buffer: [u8; MAX_SECTOR_SIZE],
    buffer_len: usize,
    data_index: usize,

    sector_size: usize,
    step_direction: i8,

    drq: bool,
    intrq: bool,
    op: Operation,
    cycles_until_event: i32,
    seek_target: u8,
}

impl Fdc {
    pub fn new(sector_size: usize) -> Self {
        Self {
            status: 0,
            command: 0,
            track: 0,
            sector: 0,
            data: 0,
            buffer: [0; MAX_SECTOR_SIZE],
            buffer_len: 0,
            data_index: 0,
            sector_size: sector_size.min(MAX_SECTOR_SIZE),
            step_direction: 1,
            drq: false,
            intrq: false,
            op: Operation::None,
            cycles_until_event: 0,
            seek_target: 0,
        }
    }

    pub fn reset(&mut self) {
        let size = self.sector_size;
        *self = Self::new(size);
    }

    pub fn set_sector_size(&mut self, size: usize) {
        self.sector_size = size.min(MAX_SECTOR_SIZE);
    }

    pub fn irq_active(&self) -> bool {
        self.intrq
    }

    pub fn drq_active(&self) -> bool {
        self.drq
    }

    pub fn current_track(&self) -> u8 {
        self.track
    }

    pub fn busy(&self) -> bool {
        self.status & ST_BUSY != 0
    }

    fn set_drq(&mut self, on: bool) {
        self.drq = on;
        if on {
            self.status |= ST_DRQ;
        } else {
            self.status &= !ST_DRQ;
        }
    }

    fn finish(&mut self) {
        self.status &= !ST_BUSY;
        self.set_drq(false);
        self.op = Operation::None;
        self.intrq = true;
    }

    // ── Register access ───────────────────────────────────────

    pub fn read_register(&mut self, reg: u8) -> u8 {
        match reg & 0x03 {
            0 => {
                // Reading status clears INTRQ.
                self.intrq = false;
                self.status
            }
            1 => self.track,
            2 => self.sector,
            3 => {
                if self.op == Operation::Reading {
                    self.data = self.buffer[self.data_index];
                    if self.data_index + 1 < self.buffer_len {
                        self.data_index += 1;
                        self.set_drq(true);
                    } else {
                        self.finish();
                    }
                }
                self.data
            }
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, reg: u8, value: u8) {
        match reg & 0x03 {
            0 => self.start_command(value),
            1 => self.track = value,
            2 => self.sector = value,
            3 => {
                self.data = value;
                if self.op == Operation::Writing {
                    self.buffer[self.data_index] = value;
                    if self.data_index + 1 < self.sector_size {
                        self.data_index += 1;
                        self.set_drq(true);
                    } else {
                        // Buffer full: the next tick commits the sector.
                        self.set_drq(false);
                        self.op = Operation::Commit;
                        self.cycles_until_event = 1;
                    }
                }
            }
            _ => {}
        }
    }

    // ── Command execution ─────────────────────────────────────

    fn start_command(&mut self, cmd: u8) {
        // Force Interrupt works even while busy.
        if cmd & 0xF0 == 0xD0 {
            self.op = Operation::None;
            self.status &= !ST_BUSY;
            self.set_drq(false);
            if cmd & 0x0F != 0 {
                self.intrq = true;
            }
            return;
        }
        if self.busy() {
            return;
        }

        self.command = cmd;
        self.intrq = false;
        self.status = ST_MOTOR_ON | ST_BUSY;

        match cmd & 0xF0 {
            0x00 => {
                // Restore.
                self.seek_target = 0;
                self.op = Operation::TypeI;
                self.cycles_until_event = STEP_CYCLES * self.track.max(1) as i32;
            }
            0x10 => {
                // Seek to the data-register target.
                self.seek_target = self.data;
                self.op = Operation::TypeI;
                let dist = self.track.abs_diff(self.data).max(1) as i32;
                self.cycles_until_event = STEP_CYCLES * dist;
            }
            0x20 | 0x30 => {
                // Step, last direction.
                self.seek_target = self.track.wrapping_add_signed(self.step_direction);
                self.op = Operation::TypeI;
                self.cycles_until_event = STEP_CYCLES;
            }
            0x40 | 0x50 => {
                self.step_direction = 1;
                self.seek_target = self.track.wrapping_add(1);
                self.op = Operation::TypeI;
                self.cycles_until_event = STEP_CYCLES;
            }
            0x60 | 0x70 => {
                self.step_direction = -1;
                self.seek_target = self.track.saturating_sub(1);
                self.op = Operation::TypeI;
                self.cycles_until_event = STEP_CYCLES;
            }
            0x80 | 0x90 => {
                self.op = Operation::ReadSetup;
                self.cycles_until_event = SETTLE_CYCLES;
            }
            0xA0 | 0xB0 => {
                self.op = Operation::WriteSetup;
                self.cycles_until_event = SETTLE_CYCLES;
            }
            0xC0 => {
                self.op = Operation::AddressSetup;
                self.cycles_until_event = SETTLE_CYCLES;
            }
            0xE0 | 0xF0 => {
                // Track-level transfers have no sector-image backing;
                // complete immediately.
                self.finish();
            }
            _ => self.finish(),
        }
    }

    /// Advance time; `host` serves whatever media access falls due.
    pub fn tick(&mut self, cycles: u32, host: &mut dyn FdcHost) {
        if self.op == Operation::None {
            return;
        }
        if self.cycles_until_event > 0 {
            self.cycles_until_event -= cycles as i32;
            if self.cycles_until_event > 0 {
                return;
            }
            self.cycles_until_event = 0;
        }

        match self.op {
            Operation::TypeI => {
                self.track = self.seek_target;
                if self.track == 0 {
                    self.status |= ST_LOST_OR_TRACK0;
                }
                if host.write_protected() {
                    self.status |= ST_WRITE_PROTECT;
                }
                self.finish();
            }
            Operation::ReadSetup => {
                if !host.disk_present() {
                    self.status |= ST_RECORD_NOT_FOUND;
                    self.finish();
                    return;
                }
                let mut buf = [0u8; MAX_SECTOR_SIZE];
                let len = self.sector_size;
                if !host.read_sector(self.track, self.sector, &mut buf[..len]) {
                    self.status |= ST_RECORD_NOT_FOUND;
                    self.finish();
                    return;
                }
                self.buffer[..len].copy_from_slice(&buf[..len]);
                self.buffer_len = len;
                self.data_index = 0;
                self.op = Operation::Reading;
                self.set_drq(true);
            }
            Operation::WriteSetup => {
                if !host.disk_present() {
                    self.status |= ST_RECORD_NOT_FOUND;
                    self.finish();
                    return;
                }
                if host.write_protected() {
                    self.status |= ST_WRITE_PROTECT;
                    self.finish();
                    return;
                }
                self.data_index = 0;
                self.op = Operation::Writing;
                self.set_drq(true);
            }
            Operation::Commit => {
                let len = self.sector_size;
                let (t, s) = (self.track, self.sector);
                let buf: Vec<u8> = self.buffer[..len].to_vec();
                if !host.write_sector(t, s, &buf) {
                    self.status |= ST_RECORD_NOT_FOUND;
                }
                self.finish();
            }
            Operation::AddressSetup => {
                // ID field: track, side, sector, length code, CRC.
                self.buffer[0] = self.track;
                self.buffer[1] = 0;
                self.buffer[2] = self.sector;
                self.buffer[3] = match self.sector_size {
                    128 => 0,
                    256 => 1,
                    512 => 2,
                    _ => 3,
                };
                self.buffer[4] = 0;
                self.buffer[5] = 0;
                self.buffer_len = 6;
                self.data_index = 0;
                self.op = Operation::Reading;
                self.set_drq(true);
            }
            Operation::Reading | Operation::Writing | Operation::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestHost {
        sectors: Vec<Vec<u8>>,
        wp: bool,
        writes: usize,
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                sectors: vec![vec![0xE5; 512]; 10],
                wp: false,
                writes: 0,
            }
        }
    }

    impl FdcHost for TestHost {
        fn read_sector(&mut self, _track: u8, sector: u8, buf: &mut [u8]) -> bool {
            let Some(s) = self.sectors.get(sector as usize) else {
                return false;
            };
            buf.copy_from_slice(&s[..buf.len()]);
            true
        }
        fn write_sector(&mut self, _track: u8, sector: u8, buf: &[u8]) -> bool {
            let Some(s) = self.sectors.get_mut(sector as usize) else {
                return false;
            };
            s[..buf.len()].copy_from_slice(buf);
            self.writes += 1;
            true
        }
        fn write_protected(&self) -> bool {
            self.wp
        }
        fn disk_present(&self) -> bool {
            true
        }
    }

    #[test]
    fn restore_returns_to_track_zero() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(1, 30);
        fdc.write_register(0, 0x00);
        assert!(fdc.busy());
        fdc.tick(STEP_CYCLES as u32 * 40, &mut host);
        assert_eq!(fdc.current_track(), 0);
        let st = fdc.read_register(0);
        assert_eq!(st & ST_BUSY, 0);
        assert!(st & ST_LOST_OR_TRACK0 != 0, "track-0 sense");
    }

    #[test]
    fn seek_moves_to_data_register_target() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(3, 17);
        fdc.write_register(0, 0x10);
        fdc.tick(STEP_CYCLES as u32 * 40, &mut host);
        assert_eq!(fdc.current_track(), 17);
        assert!(fdc.irq_active());
    }

    #[test]
    fn step_in_and_out_track_the_direction() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(0, 0x40); // step in
        fdc.tick(STEP_CYCLES as u32 * 2, &mut host);
        assert_eq!(fdc.current_track(), 1);
        fdc.write_register(0, 0x20); // step, same direction
        fdc.tick(STEP_CYCLES as u32 * 2, &mut host);
        assert_eq!(fdc.current_track(), 2);
        fdc.write_register(0, 0x60); // step out
        fdc.tick(STEP_CYCLES as u32 * 2, &mut host);
        assert_eq!(fdc.current_track(), 1);
    }

    #[test]
    fn read_sector_streams_bytes_with_drq() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        host.sectors[3] = (0..512).map(|i| (i & 0xFF) as u8).collect();

        fdc.write_register(2, 3);
        fdc.write_register(0, 0x80);
        fdc.tick(SETTLE_CYCLES as u32, &mut host);
        assert!(fdc.drq_active());

        let mut out = Vec::new();
        for _ in 0..512 {
            out.push(fdc.read_register(3));
        }
        assert_eq!(out, host.sectors[3]);
        assert!(!fdc.drq_active());
        assert!(fdc.irq_active());
    }

    #[test]
    fn write_sector_commits_after_full_buffer() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(2, 1);
        fdc.write_register(0, 0xA0);
        fdc.tick(SETTLE_CYCLES as u32, &mut host);
        assert!(fdc.drq_active());
        for i in 0..512u16 {
            fdc.write_register(3, (i & 0xFF) as u8);
        }
        fdc.tick(2, &mut host);
        assert_eq!(host.writes, 1);
        assert_eq!(host.sectors[1][0], 0);
        assert_eq!(host.sectors[1][255], 255);
        assert!(fdc.irq_active());
    }

    #[test]
    fn write_protect_fails_the_command() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        host.wp = true;
        fdc.write_register(0, 0xA0);
        fdc.tick(SETTLE_CYCLES as u32, &mut host);
        let st = fdc.read_register(0);
        assert!(st & ST_WRITE_PROTECT != 0);
        assert_eq!(st & ST_BUSY, 0);
    }

    #[test]
    fn force_interrupt_aborts_a_busy_command() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(0, 0x80);
        assert!(fdc.busy());
        fdc.write_register(0, 0xD8);
        assert_eq!(fdc.read_register(0) & ST_BUSY, 0);
        let _ = host.writes;
    }

    #[test]
    fn read_address_returns_the_id_field() {
        let mut fdc = Fdc::new(512);
        let mut host = TestHost::new();
        fdc.write_register(1, 7);
        fdc.write_register(2, 4);
        fdc.write_register(0, 0xC0);
        fdc.tick(SETTLE_CYCLES as u32, &mut host);
        assert_eq!(fdc.read_register(3), 7); // track
        assert_eq!(fdc.read_register(3), 0); // side
        assert_eq!(fdc.read_register(3), 4); // sector
        assert_eq!(fdc.read_register(3), 2); // 512-byte length code
    }
}
