//! The machine: chips wired together and advanced one CPU step at a
//! time.
//!
//! Every step follows the same deterministic order: CPU instruction,
//! VIC (which may seize the bus), CIAs, SID, cassette, IEC bus, then
//! each drive with its clock multiplier; finally the IRQ aggregator and
//! the CIA2 NMI line are sampled into the CPU pins.  Cross-tree effects
//! (CIA2 → IEC wires, drive → IEC wires) drain through small outboxes
//! after each tick so ordering inside a batch never matters.

pub mod frame;
pub mod irq;

use std::io;
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::cpu::{Cpu, CpuState};
use crate::drive::{Drive, DriveLineState, DriveModel};
use crate::iec::{BusCommand, IecBus, LineChanges};
use crate::media::cassette::Cassette;
use crate::media::MediaManager;
use crate::mem::MemoryBus;
use crate::petscii;
use crate::roms::RomSet;
use crate::state::{StateReader, StateWriter};
use crate::trace::TraceContext;
use crate::vic::FrameBuffer;

use frame::FrameQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStandard {
    Ntsc,
    Pal,
}

impl VideoStandard {
    pub fn cycles_per_line(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 65,
            VideoStandard::Pal => 63,
        }
    }

    pub fn raster_lines(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 262,
            VideoStandard::Pal => 312,
        }
    }

    pub fn cycles_per_frame(self) -> u32 {
        self.cycles_per_line() * self.raster_lines()
    }

    pub fn frames_per_second(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 60,
            VideoStandard::Pal => 50,
        }
    }
}

/// Events from the host, drained at the start of each step batch.
#[derive(Debug, Clone)]
pub enum HostEvent {
    KeyDown(u8, u8),
    KeyUp(u8, u8),
    Joystick1(u8),
    Joystick2(u8),
    Reset,
    InsertDisk(u8, String),
    AttachPrg(String),
}

struct DriveSlot {
    drive: Drive,
    last_lines: DriveLineState,
}

pub struct C64 {
    pub cpu: Cpu,
    pub bus: MemoryBus,
    pub iec: IecBus,
    drives: Vec<DriveSlot>,
    pub cassette: Cassette,
    pub media: MediaManager,
    pub trace: TraceContext,

    standard: VideoStandard,
    back_buffer: FrameBuffer,
    frame_queue: Arc<FrameQueue>,
    frames: u64,

    events_tx: Sender<HostEvent>,
    events_rx: Receiver<HostEvent>,
}

impl C64 {
    pub fn new(standard: VideoStandard) -> Self {
        let (events_tx, events_rx) = unbounded();
        let mut c64 = Self {
            cpu: Cpu::new(),
            bus: MemoryBus::new(standard),
            iec: IecBus::new(),
            drives: Vec::new(),
            cassette: Cassette::new(),
            media: MediaManager::new(),
            trace: TraceContext::new(),
            standard,
            back_buffer: FrameBuffer::new(),
            frame_queue: Arc::new(FrameQueue::new()),
            frames: 0,
            events_tx,
            events_rx,
        };
        c64.cpu.reset(&mut c64.bus);
        c64
    }

    /// Power on with a ROM set in place.
    pub fn power_on(roms: &RomSet, standard: VideoStandard) -> Self {
        let mut c64 = Self::new(standard);
        c64.load_roms(roms);
        c64.reset();
        c64
    }

    pub fn load_roms(&mut self, roms: &RomSet) {
        self.bus.basic_rom.set(Some(&roms.basic));
        self.bus.kernal_rom.set(Some(&roms.kernal));
        self.bus.char_rom.set(Some(&roms.chargen));
    }

    pub fn standard(&self) -> VideoStandard {
        self.standard
    }

    /// Synchronous reset: walks every owned component.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.iec.reset();
        for slot in &mut self.drives {
            slot.drive.reset();
            slot.last_lines = DriveLineState::default();
        }
        self.cassette.rewind();
        self.media.reset();
        self.frames = 0;
        self.cpu.reset(&mut self.bus);
    }

    // ── Host surface ──────────────────────────────────────────

    pub fn frame_queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.frame_queue)
    }

    pub fn event_sender(&self) -> Sender<HostEvent> {
        self.events_tx.clone()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    pub fn key_down(&mut self, row: u8, col: u8) {
        self.bus.cia1.keyboard.set(row, col, true);
    }

    pub fn key_up(&mut self, row: u8, col: u8) {
        self.bus.cia1.keyboard.set(row, col, false);
    }

    pub fn set_joystick1(&mut self, lines: u8) {
        self.bus.cia1.set_joystick1(lines);
    }

    pub fn set_joystick2(&mut self, lines: u8) {
        self.bus.cia1.set_joystick2(lines);
    }

    /// RESTORE key: a direct NMI edge.
    pub fn press_restore(&mut self) {
        self.cpu.request_nmi();
    }

    /// Light-pen button (joystick port 1 fire wired to the LP pin).
    pub fn trigger_lightpen(&mut self) {
        let MemoryBus { vic, irq, .. } = &mut self.bus;
        vic.trigger_lightpen(irq);
    }

    /// Queue PETSCII text through the KERNAL keyboard buffer.
    pub fn type_text(&mut self, text: &str) {
        let keys: Vec<u8> = text.chars().map(petscii::ascii_to_petscii).collect();
        crate::media::queue_keys(&mut self.bus, &keys);
    }

    fn drain_events(&mut self) {
        while let Ok(ev) = self.events_rx.try_recv() {
            match ev {
                HostEvent::KeyDown(r, c) => self.key_down(r, c),
                HostEvent::KeyUp(r, c) => self.key_up(r, c),
                HostEvent::Joystick1(l) => self.set_joystick1(l),
                HostEvent::Joystick2(l) => self.set_joystick2(l),
                HostEvent::Reset => self.reset(),
                HostEvent::InsertDisk(dev, path) => {
                    if let Err(e) = self.insert_disk(dev, &path) {
                        log::warn!("insert disk failed: {e}");
                    }
                }
                HostEvent::AttachPrg(path) => {
                    if let Err(e) = self.media.attach_prg(&path) {
                        log::warn!("attach prg failed: {e}");
                    }
                }
            }
        }
    }

    // ── Drives ────────────────────────────────────────────────

    pub fn attach_drive(&mut self, device: u8, model: DriveModel) -> &mut Drive {
        self.detach_drive(device);
        let drive = Drive::new(device, model);
        self.iec.register_device(device);
        self.drives.push(DriveSlot {
            drive,
            last_lines: DriveLineState::default(),
        });
        log::info!("attached {} as device {}", model.name(), device);
        &mut self.drives.last_mut().unwrap().drive
    }

    pub fn detach_drive(&mut self, device: u8) {
        if let Some(pos) = self.drive_index(device) {
            self.drives.remove(pos);
            let ch = self.iec.unregister_device(device);
            self.propagate(ch);
        }
    }

    fn drive_index(&self, device: u8) -> Option<usize> {
        self.drives
            .iter()
            .position(|s| s.drive.device_number() == device)
    }

    pub fn drive(&self, device: u8) -> Option<&Drive> {
        self.drive_index(device).map(|i| &self.drives[i].drive)
    }

    pub fn drive_mut(&mut self, device: u8) -> Option<&mut Drive> {
        self.drive_index(device)
            .map(move |i| &mut self.drives[i].drive)
    }

    pub fn insert_disk<P: AsRef<Path>>(&mut self, device: u8, path: P) -> io::Result<()> {
        match self.drive_mut(device) {
            Some(drive) => drive.insert_disk(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no drive at device {device}"),
            )),
        }
    }

    // ── IEC plumbing ──────────────────────────────────────────

    /// Apply line changes: notify peripherals and CIA2, decode command
    /// bits, and absorb any follow-up assertions the drives make.  The
    /// loop is bounded; open-collector state settles in a step or two.
    fn propagate(&mut self, mut ch: LineChanges) {
        for _ in 0..8 {
            if !ch.any() {
                break;
            }
            let lines = self.iec.lines();

            // Command reception happens on CLK falling edges under ATN.
            let mut command = None;
            if ch.clk && !lines.clk && !lines.atn {
                command = self.iec.shift_command_bit(lines.data);
            }

            for slot in &mut self.drives {
                if ch.atn {
                    slot.drive.atn_changed(!lines.atn);
                }
                if ch.clk {
                    slot.drive.clk_changed(lines.clk, lines.data);
                }
                if ch.data {
                    slot.drive.data_changed(lines.data);
                }
                if ch.srq {
                    slot.drive.srq_changed(lines.srq);
                }
            }

            if ch.atn {
                self.bus.cia2.atn_changed(!lines.atn);
            }
            if ch.clk {
                self.bus.cia2.clk_changed(lines.clk, lines.data);
            }
            if ch.data {
                self.bus.cia2.data_changed(lines.data);
            }
            if ch.srq {
                self.bus.cia2.srq_changed(lines.srq, lines.data);
            }

            if let Some(cmd) = command {
                self.dispatch_bus_command(cmd);
            }

            ch = self.collect_drive_outputs();
        }
    }

    /// Push every drive's desired line state onto the bus, returning
    /// the merged level changes.
    fn collect_drive_outputs(&mut self) -> LineChanges {
        let mut ch = LineChanges::default();
        for i in 0..self.drives.len() {
            let want = self.drives[i].drive.line_outputs();
            let last = self.drives[i].last_lines;
            let dev = self.drives[i].drive.device_number();
            if want.clk_low != last.clk_low {
                ch.merge(self.iec.peripheral_control_clk(dev, want.clk_low));
            }
            if want.data_low != last.data_low {
                ch.merge(self.iec.peripheral_control_data(dev, want.data_low));
            }
            if want.srq_low != last.srq_low {
                ch.merge(self.iec.peripheral_control_srq(dev, want.srq_low));
            }
            self.drives[i].last_lines = want;
        }
        ch
    }

    /// A full command byte arrived under ATN.
    fn dispatch_bus_command(&mut self, cmd: BusCommand) {
        log::trace!("iec command: {cmd:?}");

        // Everyone on the bus acknowledges the byte.
        for slot in &mut self.drives {
            slot.drive.pulse_data_ack();
        }

        match cmd {
            BusCommand::Listen(dev) => {
                if let Some(d) = self.drive_mut(dev) {
                    d.on_listen();
                    self.iec.listen(dev);
                }
                self.bus.cia2.set_listening(false);
            }
            BusCommand::Unlisten => {
                for dev in self.iec.listeners().to_vec() {
                    if let Some(d) = self.drive_mut(dev) {
                        d.on_unlisten();
                    }
                }
                self.iec.unlisten();
            }
            BusCommand::Talk(dev) => {
                if self.drive_index(dev).is_some() {
                    let ch = self.iec.talk(dev);
                    if let Some(d) = self.drive_mut(dev) {
                        d.on_talk();
                    }
                    // The computer becomes the listener.
                    self.bus.cia2.set_listening(true);
                    self.propagate(ch);
                }
            }
            BusCommand::Untalk => {
                if let Some(dev) = self.iec.current_talker() {
                    if let Some(d) = self.drive_mut(dev) {
                        d.on_untalk();
                    }
                }
                let ch = self.iec.untalk();
                self.bus.cia2.set_listening(false);
                self.propagate(ch);
            }
            BusCommand::Secondary(chan) => {
                self.for_addressed_drives(|d| d.on_secondary_address(chan));
            }
            BusCommand::Open(chan) => {
                self.for_addressed_drives(|d| d.on_open_channel(chan));
            }
            BusCommand::Close(chan) => {
                self.for_addressed_drives(|d| d.on_close_channel(chan));
            }
        }
    }

    fn for_addressed_drives(&mut self, mut f: impl FnMut(&mut Drive)) {
        let mut targets: Vec<u8> = self.iec.listeners().to_vec();
        if let Some(t) = self.iec.current_talker() {
            if !targets.contains(&t) {
                targets.push(t);
            }
        }
        for dev in targets {
            if let Some(d) = self.drive_mut(dev) {
                f(d);
            }
        }
    }

    // ── The synchronization loop ──────────────────────────────

    /// Advance the whole machine by one CPU step.  Returns the elapsed
    /// cycle count.
    pub fn step(&mut self) -> u32 {
        self.drain_events();

        let pc = self.cpu.pc;
        self.trace.check_break(pc);

        // 1. CPU executes one instruction (or stalls under BA).
        let dc = self.cpu.tick(&mut self.bus).max(1);
        self.bus.clock += dc as u64;
        self.bus.pla.trace_mode(&mut self.trace);

        // 2. VIC: raster advance, possible bus steal.
        let ba_low = self.bus.tick_vic(dc, &mut self.back_buffer);
        self.cpu.set_ba_hold(ba_low);

        // 3. CIAs.
        {
            let MemoryBus { cia1, cia2, irq, .. } = &mut self.bus;
            cia1.update_timers(dc, irq);
            cia2.update_timers(dc);
        }

        // 4. SID.
        self.bus.sid.tick(dc);

        // 5. Cassette: motor from the processor port, pulses onto FLAG.
        self.cassette.set_motor(self.bus.port.cassette_motor_on());
        let edges = self.cassette.tick(dc);
        if edges > 0 {
            let MemoryBus { cia1, irq, .. } = &mut self.bus;
            for _ in 0..edges {
                cia1.set_flag_line(false, irq);
                cia1.set_flag_line(true, irq);
            }
        }
        self.bus.cassette_sense_low = self.cassette.sense_low();

        // 6. IEC: drain CIA2's drivers, poll SRQ, run the drives.
        if let Some(out) = self.bus.cia2.take_iec_outputs() {
            let mut ch = self.iec.set_atn_line(out.atn_low);
            ch.merge(self.iec.set_clk_line(out.clk_low));
            ch.merge(self.iec.set_data_line(out.data_low));
            self.propagate(ch);
        }
        let ch = self.iec.tick();
        if ch.any() {
            self.propagate(ch);
        }

        for i in 0..self.drives.len() {
            let mult = self.drives[i].drive.model().clock_multiplier();
            self.drives[i].drive.tick(dc * mult);
        }
        let ch = self.collect_drive_outputs();
        if ch.any() {
            self.propagate(ch);
        }

        // 7. Interrupt pins for the next step.
        self.cpu.set_irq_line(self.bus.irq.active());
        self.cpu.set_nmi_line(self.bus.cia2.nmi_asserted());

        // 8. Frame hand-off.
        if self.bus.vic.frame_done() {
            self.bus.vic.clear_frame_flag();
            self.frame_queue.publish(self.back_buffer.pixels_mut());
            self.frames += 1;
            self.media.on_frame(&mut self.bus);
        }

        dc
    }

    /// Run at least `cycles` machine cycles.
    pub fn run_cycles(&mut self, cycles: u64) {
        let mut elapsed = 0u64;
        while elapsed < cycles {
            elapsed += self.step() as u64;
        }
    }

    /// Run one full video frame.
    pub fn run_frame(&mut self) {
        let target = self.frames + 1;
        let guard = self.standard.cycles_per_frame() as u64 * 4;
        let mut spent = 0u64;
        while self.frames < target && spent < guard {
            spent += self.step() as u64;
        }
    }

    // ── Introspection ─────────────────────────────────────────

    pub fn cpu_state(&self) -> CpuState {
        self.cpu.state()
    }

    /// The 40×25 screen matrix as ASCII text, one line per row.
    pub fn screen_text(&self) -> String {
        let base = self.bus.cia2.vic_bank_base() + self.bus.vic.screen_base_current();
        let mut out = String::with_capacity(41 * 25);
        for row in 0..25u16 {
            for col in 0..40u16 {
                let code = self.bus.ram[(base + row * 40 + col) as usize];
                out.push(petscii::screen_to_ascii(code));
            }
            out.push('\n');
        }
        out
    }

    // ── Save-state ────────────────────────────────────────────

    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();

        w.begin_chunk(b"CPU0");
        let s = self.cpu.state();
        w.write_u16(s.pc);
        w.write_u8(s.a);
        w.write_u8(s.x);
        w.write_u8(s.y);
        w.write_u8(s.sp);
        w.write_u8(s.sr);
        w.write_u64(self.cpu.total_cycles());
        w.write_u64(self.bus.clock);
        w.end_chunk();

        w.begin_chunk(b"PLA0");
        w.write_u8(self.bus.pla.memory_control_register());
        w.write_bool(self.bus.pla.exrom_line());
        w.write_bool(self.bus.pla.game_line());
        w.end_chunk();

        w.begin_chunk(b"RAM0");
        w.write_vec(&self.bus.ram[..]);
        let color: Vec<u8> = (0..0x400).map(|i| self.bus.color_ram.peek(i)).collect();
        w.write_vec(&color);
        w.end_chunk();

        w.begin_chunk(b"CIA1");
        self.bus.cia1.core.save_state(&mut w);
        w.end_chunk();

        w.begin_chunk(b"CIA2");
        self.bus.cia2.core.save_state(&mut w);
        w.end_chunk();

        w.begin_chunk(b"VIC0");
        self.bus.vic.save_state(&mut w);
        w.end_chunk();

        w.begin_chunk(b"MED0");
        w.write_u8(self.drives.len() as u8);
        for slot in &self.drives {
            w.write_u8(slot.drive.device_number());
            w.write_u8(match slot.drive.model() {
                DriveModel::D1541 => 0,
                DriveModel::D1571 => 1,
                DriveModel::D1581 => 2,
            });
            w.write_string(slot.drive.loaded_disk_path());
            w.write_u32(slot.drive.half_track() as u32);
            w.write_bool(slot.drive.motor_on());
        }
        w.end_chunk();

        w.finish()
    }

    /// Restore a snapshot.  The stream is validated in full before any
    /// machine state changes; a malformed snapshot leaves the machine
    /// untouched.
    pub fn restore_state(&mut self, bytes: &[u8]) -> bool {
        // Dry run against scratch targets.
        if !self.run_restore(bytes, true) {
            return false;
        }
        self.run_restore(bytes, false)
    }

    fn run_restore(&mut self, bytes: &[u8], dry_run: bool) -> bool {
        let mut r = StateReader::from_bytes(bytes.to_vec());
        if !r.read_header() {
            return false;
        }

        let mut scratch_cia = crate::cia::CiaCore::new(self.standard);
        let mut scratch_vic = crate::vic::Vic::new(self.standard);

        while !r.at_eof() {
            // Trailing garbage or a short chunk is malformed, not EOF.
            let Some(chunk) = r.next_chunk() else {
                return false;
            };
            r.enter_chunk(&chunk);
            let ok = match &chunk.tag {
                b"CPU0" => {
                    let pc = r.read_u16();
                    let a = r.read_u8();
                    let x = r.read_u8();
                    let y = r.read_u8();
                    let sp = r.read_u8();
                    let sr = r.read_u8();
                    let total = r.read_u64();
                    let clock = r.read_u64();
                    match (pc, a, x, y, sp, sr, total, clock) {
                        (
                            Some(pc),
                            Some(a),
                            Some(x),
                            Some(y),
                            Some(sp),
                            Some(sr),
                            Some(total),
                            Some(clock),
                        ) => {
                            if !dry_run {
                                self.cpu.set_state(CpuState { pc, a, x, y, sp, sr });
                                self.cpu.set_total_cycles(total);
                                self.bus.clock = clock;
                            }
                            true
                        }
                        _ => false,
                    }
                }
                b"PLA0" => {
                    match (r.read_u8(), r.read_bool(), r.read_bool()) {
                        (Some(mcr), Some(exrom), Some(game)) => {
                            if !dry_run {
                                self.bus.pla.update_memory_control_register(mcr);
                                self.bus.pla.set_cartridge_lines(exrom, game);
                            }
                            true
                        }
                        _ => false,
                    }
                }
                b"RAM0" => match (r.read_vec(), r.read_vec()) {
                    (Some(ram), Some(color)) if ram.len() == 0x10000 && color.len() == 0x400 => {
                        if !dry_run {
                            self.bus.ram.copy_from_slice(&ram);
                            for (i, &c) in color.iter().enumerate() {
                                self.bus.color_ram.poke(i as u16, c);
                            }
                        }
                        true
                    }
                    _ => false,
                },
                b"CIA1" => {
                    if dry_run {
                        scratch_cia.load_state(&mut r)
                    } else {
                        self.bus.cia1.core.load_state(&mut r)
                    }
                }
                b"CIA2" => {
                    if dry_run {
                        scratch_cia.load_state(&mut r)
                    } else {
                        self.bus.cia2.core.load_state(&mut r)
                    }
                }
                b"VIC0" => {
                    if dry_run {
                        scratch_vic.load_state(&mut r)
                    } else {
                        self.bus.vic.load_state(&mut r)
                    }
                }
                b"MED0" => {
                    let Some(count) = r.read_u8() else {
                        return false;
                    };
                    let mut ok = true;
                    for _ in 0..count {
                        let dev = r.read_u8();
                        let model = r.read_u8();
                        let path = r.read_string();
                        let half_track = r.read_u32();
                        let motor = r.read_bool();
                        match (dev, model, path, half_track, motor) {
                            (Some(dev), Some(model), Some(path), Some(_), Some(motor))
                                if model <= 2 =>
                            {
                                if !dry_run {
                                    let model = match model {
                                        0 => DriveModel::D1541,
                                        1 => DriveModel::D1571,
                                        _ => DriveModel::D1581,
                                    };
                                    let drive = self.attach_drive(dev, model);
                                    if motor {
                                        drive.start_motor();
                                    }
                                    if !path.is_empty() {
                                        if let Err(e) = self.insert_disk(dev, &path) {
                                            log::warn!("restore: remount failed: {e}");
                                        }
                                    }
                                }
                            }
                            _ => {
                                ok = false;
                                break;
                            }
                        }
                    }
                    ok
                }
                _ => {
                    // Unknown chunks are skipped, not fatal.
                    true
                }
            };
            if !ok {
                return false;
            }
            r.skip_chunk(&chunk);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floppy::{DiskImage, ImageFormat};

    fn machine() -> C64 {
        C64::new(VideoStandard::Ntsc)
    }

    #[test]
    fn stub_machine_runs_a_frame() {
        let mut c64 = machine();
        c64.run_frame();
        assert_eq!(c64.frames_rendered(), 1);
        assert!(c64.cpu.total_cycles() > 0);
    }

    #[test]
    fn frame_reaches_the_presenter_queue() {
        let mut c64 = machine();
        let queue = c64.frame_queue();
        c64.run_frame();
        assert!(queue.frame_pending());
        let seen = queue.with_frame(|px| px.len());
        assert_eq!(seen, Some(crate::vic::WIDTH * crate::vic::HEIGHT));
    }

    #[test]
    fn border_poke_reads_back_open_bus_nibble() {
        // Scenario: STA $D020 with A=0, then read $D020 → $F0.
        let mut c64 = machine();
        // LDA #$00; STA $D020; LDA $D020; STA $02; JMP *
        let prog = [0xA9, 0x00, 0x8D, 0x20, 0xD0, 0xAD, 0x20, 0xD0, 0x85, 0x02, 0x4C, 0x0A, 0x02];
        for (i, &b) in prog.iter().enumerate() {
            c64.bus.ram[0x0200 + i] = b;
        }
        c64.cpu.pc = 0x0200;
        for _ in 0..5 {
            c64.step();
        }
        assert_eq!(c64.bus.ram[0x0002], 0xF0);
    }

    #[test]
    fn cia1_jiffy_interrupts_the_cpu() {
        let mut c64 = machine();
        // Point the IRQ vector at a handler that just spins, enable
        // timer A, and watch the CPU take the interrupt.
        c64.bus.ram[0x0314] = 0x00; // unused soft vector
        // Program: CLI; JMP * at $0200
        c64.bus.ram[0x0200] = 0x58;
        c64.bus.ram[0x0201] = 0x4C;
        c64.bus.ram[0x0202] = 0x01;
        c64.bus.ram[0x0203] = 0x02;
        c64.cpu.pc = 0x0200;

        {
            let MemoryBus { cia1, irq, .. } = &mut c64.bus;
            cia1.write_register(0x0D, 0x81, irq); // enable TA
            cia1.write_register(0x04, 0x20, irq);
            cia1.write_register(0x05, 0x00, irq);
            cia1.write_register(0x0E, 0x01, irq); // start
        }

        let before = c64.cpu_state().pc;
        assert_eq!(before, 0x0200);
        c64.run_cycles(200);
        // The timer underflowed and nothing acknowledged the ICR, so
        // the aggregated line is still held.
        assert!(c64.bus.irq.active());
    }

    #[test]
    fn iec_command_round_trip_to_drive() {
        let mut c64 = machine();
        c64.attach_drive(8, DriveModel::D1541);
        c64.drive_mut(8)
            .unwrap()
            .insert_image(DiskImage::blank(ImageFormat::D64, "BUSDISK", "BD"));

        // Pull ATN low, then clock LISTEN 8 ($28) onto the wire.
        let ch = c64.iec.set_atn_line(true);
        c64.propagate(ch);

        // Let the presence-acknowledge pulse decay before the bits.
        c64.drives[0].drive.tick(16);
        let ch = c64.collect_drive_outputs();
        c64.propagate(ch);
        assert!(c64.iec.lines().data, "DATA released, ready for bits");

        for bit in (0..8).rev() {
            let level = (0x28u8 >> bit) & 1 != 0;
            let ch = c64.iec.set_data_line(!level);
            c64.propagate(ch);
            let ch = c64.iec.set_clk_line(true);
            c64.propagate(ch);
            let ch = c64.iec.set_clk_line(false);
            c64.propagate(ch);
        }

        assert_eq!(c64.iec.listeners(), &[8]);
    }

    #[test]
    fn all_drives_observe_atn() {
        let mut c64 = machine();
        c64.attach_drive(8, DriveModel::D1541);
        c64.attach_drive(9, DriveModel::D1581);

        let ch = c64.iec.set_atn_line(true);
        c64.propagate(ch);
        // Presence acknowledge: both drives pull DATA low.
        assert!(!c64.iec.lines().data, "drives acknowledged ATN");

        let ch = c64.iec.set_atn_line(false);
        c64.propagate(ch);
        assert!(c64.iec.lines().atn);
    }

    #[test]
    fn save_restore_round_trip() {
        let mut c64 = machine();
        c64.bus.ram[0x1234] = 0x42;
        c64.bus.write_direct(0xD800, 0x07);
        c64.cpu.a = 0x99;
        c64.cpu.pc = 0x4321;
        c64.attach_drive(8, DriveModel::D1571);

        let snap = c64.save_state();

        let mut other = machine();
        assert!(other.restore_state(&snap));
        assert_eq!(other.bus.ram[0x1234], 0x42);
        assert_eq!(other.bus.color_ram.peek(0), 0x07);
        assert_eq!(other.cpu.a, 0x99);
        assert_eq!(other.cpu.pc, 0x4321);
        assert!(other.drive(8).is_some());
        assert_eq!(other.drive(8).unwrap().model(), DriveModel::D1571);
    }

    #[test]
    fn malformed_snapshot_leaves_the_machine_untouched() {
        let mut c64 = machine();
        c64.bus.ram[0x2000] = 0x55;
        let mut snap = c64.save_state();

        // Corrupt the RAM chunk payload length deep inside.
        let len = snap.len();
        snap.truncate(len - 4);

        let mut other = machine();
        other.bus.ram[0x2000] = 0xAA;
        // Header stays valid but the last chunk is short: restore must
        // refuse without touching anything.
        assert!(!other.restore_state(&snap));
        assert_eq!(other.bus.ram[0x2000], 0xAA, "no partial mutation");
    }

    #[test]
    fn screen_text_decodes_screen_codes() {
        let mut c64 = machine();
        // "READY." in screen codes at the default matrix.
        let ready = [0x12, 0x05, 0x01, 0x04, 0x19, 0x2E];
        for (i, &b) in ready.iter().enumerate() {
            c64.bus.ram[0x0400 + i] = b;
        }
        let text = c64.screen_text();
        assert!(text.starts_with("READY."), "screen: {}", &text[..40]);
    }

    #[test]
    fn reset_walks_all_components() {
        let mut c64 = machine();
        c64.attach_drive(8, DriveModel::D1541);
        c64.bus.ram[0x0400] = 0x55;
        c64.run_frame();
        c64.reset();
        assert_eq!(c64.bus.ram[0x0400], 0);
        assert_eq!(c64.frames_rendered(), 0);
        assert_eq!(c64.bus.pla.mode_index(), 31);
    }
}
