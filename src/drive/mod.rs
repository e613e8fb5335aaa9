//! Intelligent IEC disk drives: 1541, 1571, 1581.
//!
//! A drive is a machine of its own: a 6502 with its per-model memory
//! map and chips, the disk mechanics, and a serial-bus endpoint.  The
//! protocol engine lives here at the drive level (bit reception on CLK
//! edges, byte acknowledgement on DATA, the talk queue); the VIAs/CIA
//! mirror the wire state for the DOS ROM.
//!
//! The 1541 and the 1571's compatibility path read through a
//! synthesised GCR track stream; the 1571's MFM path and the 1581 go
//! through the WD177x controller.

pub mod cia;
pub mod fdc;
pub mod gcr;
pub mod memory;
pub mod via;

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use crate::cpu::Cpu;
use crate::floppy::{sectors_for_5xx_track, DiskImage, ImageFormat};
use crate::machine::irq::{IrqLine, IrqSource};

use fdc::FdcHost;
use gcr::TrackStream;
use memory::DriveMemory;
use via::{PortBChange, VIA2_PB_DENSITY_MASK, VIA2_PB_MOTOR, VIA2_PB_STEP_MASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveModel {
    D1541,
    D1571,
    D1581,
}

impl DriveModel {
    /// The 1581 runs its CPU at 2 MHz.
    pub fn clock_multiplier(self) -> u32 {
        match self {
            DriveModel::D1581 => 2,
            _ => 1,
        }
    }

    pub fn can_mount(self, format: ImageFormat) -> bool {
        match self {
            DriveModel::D1541 => format == ImageFormat::D64,
            DriveModel::D1571 => matches!(format, ImageFormat::D64 | ImageFormat::D71),
            DriveModel::D1581 => format == ImageFormat::D81,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DriveModel::D1541 => "1541",
            DriveModel::D1571 => "1571",
            DriveModel::D1581 => "1581",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Idle,
    Ready,
    Reading,
    Writing,
    Seeking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveError {
    None,
    NoDisk,
    BadSector,
    ReadError,
    WriteError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveBusState {
    Idle,
    AwaitingCommand,
    Listening,
    Talking,
}

/// Cycles per GCR byte for the four density zones.
const DENSITY_CYCLES: [u32; 4] = [32, 30, 28, 26];

/// One logical file channel (0-14 data, 15 command).
#[derive(Default, Clone)]
struct Channel {
    open: bool,
    name: String,
    name_complete: bool,
    data: Vec<u8>,
}

/// Line levels the drive wants to assert (true = pull low).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveLineState {
    pub clk_low: bool,
    pub data_low: bool,
    pub srq_low: bool,
}

pub struct Drive {
    model: DriveModel,
    device: u8,

    cpu: Cpu,
    pub mem: DriveMemory,
    irq: IrqLine,

    disk: Option<DiskImage>,
    disk_path: String,

    // Mechanics.
    motor_on: bool,
    write_protected: bool,
    half_track: i32,
    current_sector: u8,
    density: u8,
    side: u8,

    status: DriveStatus,
    last_error: DriveError,

    // GCR read channel.
    gcr: TrackStream,
    gcr_pos: usize,
    gcr_bit_counter: u32,
    gcr_dirty: bool,

    // Serial endpoint.
    bus_state: DriveBusState,
    listening: bool,
    talking: bool,
    rx_shift: u8,
    rx_count: u8,
    atn_low: bool,
    clk_level: bool,
    data_level: bool,
    srq_asserted: bool,

    channels: Vec<Channel>,
    secondary: Option<u8>,
    name_pending: bool,

    talk_queue: VecDeque<u8>,
    talk_byte: u8,
    talk_bit_pos: i8,
    waiting_for_ack: bool,

    endpoint_clk_low: bool,
    endpoint_data_low: bool,
    ack_delay: u8,
    byte_ack_hold: bool,

    status_message: String,
}

impl Drive {
    pub fn new(device: u8, model: DriveModel) -> Self {
        let mem = match model {
            DriveModel::D1541 => DriveMemory::new_1541(),
            DriveModel::D1571 => DriveMemory::new_1571(),
            DriveModel::D1581 => DriveMemory::new_1581(),
        };
        let mut drive = Self {
            model,
            device,
            cpu: Cpu::new(),
            mem,
            irq: IrqLine::new(),
            disk: None,
            disk_path: String::new(),
            motor_on: false,
            write_protected: false,
            half_track: 17 * 2,
            current_sector: 0,
            density: 3,
            side: 0,
            status: DriveStatus::Idle,
            last_error: DriveError::None,
            gcr: TrackStream::default(),
            gcr_pos: 0,
            gcr_bit_counter: 0,
            gcr_dirty: true,
            bus_state: DriveBusState::Idle,
            listening: false,
            talking: false,
            rx_shift: 0,
            rx_count: 0,
            atn_low: false,
            clk_level: true,
            data_level: true,
            srq_asserted: false,
            channels: vec![Channel::default(); 16],
            secondary: None,
            name_pending: false,
            talk_queue: VecDeque::new(),
            talk_byte: 0,
            talk_bit_pos: -1,
            waiting_for_ack: false,
            endpoint_clk_low: false,
            endpoint_data_low: false,
            ack_delay: 0,
            byte_ack_hold: false,
            status_message: String::new(),
        };
        drive.reset();
        drive
    }

    pub fn model(&self) -> DriveModel {
        self.model
    }

    pub fn device_number(&self) -> u8 {
        self.device
    }

    pub fn set_rom(&mut self, image: Option<&[u8]>) {
        self.mem.set_rom(image);
    }

    pub fn reset(&mut self) {
        self.motor_on = false;
        self.status = DriveStatus::Idle;
        self.last_error = DriveError::None;
        self.half_track = 17 * 2;
        self.current_sector = 0;
        self.density = 3;
        self.side = 0;

        self.bus_state = DriveBusState::Idle;
        self.listening = false;
        self.talking = false;
        self.rx_shift = 0;
        self.rx_count = 0;
        self.atn_low = false;
        self.clk_level = true;
        self.data_level = true;
        self.srq_asserted = false;
        self.channels = vec![Channel::default(); 16];
        self.secondary = None;
        self.name_pending = false;
        self.talk_queue.clear();
        self.talk_bit_pos = -1;
        self.waiting_for_ack = false;
        self.endpoint_clk_low = false;
        self.endpoint_data_low = false;
        self.ack_delay = 0;
        self.byte_ack_hold = false;
        self.status_message = "73,BREADBIN DOS V1,00,00\r".to_string();

        self.gcr = TrackStream::default();
        self.gcr_pos = 0;
        self.gcr_bit_counter = 0;
        self.gcr_dirty = true;

        self.mem.reset();
        self.irq.clear_all();
        self.cpu.reset(&mut self.mem);
    }

    // ── Media ─────────────────────────────────────────────────

    pub fn can_mount(&self, format: ImageFormat) -> bool {
        self.model.can_mount(format)
    }

    pub fn insert_disk<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let format = ImageFormat::detect(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "unknown disk image type")
        })?;
        if !self.can_mount(format) {
            self.last_error = DriveError::NoDisk;
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("a {} cannot mount {} images", self.model.name(), format),
            ));
        }
        let image = DiskImage::open(path)?;
        self.disk_path = path.display().to_string();
        self.insert_image(image);
        Ok(())
    }

    /// Mount an already-built image (tests, blank disks).
    pub fn insert_image(&mut self, image: DiskImage) {
        self.disk = Some(image);
        self.write_protected = false;
        self.last_error = DriveError::None;
        self.status = DriveStatus::Ready;
        self.half_track = 17 * 2;
        self.current_sector = 0;
        self.gcr_dirty = true;
        self.gcr_pos = 0;
        if let Some(via2) = self.mem.via2_mut() {
            via2.set_write_protect(false);
        }
        self.status_message = "00, OK,00,00\r".to_string();
    }

    pub fn unload_disk(&mut self) {
        self.disk = None;
        self.disk_path.clear();
        self.status = DriveStatus::Idle;
        self.last_error = DriveError::None;
        self.gcr = TrackStream::default();
        self.gcr_dirty = true;
    }

    pub fn is_disk_loaded(&self) -> bool {
        self.disk.is_some()
    }

    pub fn disk(&self) -> Option<&DiskImage> {
        self.disk.as_ref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut DiskImage> {
        self.disk.as_mut()
    }

    pub fn loaded_disk_path(&self) -> &str {
        &self.disk_path
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
        if let Some(via2) = self.mem.via2_mut() {
            via2.set_write_protect(protected);
        }
    }

    // ── Status / monitor ──────────────────────────────────────

    pub fn status(&self) -> DriveStatus {
        self.status
    }

    pub fn last_error(&self) -> DriveError {
        self.last_error
    }

    pub fn current_track(&self) -> u8 {
        (self.half_track / 2) as u8
    }

    pub fn current_sector(&self) -> u8 {
        self.current_sector
    }

    pub fn half_track(&self) -> i32 {
        self.half_track
    }

    pub fn density_code(&self) -> u8 {
        self.density
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    pub fn start_motor(&mut self) {
        self.motor_on = true;
    }

    pub fn stop_motor(&mut self) {
        self.motor_on = false;
    }

    pub fn cpu_state(&self) -> crate::cpu::CpuState {
        self.cpu.state()
    }

    pub fn is_srq_asserted(&self) -> bool {
        self.srq_asserted
    }

    pub fn current_side(&self) -> u8 {
        self.side
    }

    pub fn set_side(&mut self, side1: bool) {
        let new = side1 as u8;
        if new != self.side {
            self.side = new;
            self.gcr_dirty = true;
        }
    }

    // ── Mechanics decode ──────────────────────────────────────

    fn set_density(&mut self, code: u8) {
        let code = code & 0x03;
        if code != self.density {
            self.density = code;
        }
    }

    /// Stepper phase change: a quarter-turn forward is one half-track in.
    fn on_stepper_phase_change(&mut self, old_phase: u8, new_phase: u8) {
        let old_idx = (old_phase & 0x03) as i32 * 2;
        let new_idx = (new_phase & 0x03) as i32 * 2;
        if old_idx == new_idx {
            return;
        }
        let delta = ((new_idx - old_idx) + 8) & 7;
        let step = match delta {
            2 => 1,
            6 => -1,
            _ => return,
        };
        self.half_track = (self.half_track + step).clamp(0, 34 * 2);
        self.gcr_dirty = true;
        self.status = DriveStatus::Seeking;
        log::trace!(
            "drive {}: stepped to half-track {} (track {})",
            self.device,
            self.half_track,
            self.current_track() + 1
        );
    }

    fn apply_mech_change(&mut self, change: PortBChange) {
        let old_phase = change.old & VIA2_PB_STEP_MASK;
        let new_phase = change.new & VIA2_PB_STEP_MASK;
        if old_phase != new_phase {
            self.on_stepper_phase_change(old_phase, new_phase);
        }
        self.motor_on = change.new & VIA2_PB_MOTOR != 0;
        self.set_density((change.new & VIA2_PB_DENSITY_MASK) >> 5);
    }

    // ── GCR read path ─────────────────────────────────────────

    fn gcr_mode(&self) -> bool {
        self.model != DriveModel::D1581
    }

    fn rebuild_gcr_stream(&mut self) {
        let Some(disk) = &self.disk else {
            self.gcr = TrackStream::default();
            return;
        };
        let side_track = self.current_track() + 1; // 1..35
        let image_track = match (self.model, disk.format()) {
            (DriveModel::D1571, ImageFormat::D71) if self.side == 1 => side_track + 35,
            _ => side_track,
        };
        let sectors = sectors_for_5xx_track(side_track as u16);
        self.gcr = gcr::build_track_stream(disk, side_track, image_track, sectors);
        if self.gcr.is_empty() {
            self.gcr_pos = 0;
        } else {
            self.gcr_pos %= self.gcr.len();
        }
        if let Some(via2) = self.mem.via2_mut() {
            via2.clear_byte_pending();
        }
    }

    fn gcr_advance(&mut self, cycles: u32) {
        let cycles_per_byte = DENSITY_CYCLES[(self.density & 0x03) as usize];
        self.gcr_bit_counter += cycles;
        while self.gcr_bit_counter >= cycles_per_byte {
            self.gcr_bit_counter -= cycles_per_byte;
            self.gcr_deliver_byte();
        }
    }

    fn gcr_deliver_byte(&mut self) {
        if self.gcr_dirty {
            self.rebuild_gcr_stream();
            self.gcr_dirty = false;
        }
        if self.gcr.is_empty() {
            return;
        }
        let byte = self.gcr.data[self.gcr_pos];
        let sync = self.gcr.sync[self.gcr_pos];
        self.gcr_pos = (self.gcr_pos + 1) % self.gcr.len();
        if let Some(via2) = self.mem.via2_mut() {
            via2.disk_byte_from_media(byte, sync);
        }
        if !sync {
            // Byte-ready is wired to the drive CPU's SO pin.
            self.cpu.pulse_so();
        }
    }

    // ── Tick ──────────────────────────────────────────────────

    /// Advance the drive by `cycles` drive-clock cycles (the caller
    /// already applied the model's clock multiplier).
    pub fn tick(&mut self, cycles: u32) {
        let mut remaining = cycles as i64;
        while remaining > 0 {
            let dc = self.cpu.tick(&mut self.mem).max(1);
            self.mem.tick_chips(dc);

            // Mechanics follow VIA2 port writes.
            if let Some(via2) = self.mem.via2_mut() {
                if let Some(change) = via2.take_port_b_change() {
                    self.apply_mech_change(change);
                }
            }

            // The FDC serves its media work against our disk.
            self.service_fdc(dc);

            if self.motor_on && self.disk.is_some() && self.gcr_mode() {
                self.gcr_advance(dc);
            }

            // Release the byte-acknowledge pulse.
            if self.ack_delay > 0 {
                self.ack_delay -= 1;
                if self.ack_delay == 0 {
                    self.endpoint_data_low = false;
                    self.byte_ack_hold = false;
                }
            }

            // Drive-local interrupt aggregation.
            self.irq
                .set(IrqSource::DriveVia1, self.mem.irq_pending());
            self.cpu.set_irq_line(self.irq.active());

            remaining -= dc as i64;
        }
    }

    fn service_fdc(&mut self, cycles: u32) {
        let Drive {
            mem,
            disk,
            side,
            write_protected,
            model,
            ..
        } = self;
        if let Some(fdc) = mem.fdc_mut() {
            let mut host = MediaHost {
                disk: disk.as_mut(),
                side: *side,
                write_protected: *write_protected,
                model: *model,
            };
            fdc.tick(cycles, &mut host);
        }
    }

    // ── Bus line wiring ───────────────────────────────────────

    /// The line levels this drive currently wants to drive low.
    pub fn line_outputs(&mut self) -> DriveLineState {
        let mut state = DriveLineState {
            clk_low: self.endpoint_clk_low,
            data_low: self.endpoint_data_low,
            srq_low: self.srq_asserted,
        };
        // The DOS ROM drives through VIA1's port pins.
        if let Some(via1) = self.mem.via1_mut() {
            let pins = via1.port_b_pins();
            if pins & via::VIA1_PB_CLK_OUT != 0 {
                state.clk_low = true;
            }
            if pins & via::VIA1_PB_DATA_OUT != 0 {
                state.data_low = true;
            }
        }
        // The 1571/1581 CIA's auto-acknowledge latch.
        if let Some(cia) = self.mem.cia_mut() {
            if cia.wants_data_low() {
                state.data_low = true;
            }
        }
        state
    }

    pub fn set_srq_asserted(&mut self, asserted: bool) {
        self.srq_asserted = asserted;
    }

    // ── IEC notifications from the machine ────────────────────

    pub fn atn_changed(&mut self, atn_low: bool) {
        if atn_low == self.atn_low {
            return;
        }
        self.atn_low = atn_low;
        self.mirror_lines_into_chips();

        if atn_low {
            self.bus_state = DriveBusState::AwaitingCommand;
            self.rx_shift = 0;
            self.rx_count = 0;
            // Device-present acknowledge: a short DATA pulse that the
            // next few drive cycles release again.
            self.pulse_data_ack();
        } else {
            if self.bus_state == DriveBusState::AwaitingCommand {
                self.bus_state = if self.listening {
                    DriveBusState::Listening
                } else if self.talking {
                    DriveBusState::Talking
                } else {
                    DriveBusState::Idle
                };
            }
            // ATN release clears any acknowledge still in flight.
            self.endpoint_data_low = false;
            self.byte_ack_hold = false;
            self.ack_delay = 0;
        }
    }

    pub fn clk_changed(&mut self, level: bool, data_level: bool) {
        if level == self.clk_level {
            return;
        }
        let falling = self.clk_level && !level;
        self.clk_level = level;
        self.mirror_lines_into_chips();

        if self.atn_low {
            // Command bits are decoded by the bus; nothing to shift here.
            return;
        }

        match self.bus_state {
            DriveBusState::Listening => {
                if !falling || self.byte_ack_hold {
                    return;
                }
                self.rx_shift = (self.rx_shift << 1) | data_level as u8;
                self.rx_count += 1;
                if self.rx_count >= 8 {
                    let byte = self.rx_shift;
                    self.rx_shift = 0;
                    self.rx_count = 0;
                    self.receive_data_byte(byte);
                    self.pulse_data_ack();
                }
            }
            DriveBusState::Talking => {
                if self.waiting_for_ack {
                    return;
                }
                // Bits go out on the falling edge and stay stable until
                // the rising edge advances the shifter.
                if falling {
                    self.talk_output_bit();
                } else {
                    self.talk_advance_bit();
                }
            }
            _ => {}
        }
    }

    pub fn data_changed(&mut self, level: bool) {
        if level == self.data_level {
            return;
        }
        self.data_level = level;
        self.mirror_lines_into_chips();

        if self.bus_state == DriveBusState::Talking && self.waiting_for_ack && !level {
            // Listener acknowledged the byte.
            self.waiting_for_ack = false;
            self.talk_bit_pos = -1;
            self.endpoint_data_low = false;
        }
    }

    pub fn srq_changed(&mut self, _level: bool) {}

    fn mirror_lines_into_chips(&mut self) {
        let (atn, clk, data) = (self.atn_low, !self.clk_level, !self.data_level);
        if let Some(via1) = self.mem.via1_mut() {
            via1.set_iec_inputs(atn, clk, data);
        }
        if let Some(cia) = self.mem.cia_mut() {
            cia.set_iec_inputs(atn, clk, data);
        }
    }

    /// Byte-level acknowledge: pull DATA low briefly.
    pub fn pulse_data_ack(&mut self) {
        self.endpoint_data_low = true;
        self.ack_delay = 2;
        self.byte_ack_hold = true;
    }

    // ── IEC command callbacks ─────────────────────────────────

    pub fn on_listen(&mut self) {
        self.listening = true;
        self.talking = false;
        self.rx_shift = 0;
        self.rx_count = 0;
    }

    pub fn on_unlisten(&mut self) {
        if self.listening {
            self.finish_reception();
        }
        self.listening = false;
        if self.bus_state == DriveBusState::Listening {
            self.bus_state = DriveBusState::Idle;
        }
        self.endpoint_data_low = false;
        self.rx_shift = 0;
        self.rx_count = 0;
    }

    pub fn on_talk(&mut self) {
        self.talking = true;
        self.listening = false;
        self.rx_shift = 0;
        self.rx_count = 0;
        self.talk_bit_pos = -1;
        self.waiting_for_ack = false;
        if !self.atn_low {
            self.bus_state = DriveBusState::Talking;
        }
    }

    pub fn on_untalk(&mut self) {
        self.talking = false;
        if self.bus_state == DriveBusState::Talking {
            self.bus_state = DriveBusState::Idle;
        }
        self.talk_bit_pos = -1;
        self.waiting_for_ack = false;
        self.endpoint_clk_low = false;
        self.endpoint_data_low = false;
    }

    /// A secondary address arrived under ATN.
    pub fn on_secondary_address(&mut self, sa: u8) {
        let chan = (sa & 0x0F) as usize;
        self.secondary = Some(sa & 0x0F);
        if self.listening {
            self.bus_state = DriveBusState::Listening;
        }
        if self.talking {
            self.begin_talk(chan as u8);
        }
        self.name_pending = false;
    }

    pub fn on_open_channel(&mut self, chan: u8) {
        let c = (chan & 0x0F) as usize;
        self.secondary = Some(chan & 0x0F);
        self.channels[c] = Channel {
            open: true,
            ..Channel::default()
        };
        self.name_pending = true;
        if self.listening {
            self.bus_state = DriveBusState::Listening;
        }
    }

    pub fn on_close_channel(&mut self, chan: u8) {
        let c = (chan & 0x0F) as usize;
        self.finalize_channel(c);
        self.channels[c].open = false;
        if self.secondary == Some(chan & 0x0F) {
            self.secondary = None;
        }
    }

    // ── Data path ─────────────────────────────────────────────

    fn receive_data_byte(&mut self, byte: u8) {
        let Some(chan) = self.secondary else {
            return;
        };
        let c = chan as usize;
        if self.name_pending {
            self.channels[c]
                .name
                .push(crate::petscii::petscii_to_ascii(byte));
        } else {
            self.channels[c].data.push(byte);
        }
    }

    fn finish_reception(&mut self) {
        let Some(chan) = self.secondary else {
            return;
        };
        let c = chan as usize;
        if self.name_pending {
            self.channels[c].name = self.channels[c].name.trim().to_string();
            self.channels[c].name_complete = true;
            self.name_pending = false;
            if chan == 15 && !self.channels[c].name.is_empty() {
                // Command channel: the "name" is the DOS command.
                let cmd = std::mem::take(&mut self.channels[c].name);
                self.execute_dos_command(&cmd);
            }
        } else if chan == 15 && !self.channels[c].data.is_empty() {
            let cmd: String = self.channels[c]
                .data
                .drain(..)
                .map(crate::petscii::petscii_to_ascii)
                .collect();
            self.execute_dos_command(cmd.trim());
        }
    }

    fn finalize_channel(&mut self, c: usize) {
        // The save channel commits its buffered payload on close.
        if c != 15 && self.channels[c].open && !self.channels[c].data.is_empty() {
            let name = self.channels[c].name.clone();
            let data = std::mem::take(&mut self.channels[c].data);
            if name.is_empty() || name == "$" {
                return;
            }
            match &mut self.disk {
                Some(disk) => {
                    if self.write_protected {
                        self.last_error = DriveError::WriteError;
                        self.status_message = "26,WRITE PROTECT ON,00,00\r".to_string();
                    } else if disk.write_file(&name, &data) {
                        self.status_message = "00, OK,00,00\r".to_string();
                    } else {
                        self.last_error = DriveError::WriteError;
                        self.status_message = "72,DISK FULL,00,00\r".to_string();
                    }
                }
                None => {
                    self.last_error = DriveError::NoDisk;
                    self.status_message = "74,DRIVE NOT READY,00,00\r".to_string();
                }
            }
        }
    }

    fn begin_talk(&mut self, chan: u8) {
        self.talk_queue.clear();
        self.talk_bit_pos = -1;
        self.waiting_for_ack = false;
        self.status = DriveStatus::Reading;

        if chan == 15 {
            for b in self.status_message.bytes() {
                self.talk_queue.push_back(b);
            }
            self.status_message = "00, OK,00,00\r".to_string();
            return;
        }

        let name = self.channels[chan as usize].name.clone();
        let Some(disk) = &self.disk else {
            self.last_error = DriveError::NoDisk;
            self.status_message = "74,DRIVE NOT READY,00,00\r".to_string();
            return;
        };

        if name == "$" || name.is_empty() {
            for b in disk.directory_listing() {
                self.talk_queue.push_back(b);
            }
            return;
        }
        match disk.load_file(&name) {
            Some(data) => {
                for b in data {
                    self.talk_queue.push_back(b);
                }
                self.status_message = "00, OK,00,00\r".to_string();
            }
            None => {
                self.last_error = DriveError::ReadError;
                self.status_message = "62, FILE NOT FOUND,00,00\r".to_string();
            }
        }
    }

    fn talk_output_bit(&mut self) {
        if self.talk_bit_pos < 0 {
            match self.talk_queue.pop_front() {
                Some(byte) => {
                    self.talk_byte = byte;
                    self.talk_bit_pos = 7;
                }
                None => {
                    // Stream exhausted.
                    self.endpoint_data_low = false;
                    self.bus_state = DriveBusState::Idle;
                    self.status = DriveStatus::Ready;
                    return;
                }
            }
        }

        let bit = (self.talk_byte >> self.talk_bit_pos) & 1;
        // The wire is active-low: a zero bit pulls DATA down.
        self.endpoint_data_low = bit == 0;
    }

    fn talk_advance_bit(&mut self) {
        if self.talk_bit_pos == 0 {
            // Byte complete: release DATA and wait for the listener.
            self.talk_bit_pos = -1;
            self.endpoint_data_low = false;
            self.waiting_for_ack = true;
        } else if self.talk_bit_pos > 0 {
            self.talk_bit_pos -= 1;
        }
    }

    pub fn pending_talk_bytes(&self) -> usize {
        self.talk_queue.len()
    }

    // ── DOS command channel ───────────────────────────────────

    fn execute_dos_command(&mut self, cmd: &str) {
        let cmd = cmd.trim_end_matches('\r').trim();
        if cmd.is_empty() {
            return;
        }
        log::debug!("drive {}: dos command {:?}", self.device, cmd);

        if self.disk.is_none() && !cmd.starts_with('U') && !cmd.starts_with('I') {
            self.last_error = DriveError::NoDisk;
            self.status_message = "74,DRIVE NOT READY,00,00\r".to_string();
            return;
        }

        let ok = "00, OK,00,00\r".to_string();
        let after_colon = |s: &str| s.split_once(':').map(|(_, r)| r.to_string());

        match cmd.chars().next().unwrap_or(' ') {
            'I' => {
                // Initialize: re-read the BAM (our image is always live).
                self.gcr_dirty = true;
                self.status_message = ok;
            }
            'V' => {
                self.status_message = ok;
            }
            'U' => {
                // UJ: soft reset.
                self.reset();
            }
            'N' => {
                // N0:NAME,ID — format.
                let Some(rest) = after_colon(cmd) else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let (name, id) = match rest.split_once(',') {
                    Some((n, i)) => (n.to_string(), i.to_string()),
                    None => (rest, "00".to_string()),
                };
                if self.write_protected {
                    self.status_message = "26,WRITE PROTECT ON,00,00\r".to_string();
                    return;
                }
                if let Some(disk) = &mut self.disk {
                    disk.format_disk(&name, &id);
                    self.gcr_dirty = true;
                    self.status_message = ok;
                }
            }
            'S' => {
                // S0:NAME — scratch.
                let Some(name) = after_colon(cmd) else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let mut scratched = 0;
                if let Some(disk) = &mut self.disk {
                    if disk.delete_file(&name) {
                        scratched = 1;
                    }
                }
                self.status_message = format!("01,FILES SCRATCHED,{scratched:02},00\r");
            }
            'R' => {
                // R0:NEW=OLD — rename.
                let Some(rest) = after_colon(cmd) else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let Some((new, old)) = rest.split_once('=') else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let renamed = self
                    .disk
                    .as_mut()
                    .map(|d| d.rename_file(old, new))
                    .unwrap_or(false);
                self.status_message = if renamed {
                    ok
                } else {
                    "62, FILE NOT FOUND,00,00\r".to_string()
                };
            }
            'C' => {
                // C0:NEW=OLD — copy.
                let Some(rest) = after_colon(cmd) else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let Some((new, old)) = rest.split_once('=') else {
                    self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
                    return;
                };
                let copied = self
                    .disk
                    .as_mut()
                    .map(|d| d.copy_file(old, new))
                    .unwrap_or(false);
                self.status_message = if copied {
                    ok
                } else {
                    "62, FILE NOT FOUND,00,00\r".to_string()
                };
            }
            _ => {
                self.status_message = "31,SYNTAX ERROR,00,00\r".to_string();
            }
        }
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }
}

/// FDC media host: maps controller cylinder/side to image tracks.
struct MediaHost<'a> {
    disk: Option<&'a mut DiskImage>,
    side: u8,
    write_protected: bool,
    model: DriveModel,
}

impl MediaHost<'_> {
    fn image_track(&self, cylinder: u8) -> u8 {
        match self.model {
            // D81: track = side*80 + cylinder + 1.
            DriveModel::D1581 => self.side * 80 + cylinder + 1,
            // D71 MFM side 1 sits at +35.
            DriveModel::D1571 => cylinder + 1 + self.side * 35,
            DriveModel::D1541 => cylinder + 1,
        }
    }
}

impl FdcHost for MediaHost<'_> {
    fn read_sector(&mut self, track: u8, sector: u8, buf: &mut [u8]) -> bool {
        let image_track = self.image_track(track);
        let Some(disk) = &self.disk else {
            return false;
        };
        match disk.read_sector(image_track, sector) {
            Some(data) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                true
            }
            None => false,
        }
    }

    fn write_sector(&mut self, track: u8, sector: u8, buf: &[u8]) -> bool {
        let image_track = self.image_track(track);
        match &mut self.disk {
            Some(disk) => disk.write_sector(image_track, sector, buf),
            None => false,
        }
    }

    fn write_protected(&self) -> bool {
        self.write_protected
    }

    fn disk_present(&self) -> bool {
        self.disk.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floppy::ImageFormat;

    fn drive_1541_with_disk() -> Drive {
        let mut d = Drive::new(8, DriveModel::D1541);
        d.insert_image(DiskImage::blank(ImageFormat::D64, "TESTDISK", "TD"));
        d
    }

    /// Clock eight bits of `byte` into a listening drive, MSB first.
    fn send_byte(d: &mut Drive, byte: u8) {
        for bit in (0..8).rev() {
            let level = (byte >> bit) & 1 != 0;
            d.clk_changed(true, level);
            d.clk_changed(false, level);
        }
        // Let the acknowledge pulse play out.
        d.tick(8);
    }

    #[test]
    fn mount_rules_follow_the_model() {
        let d41 = Drive::new(8, DriveModel::D1541);
        assert!(d41.can_mount(ImageFormat::D64));
        assert!(!d41.can_mount(ImageFormat::D71));
        assert!(!d41.can_mount(ImageFormat::D81));

        let d71 = Drive::new(9, DriveModel::D1571);
        assert!(d71.can_mount(ImageFormat::D64));
        assert!(d71.can_mount(ImageFormat::D71));

        let d81 = Drive::new(10, DriveModel::D1581);
        assert!(d81.can_mount(ImageFormat::D81));
        assert!(!d81.can_mount(ImageFormat::D64));
        assert_eq!(d81.model().clock_multiplier(), 2);
    }

    #[test]
    fn stepper_quarter_turns_move_half_tracks() {
        let mut d = drive_1541_with_disk();
        let start = d.half_track();
        // Forward: phase 0 → 1.
        d.on_stepper_phase_change(0, 1);
        assert_eq!(d.half_track(), start + 1);
        d.on_stepper_phase_change(1, 2);
        assert_eq!(d.half_track(), start + 2);
        assert_eq!(d.current_track(), (start / 2 + 1) as u8);
        // Backward: phase 2 → 1.
        d.on_stepper_phase_change(2, 1);
        assert_eq!(d.half_track(), start + 1);
        // Illegal two-phase jump is ignored.
        d.on_stepper_phase_change(1, 3);
        assert_eq!(d.half_track(), start + 1);
    }

    #[test]
    fn half_track_clamps_to_the_rails() {
        let mut d = drive_1541_with_disk();
        for _ in 0..200 {
            let p = (d.half_track() % 4) as u8;
            d.on_stepper_phase_change(p & 3, (p + 1) & 3);
        }
        assert_eq!(d.half_track(), 68);
        assert_eq!(d.current_track(), 34);
    }

    #[test]
    fn gcr_bytes_reach_via2_when_the_motor_spins() {
        let mut d = drive_1541_with_disk();
        d.start_motor();
        // density 3 = 26 cycles per byte; run enough for several bytes.
        d.tick(26 * 16);
        let via2 = d.mem.via2_mut().unwrap();
        // The stream starts with a $55 lead-in gap.
        assert_eq!(via2.read_register(0x01), 0x55);
    }

    #[test]
    fn listen_open_receives_a_filename() {
        let mut d = drive_1541_with_disk();
        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(0);
        d.atn_changed(false);
        assert_eq!(d.bus_state, DriveBusState::Listening);

        for &b in b"$" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();
        assert_eq!(d.channels[0].name, "$");
        assert!(d.channels[0].name_complete);
    }

    #[test]
    fn talk_streams_the_directory_listing() {
        let mut d = drive_1541_with_disk();
        d.disk_mut().unwrap().write_file("GAME", b"payload");

        // LOAD"$": open channel 0 with "$", then TALK + reopen.
        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(0);
        d.atn_changed(false);
        send_byte(&mut d, b'$');
        d.on_unlisten();

        d.atn_changed(true);
        d.on_talk();
        d.on_secondary_address(0);
        d.atn_changed(false);

        assert!(d.pending_talk_bytes() > 0);

        // Clock the whole stream out, acknowledging every byte: bits
        // appear on falling CLK edges and stay stable until the rise.
        let mut out = Vec::new();
        let mut guard = 0;
        while (d.pending_talk_bytes() > 0 || d.talk_bit_pos >= 0) && guard < 200_000 {
            guard += 1;
            let mut byte = 0u8;
            for _ in 0..8 {
                d.clk_changed(false, true);
                byte = (byte << 1) | (!d.line_outputs().data_low) as u8;
                d.clk_changed(true, true);
            }
            out.push(byte);
            d.data_changed(false);
            d.data_changed(true);
        }

        let listing = String::from_utf8_lossy(&out).to_string();
        assert!(listing.contains("TESTDISK"), "listing: {listing}");
        assert!(listing.contains("GAME"));
        assert!(listing.contains("BLOCKS FREE"));
    }

    #[test]
    fn command_channel_scratches_files() {
        let mut d = drive_1541_with_disk();
        d.disk_mut().unwrap().write_file("DOOMED", b"bytes");
        assert!(d.disk().unwrap().load_file("DOOMED").is_some());

        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(15);
        d.atn_changed(false);
        for &b in b"S0:DOOMED" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();

        assert!(d.disk().unwrap().load_file("DOOMED").is_none());
        assert!(d.status_message().contains("FILES SCRATCHED"));
    }

    #[test]
    fn command_channel_renames_and_copies() {
        let mut d = drive_1541_with_disk();
        d.disk_mut().unwrap().write_file("OLD", b"abc");

        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(15);
        d.atn_changed(false);
        for &b in b"R0:NEW=OLD" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();
        assert!(d.disk().unwrap().load_file("NEW").is_some());
        assert!(d.disk().unwrap().load_file("OLD").is_none());

        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(15);
        d.atn_changed(false);
        for &b in b"C0:COPY=NEW" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();
        assert_eq!(d.disk().unwrap().load_file("COPY").unwrap(), b"abc");
    }

    #[test]
    fn save_channel_writes_a_file_on_close() {
        let mut d = drive_1541_with_disk();

        // OPEN 1,8,1,"SAVED"
        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(1);
        d.atn_changed(false);
        for &b in b"SAVED" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();

        // Payload on the same channel.
        d.atn_changed(true);
        d.on_listen();
        d.on_secondary_address(1);
        d.atn_changed(false);
        for &b in b"ABCDEF" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();
        d.on_close_channel(1);

        let data = d.disk().unwrap().load_file("SAVED").unwrap();
        assert_eq!(data, b"ABCDEF");
    }

    #[test]
    fn file_not_found_sets_the_error_channel() {
        let mut d = drive_1541_with_disk();
        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(0);
        d.atn_changed(false);
        for &b in b"MISSING" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();

        d.atn_changed(true);
        d.on_talk();
        d.on_secondary_address(0);
        d.atn_changed(false);
        assert_eq!(d.pending_talk_bytes(), 0);
        assert_eq!(d.last_error(), DriveError::ReadError);
        assert!(d.status_message().contains("FILE NOT FOUND"));
    }

    #[test]
    fn write_protect_blocks_saves() {
        let mut d = drive_1541_with_disk();
        d.set_write_protected(true);

        d.atn_changed(true);
        d.on_listen();
        d.on_open_channel(1);
        d.atn_changed(false);
        for &b in b"NOPE" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();

        d.atn_changed(true);
        d.on_listen();
        d.on_secondary_address(1);
        d.atn_changed(false);
        for &b in b"XYZ" {
            send_byte(&mut d, b);
        }
        d.on_unlisten();
        d.on_close_channel(1);

        assert!(d.disk().unwrap().load_file("NOPE").is_none());
        assert_eq!(d.last_error(), DriveError::WriteError);
    }

    #[test]
    fn d71_side_one_maps_to_upper_tracks() {
        let mut d = Drive::new(9, DriveModel::D1571);
        d.insert_image(DiskImage::blank(ImageFormat::D71, "FLIP", "71"));
        d.set_side(true);
        assert_eq!(d.current_side(), 1);
        // Rebuild picks the +35 track.
        d.start_motor();
        d.tick(26 * 8);
        // Just confirm the stream built without panicking and the drive
        // tracked the side change.
        assert!(d.mem.via2_mut().is_some());
    }
}
