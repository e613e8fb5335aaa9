//! The serial IEC bus: four open-collector wires shared by the C64 and
//! up to eight peripherals.
//!
//! A wire reads high only when nobody pulls it low:
//! `line = !(c64_drives_low || any_peripheral_drives_low)`.
//!
//! While ATN is held low the bus snoops command bytes off the wire (one
//! bit per CLK falling edge, MSB first) and dispatches them by high
//! nibble: LISTEN/UNLISTEN/TALK/UNTALK and the secondary-address group.
//! Ownership in the emulator is tree-shaped, so bus mutators return
//! which lines changed and the machine fans the notifications out to the
//! peripherals and CIA2.

/// Highest device number addressable on the bus.
pub const MAX_DEVICE: usize = 31;

/// Line levels; `true` = released/high.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IecLines {
    pub atn: bool,
    pub clk: bool,
    pub data: bool,
    pub srq: bool,
}

impl Default for IecLines {
    fn default() -> Self {
        Self {
            atn: true,
            clk: true,
            data: true,
            srq: true,
        }
    }
}

/// Which lines changed level after a bus mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineChanges {
    pub atn: bool,
    pub clk: bool,
    pub data: bool,
    pub srq: bool,
}

impl LineChanges {
    pub fn any(&self) -> bool {
        self.atn || self.clk || self.data || self.srq
    }

    pub fn merge(&mut self, other: LineChanges) {
        self.atn |= other.atn;
        self.clk |= other.clk;
        self.data |= other.data;
        self.srq |= other.srq;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Attention,
    Listen,
    Talk,
    Unlisten,
    Untalk,
}

/// A decoded command byte from the ATN phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCommand {
    Listen(u8),
    Unlisten,
    Talk(u8),
    Untalk,
    /// Reopen an already-open channel.
    Secondary(u8),
    Open(u8),
    Close(u8),
}

pub struct IecBus {
    // C64-side drivers.
    c64_atn_low: bool,
    c64_clk_low: bool,
    c64_data_low: bool,

    // Peripheral drivers, indexed by device number.
    periph_atn_low: [bool; MAX_DEVICE],
    periph_clk_low: [bool; MAX_DEVICE],
    periph_data_low: [bool; MAX_DEVICE],
    periph_srq_low: [bool; MAX_DEVICE],
    registered: [bool; MAX_DEVICE],

    lines: IecLines,
    state: BusState,
    current_talker: Option<u8>,
    listeners: Vec<u8>,

    // ATN-phase command shifter.
    cmd_shift: u8,
    cmd_bits: u8,
}

impl IecBus {
    pub fn new() -> Self {
        Self {
            c64_atn_low: false,
            c64_clk_low: false,
            c64_data_low: false,
            periph_atn_low: [false; MAX_DEVICE],
            periph_clk_low: [false; MAX_DEVICE],
            periph_data_low: [false; MAX_DEVICE],
            periph_srq_low: [false; MAX_DEVICE],
            registered: [false; MAX_DEVICE],
            lines: IecLines::default(),
            state: BusState::Idle,
            current_talker: None,
            listeners: Vec::new(),
            cmd_shift: 0,
            cmd_bits: 0,
        }
    }

    pub fn reset(&mut self) {
        let registered = self.registered;
        *self = Self::new();
        self.registered = registered;
    }

    pub fn lines(&self) -> IecLines {
        self.lines
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn current_talker(&self) -> Option<u8> {
        self.current_talker
    }

    pub fn listeners(&self) -> &[u8] {
        &self.listeners
    }

    pub fn register_device(&mut self, device: u8) {
        if (device as usize) < MAX_DEVICE {
            self.registered[device as usize] = true;
        }
    }

    pub fn unregister_device(&mut self, device: u8) -> LineChanges {
        let d = device as usize;
        if d >= MAX_DEVICE || !self.registered[d] {
            return LineChanges::default();
        }
        self.registered[d] = false;
        self.periph_atn_low[d] = false;
        self.periph_clk_low[d] = false;
        self.periph_data_low[d] = false;
        self.periph_srq_low[d] = false;
        if self.current_talker == Some(device) {
            self.current_talker = None;
        }
        self.listeners.retain(|&l| l != device);
        self.recompute()
    }

    pub fn registered_devices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_DEVICE as u8).filter(move |&d| self.registered[d as usize])
    }

    // ── Level arbitration ─────────────────────────────────────

    fn recompute(&mut self) -> LineChanges {
        let old = self.lines;
        let any = |flags: &[bool; MAX_DEVICE]| flags.iter().any(|&f| f);

        self.lines.atn = !(self.c64_atn_low || any(&self.periph_atn_low));
        self.lines.clk = !(self.c64_clk_low || any(&self.periph_clk_low));
        self.lines.data = !(self.c64_data_low || any(&self.periph_data_low));
        self.lines.srq = !any(&self.periph_srq_low);

        LineChanges {
            atn: old.atn != self.lines.atn,
            clk: old.clk != self.lines.clk,
            data: old.data != self.lines.data,
            srq: old.srq != self.lines.srq,
        }
    }

    // ── C64-side drivers (CIA2) ───────────────────────────────

    /// Set ATN; `assert_low` true pulls the wire down.
    pub fn set_atn_line(&mut self, assert_low: bool) -> LineChanges {
        self.c64_atn_low = assert_low;
        let mut changes = self.recompute();

        if changes.atn {
            if !self.lines.atn {
                // Attention: any talker loses the bus and command
                // reception restarts.
                self.state = BusState::Attention;
                self.current_talker = None;
                self.listeners.clear();
                self.cmd_shift = 0;
                self.cmd_bits = 0;
                let mut released = false;
                for d in 0..MAX_DEVICE {
                    if self.periph_clk_low[d] || self.periph_data_low[d] {
                        self.periph_clk_low[d] = false;
                        self.periph_data_low[d] = false;
                        released = true;
                    }
                }
                if released {
                    changes.merge(self.recompute());
                }
            } else {
                if self.state == BusState::Attention {
                    self.state = BusState::Idle;
                }
                self.cmd_bits = 0;
            }
        }
        changes
    }

    pub fn set_clk_line(&mut self, assert_low: bool) -> LineChanges {
        self.c64_clk_low = assert_low;
        self.recompute()
    }

    pub fn set_data_line(&mut self, assert_low: bool) -> LineChanges {
        self.c64_data_low = assert_low;
        self.recompute()
    }

    // ── Peripheral-side drivers ───────────────────────────────

    /// Only the current talker may drive CLK; the first driver claims
    /// the slot, and releasing both lines gives it up.
    pub fn peripheral_control_clk(&mut self, device: u8, assert_low: bool) -> LineChanges {
        let d = device as usize;
        if d >= MAX_DEVICE || !self.registered[d] {
            return LineChanges::default();
        }
        if self.current_talker.is_none() {
            self.current_talker = Some(device);
        }
        if self.current_talker != Some(device) {
            return LineChanges::default();
        }
        self.periph_clk_low[d] = assert_low;
        if !self.periph_clk_low[d] && !self.periph_data_low[d] {
            self.current_talker = None;
        }
        self.recompute()
    }

    pub fn peripheral_control_data(&mut self, device: u8, assert_low: bool) -> LineChanges {
        let d = device as usize;
        if d >= MAX_DEVICE || !self.registered[d] {
            return LineChanges::default();
        }
        // Every listener may hold DATA low (acknowledge); arbitration is
        // wired-AND, so no talker gate here.
        self.periph_data_low[d] = assert_low;
        self.recompute()
    }

    pub fn peripheral_control_atn(&mut self, device: u8, assert_low: bool) -> LineChanges {
        let d = device as usize;
        if d >= MAX_DEVICE || !self.registered[d] {
            return LineChanges::default();
        }
        self.periph_atn_low[d] = assert_low;
        self.recompute()
    }

    pub fn peripheral_control_srq(&mut self, device: u8, assert_low: bool) -> LineChanges {
        let d = device as usize;
        if d >= MAX_DEVICE || !self.registered[d] {
            return LineChanges::default();
        }
        self.periph_srq_low[d] = assert_low;
        self.recompute()
    }

    // ── Command reception ─────────────────────────────────────

    /// Shift one command bit on a CLK falling edge while ATN is low.
    /// `data_level` is the DATA wire at the edge (high = 1 bit).
    pub fn shift_command_bit(&mut self, data_level: bool) -> Option<BusCommand> {
        if self.lines.atn {
            return None;
        }
        self.cmd_shift = (self.cmd_shift << 1) | data_level as u8;
        self.cmd_bits += 1;
        if self.cmd_bits < 8 {
            return None;
        }
        let byte = self.cmd_shift;
        self.cmd_shift = 0;
        self.cmd_bits = 0;
        Some(Self::decode_command(byte))
    }

    fn decode_command(byte: u8) -> BusCommand {
        match byte {
            0x3F => BusCommand::Unlisten,
            0x5F => BusCommand::Untalk,
            _ => match byte & 0xF0 {
                0x20 => BusCommand::Listen(byte & 0x1F),
                0x40 => BusCommand::Talk(byte & 0x1F),
                0x60 => BusCommand::Secondary(byte & 0x0F),
                0xE0 => BusCommand::Close(byte & 0x0F),
                0xF0 => BusCommand::Open(byte & 0x0F),
                _ => {
                    log::debug!("iec: unknown command byte ${byte:02X}");
                    BusCommand::Unlisten
                }
            },
        }
    }

    // ── Addressing bookkeeping ────────────────────────────────

    pub fn listen(&mut self, device: u8) {
        if !self.listeners.contains(&device) {
            self.listeners.push(device);
        }
        self.state = BusState::Listen;
    }

    pub fn unlisten(&mut self) {
        self.listeners.clear();
        self.state = BusState::Unlisten;
    }

    pub fn talk(&mut self, device: u8) -> LineChanges {
        self.current_talker = Some(device);
        self.state = BusState::Talk;
        // A fresh talker starts with both lines released.
        let d = device as usize;
        if d < MAX_DEVICE {
            self.periph_clk_low[d] = false;
            self.periph_data_low[d] = false;
        }
        self.recompute()
    }

    pub fn untalk(&mut self) -> LineChanges {
        if let Some(t) = self.current_talker.take() {
            let d = t as usize;
            if d < MAX_DEVICE {
                self.periph_clk_low[d] = false;
                self.periph_data_low[d] = false;
            }
        }
        self.state = BusState::Untalk;
        self.recompute()
    }

    /// Per-tick housekeeping: refresh the SRQ wire from peripheral
    /// assertions.
    pub fn tick(&mut self) -> LineChanges {
        self.recompute()
    }
}

impl Default for IecBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c64_asserting_atn_pulls_the_wire_low() {
        let mut bus = IecBus::new();
        bus.register_device(8);

        let ch = bus.set_atn_line(true);
        assert!(ch.atn, "level changed");
        assert!(!bus.lines().atn, "wire low");
        assert_eq!(bus.state(), BusState::Attention);

        let ch = bus.set_atn_line(false);
        assert!(ch.atn);
        assert!(bus.lines().atn);
    }

    #[test]
    fn wired_and_keeps_data_low_until_all_release() {
        let mut bus = IecBus::new();
        bus.register_device(8);
        bus.register_device(9);

        bus.peripheral_control_data(8, true);
        bus.peripheral_control_data(9, true);
        assert!(!bus.lines().data);

        let ch = bus.peripheral_control_data(8, false);
        assert!(!ch.data, "still held by the other device");
        assert!(!bus.lines().data);

        let ch = bus.peripheral_control_data(9, false);
        assert!(ch.data);
        assert!(bus.lines().data);
    }

    #[test]
    fn unregistered_devices_cannot_drive() {
        let mut bus = IecBus::new();
        let ch = bus.peripheral_control_clk(8, true);
        assert!(!ch.any());
        assert!(bus.lines().clk);
    }

    #[test]
    fn command_decode_by_high_nibble() {
        assert_eq!(IecBus::decode_command(0x28), BusCommand::Listen(8));
        assert_eq!(IecBus::decode_command(0x3F), BusCommand::Unlisten);
        assert_eq!(IecBus::decode_command(0x48), BusCommand::Talk(8));
        assert_eq!(IecBus::decode_command(0x5F), BusCommand::Untalk);
        assert_eq!(IecBus::decode_command(0x6F), BusCommand::Secondary(15));
        assert_eq!(IecBus::decode_command(0xE2), BusCommand::Close(2));
        assert_eq!(IecBus::decode_command(0xF0), BusCommand::Open(0));
    }

    #[test]
    fn command_bits_shift_msb_first_under_atn() {
        let mut bus = IecBus::new();
        bus.register_device(8);
        bus.set_atn_line(true);

        // LISTEN 8 = $28.
        let mut result = None;
        for bit in (0..8).rev() {
            let level = (0x28 >> bit) & 1 != 0;
            result = bus.shift_command_bit(level);
        }
        assert_eq!(result, Some(BusCommand::Listen(8)));
    }

    #[test]
    fn no_command_shift_while_atn_released() {
        let mut bus = IecBus::new();
        for _ in 0..16 {
            assert!(bus.shift_command_bit(true).is_none());
        }
    }

    #[test]
    fn attention_clears_talker_and_releases_peripheral_lines() {
        let mut bus = IecBus::new();
        bus.register_device(8);
        bus.talk(8);
        bus.peripheral_control_clk(8, true);
        assert!(!bus.lines().clk);

        bus.set_atn_line(true);
        assert!(bus.current_talker().is_none());
        assert!(bus.lines().clk, "peripheral CLK released");
    }

    #[test]
    fn only_the_talker_drives_clk() {
        let mut bus = IecBus::new();
        bus.register_device(8);
        bus.register_device(9);
        bus.talk(8);

        bus.peripheral_control_clk(9, true);
        assert!(bus.lines().clk, "non-talker ignored");
        bus.peripheral_control_clk(8, true);
        assert!(!bus.lines().clk);
    }

    #[test]
    fn srq_follows_any_peripheral() {
        let mut bus = IecBus::new();
        bus.register_device(8);
        bus.register_device(10);
        bus.peripheral_control_srq(10, true);
        assert!(!bus.lines().srq);
        bus.peripheral_control_srq(10, false);
        assert!(bus.lines().srq);
    }
}
