//! MOS 6522 VIA, as wired inside the 1541/1571.
//!
//! VIA1 ($1800) carries the IEC port: DATA/CLK in and out, the ATNA
//! acknowledge flop, and ATN-IN with its CA1 interrupt.  VIA2 ($1C00)
//! runs the disk mechanics: stepper phase and motor on port B, density
//! select, write-protect sense, sync detect, and the GCR read latch on
//! port A with a byte-ready interrupt.

// Port B pin layout, VIA1 (IEC port).
pub const VIA1_PB_DATA_IN: u8 = 0x01;
pub const VIA1_PB_DATA_OUT: u8 = 0x02;
pub const VIA1_PB_CLK_IN: u8 = 0x04;
pub const VIA1_PB_CLK_OUT: u8 = 0x08;
pub const VIA1_PB_ATNA: u8 = 0x10;
pub const VIA1_PB_ATN_IN: u8 = 0x80;

// Port B pin layout, VIA2 (mechanics).
pub const VIA2_PB_STEP_MASK: u8 = 0x03;
pub const VIA2_PB_MOTOR: u8 = 0x04;
pub const VIA2_PB_LED: u8 = 0x08;
pub const VIA2_PB_WRITE_PROTECT: u8 = 0x10;
pub const VIA2_PB_DENSITY_MASK: u8 = 0x60;
pub const VIA2_PB_SYNC: u8 = 0x80;

// IFR bits.
pub const IFR_CA2: u8 = 0x01;
pub const IFR_CA1: u8 = 0x02;
pub const IFR_SR: u8 = 0x04;
pub const IFR_CB2: u8 = 0x08;
pub const IFR_CB1: u8 = 0x10;
pub const IFR_TIMER2: u8 = 0x20;
pub const IFR_TIMER1: u8 = 0x40;
pub const IFR_IRQ: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViaRole {
    /// VIA1: serial-bus port.
    IecPort,
    /// VIA2: drive mechanics and the read channel.
    DiskController,
}

/// Port B levels the drive logic wants pushed out to the bus or the
/// mechanics, captured on writes and drained by the drive each step.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortBChange {
    pub old: u8,
    pub new: u8,
}

pub struct Via {
    role: ViaRole,

    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,

    t1_counter: u16,
    t1_latch: u16,
    t1_running: bool,
    t2_counter: u16,
    t2_latch: u16,
    t2_running: bool,

    shift_register: u8,
    acr: u8,
    pcr: u8,
    ifr: u8,
    ier: u8,

    // External input levels mirrored into the port bits.
    input_a: u8,
    input_b: u8,

    // Pending port-B output change for the drive to decode.
    pending_b: Option<PortBChange>,

    // VIA2 read channel.
    disk_byte: u8,
    byte_pending: bool,
    sync_active: bool,
}

impl Via {
    pub fn new(role: ViaRole) -> Self {
        Self {
            role,
            port_a: 0,
            port_b: 0,
            ddr_a: 0,
            ddr_b: 0,
            t1_counter: 0,
            t1_latch: 0,
            t1_running: false,
            t2_counter: 0,
            t2_latch: 0,
            t2_running: false,
            shift_register: 0,
            acr: 0,
            pcr: 0,
            ifr: 0,
            ier: 0,
            input_a: 0xFF,
            input_b: 0xFF,
            pending_b: None,
            disk_byte: 0,
            byte_pending: false,
            sync_active: false,
        }
    }

    pub fn reset(&mut self) {
        let role = self.role;
        *self = Self::new(role);
    }

    pub fn role(&self) -> ViaRole {
        self.role
    }

    // ── Interrupts ────────────────────────────────────────────

    fn refresh_master_bit(&mut self) {
        if self.ifr & self.ier & 0x7F != 0 {
            self.ifr |= IFR_IRQ;
        } else {
            self.ifr &= !IFR_IRQ;
        }
    }

    pub fn trigger_interrupt(&mut self, mask: u8) {
        self.ifr |= mask & 0x7F;
        self.refresh_master_bit();
    }

    pub fn irq_active(&self) -> bool {
        self.ifr & IFR_IRQ != 0
    }

    // ── External wiring ───────────────────────────────────────

    /// VIA1: mirror the bus line levels into the input pins.  A falling
    /// ATN edge fires CA1.
    pub fn set_iec_inputs(&mut self, atn_low: bool, clk_low: bool, data_low: bool) {
        debug_assert_eq!(self.role, ViaRole::IecPort);
        let old_atn_low = self.input_b & VIA1_PB_ATN_IN != 0;

        let mut b = self.input_b;
        // Pins read the wire: low wire = 0 on DATA/CLK inputs, but the
        // ATN-IN pin is inverted by the bus receiver.
        b = if data_low { b & !VIA1_PB_DATA_IN } else { b | VIA1_PB_DATA_IN };
        b = if clk_low { b & !VIA1_PB_CLK_IN } else { b | VIA1_PB_CLK_IN };
        b = if atn_low { b | VIA1_PB_ATN_IN } else { b & !VIA1_PB_ATN_IN };
        self.input_b = b;

        if !old_atn_low && atn_low {
            self.trigger_interrupt(IFR_CA1);
        }
    }

    /// VIA2: mechanics sense lines.
    pub fn set_write_protect(&mut self, protected: bool) {
        debug_assert_eq!(self.role, ViaRole::DiskController);
        // Active low: a protected disk reads 0.
        if protected {
            self.input_b &= !VIA2_PB_WRITE_PROTECT;
        } else {
            self.input_b |= VIA2_PB_WRITE_PROTECT;
        }
    }

    /// A byte arriving from the media lands in port A; sync runs pull
    /// the sync pin low and the byte-ready line fires CA1.
    pub fn disk_byte_from_media(&mut self, value: u8, sync: bool) {
        debug_assert_eq!(self.role, ViaRole::DiskController);
        self.disk_byte = value;
        self.input_a = value;
        self.sync_active = sync;
        if sync {
            self.input_b &= !VIA2_PB_SYNC;
        } else {
            self.input_b |= VIA2_PB_SYNC;
        }
        if !sync {
            self.byte_pending = true;
            self.trigger_interrupt(IFR_CA1);
        }
    }

    /// Drive consumed the pending read byte (or a track change made it
    /// stale).
    pub fn clear_byte_pending(&mut self) {
        self.byte_pending = false;
    }

    pub fn byte_pending(&self) -> bool {
        self.byte_pending
    }

    /// Effective port B output pins (latch where DDR=1, input elsewhere).
    pub fn port_b_pins(&self) -> u8 {
        (self.port_b & self.ddr_b) | (self.input_b & !self.ddr_b)
    }

    /// Take the last port B output change for mechanics/IEC decoding.
    pub fn take_port_b_change(&mut self) -> Option<PortBChange> {
        self.pending_b.take()
    }

    // ── Register access ───────────────────────────────────────

    pub fn read_register(&mut self, reg: u8) -> u8 {
        match reg & 0x0F {
            0x00 => {
                // ORB: reading clears the CB interrupts.
                self.ifr &= !(IFR_CB1 | IFR_CB2);
                self.refresh_master_bit();
                self.port_b_pins()
            }
            0x01 => {
                // ORA with handshake: reading acknowledges CA1/CA2.
                self.ifr &= !(IFR_CA1 | IFR_CA2);
                self.refresh_master_bit();
                if self.role == ViaRole::DiskController {
                    self.byte_pending = false;
                    self.disk_byte
                } else {
                    (self.port_a & self.ddr_a) | (self.input_a & !self.ddr_a)
                }
            }
            0x02 => self.ddr_b,
            0x03 => self.ddr_a,
            0x04 => {
                self.ifr &= !IFR_TIMER1;
                self.refresh_master_bit();
                (self.t1_counter & 0xFF) as u8
            }
            0x05 => (self.t1_counter >> 8) as u8,
            0x06 => (self.t1_latch & 0xFF) as u8,
            0x07 => (self.t1_latch >> 8) as u8,
            0x08 => {
                self.ifr &= !IFR_TIMER2;
                self.refresh_master_bit();
                (self.t2_counter & 0xFF) as u8
            }
            0x09 => (self.t2_counter >> 8) as u8,
            0x0A => self.shift_register,
            0x0B => self.acr,
            0x0C => self.pcr,
            0x0D => self.ifr,
            0x0E => self.ier | 0x80,
            0x0F => {
                // ORA without handshake.
                if self.role == ViaRole::DiskController {
                    self.disk_byte
                } else {
                    (self.port_a & self.ddr_a) | (self.input_a & !self.ddr_a)
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, reg: u8, value: u8) {
        match reg & 0x0F {
            0x00 => {
                let old = self.port_b_pins();
                self.port_b = value;
                let new = self.port_b_pins();
                if old != new {
                    self.pending_b = Some(PortBChange { old, new });
                }
                self.ifr &= !(IFR_CB1 | IFR_CB2);
                self.refresh_master_bit();
            }
            0x01 => {
                self.port_a = value;
                self.ifr &= !(IFR_CA1 | IFR_CA2);
                self.refresh_master_bit();
            }
            0x02 => self.ddr_b = value,
            0x03 => self.ddr_a = value,
            0x04 | 0x06 => self.t1_latch = (self.t1_latch & 0xFF00) | value as u16,
            0x05 => {
                self.t1_latch = (self.t1_latch & 0x00FF) | ((value as u16) << 8);
                self.t1_counter = self.t1_latch;
                self.t1_running = true;
                self.ifr &= !IFR_TIMER1;
                self.refresh_master_bit();
            }
            0x07 => {
                self.t1_latch = (self.t1_latch & 0x00FF) | ((value as u16) << 8);
                self.ifr &= !IFR_TIMER1;
                self.refresh_master_bit();
            }
            0x08 => self.t2_latch = (self.t2_latch & 0xFF00) | value as u16,
            0x09 => {
                self.t2_latch = (self.t2_latch & 0x00FF) | ((value as u16) << 8);
                self.t2_counter = self.t2_latch;
                self.t2_running = true;
                self.ifr &= !IFR_TIMER2;
                self.refresh_master_bit();
            }
            0x0A => self.shift_register = value,
            0x0B => self.acr = value,
            0x0C => self.pcr = value,
            0x0D => {
                self.ifr &= !(value & 0x7F);
                self.refresh_master_bit();
            }
            0x0E => {
                if value & 0x80 != 0 {
                    self.ier |= value & 0x7F;
                } else {
                    self.ier &= !(value & 0x7F);
                }
                self.refresh_master_bit();
            }
            0x0F => self.port_a = value,
            _ => {}
        }
    }

    // ── Tick ──────────────────────────────────────────────────

    pub fn tick(&mut self, cycles: u32) {
        for _ in 0..cycles {
            if self.t1_running {
                if self.t1_counter == 0 {
                    self.trigger_interrupt(IFR_TIMER1);
                    if self.acr & 0x40 != 0 {
                        self.t1_counter = self.t1_latch;
                    } else {
                        self.t1_running = false;
                    }
                } else {
                    self.t1_counter -= 1;
                }
            }
            if self.t2_running {
                if self.t2_counter == 0 {
                    self.trigger_interrupt(IFR_TIMER2);
                    // Timer 2 free-runs from $FFFF after the one-shot.
                    self.t2_running = self.acr & 0x20 == 0;
                    self.t2_counter = 0xFFFF;
                } else {
                    self.t2_counter -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer1_one_shot_raises_ifr6() {
        let mut via = Via::new(ViaRole::IecPort);
        via.write_register(0x0E, 0x80 | IFR_TIMER1);
        via.write_register(0x04, 10);
        via.write_register(0x05, 0);
        via.tick(11);
        assert!(via.read_register(0x0D) & IFR_TIMER1 != 0);
        assert!(via.irq_active());

        // Reading T1 low clears the flag.
        let _ = via.read_register(0x04);
        assert!(!via.irq_active());
    }

    #[test]
    fn timer1_continuous_reloads() {
        let mut via = Via::new(ViaRole::IecPort);
        via.write_register(0x0B, 0x40); // free-run
        via.write_register(0x04, 4);
        via.write_register(0x05, 0);
        via.tick(5);
        assert!(via.read_register(0x0D) & IFR_TIMER1 != 0);
        via.write_register(0x0D, IFR_TIMER1);
        via.tick(5);
        assert!(via.read_register(0x0D) & IFR_TIMER1 != 0, "reloaded and fired again");
    }

    #[test]
    fn atn_falling_edge_fires_ca1() {
        let mut via = Via::new(ViaRole::IecPort);
        via.write_register(0x0E, 0x80 | IFR_CA1);
        via.set_iec_inputs(false, false, false);
        assert!(!via.irq_active());
        via.set_iec_inputs(true, false, false);
        assert!(via.irq_active());
        // Reading port A acknowledges.
        let _ = via.read_register(0x01);
        assert!(!via.irq_active());
    }

    #[test]
    fn disk_bytes_latch_into_port_a() {
        let mut via = Via::new(ViaRole::DiskController);
        via.disk_byte_from_media(0xD7, false);
        assert!(via.byte_pending());
        assert_eq!(via.read_register(0x01), 0xD7);
        assert!(!via.byte_pending(), "read consumed the byte");
    }

    #[test]
    fn sync_pulls_port_b_bit_7_low() {
        let mut via = Via::new(ViaRole::DiskController);
        via.disk_byte_from_media(0xFF, true);
        assert_eq!(via.port_b_pins() & VIA2_PB_SYNC, 0);
        via.disk_byte_from_media(0x55, false);
        assert_eq!(via.port_b_pins() & VIA2_PB_SYNC, VIA2_PB_SYNC);
    }

    #[test]
    fn port_b_writes_surface_as_pending_changes() {
        let mut via = Via::new(ViaRole::DiskController);
        via.write_register(0x02, 0xFF); // all outputs
        via.write_register(0x00, VIA2_PB_MOTOR | 0x01);
        let ch = via.take_port_b_change().unwrap();
        assert_eq!(ch.new & VIA2_PB_MOTOR, VIA2_PB_MOTOR);
        assert!(via.take_port_b_change().is_none());
    }

    #[test]
    fn write_protect_reads_low_when_protected() {
        let mut via = Via::new(ViaRole::DiskController);
        via.set_write_protect(true);
        assert_eq!(via.port_b_pins() & VIA2_PB_WRITE_PROTECT, 0);
        via.set_write_protect(false);
        assert_ne!(via.port_b_pins() & VIA2_PB_WRITE_PROTECT, 0);
    }
}
