//! CIA2 ($DD00): VIC bank select, IEC bus drivers, RS-232, NMI.
//!
//! Port A bits 0-1 select the VIC's 16 KB bank (inverted), bits 3-5
//! drive ATN/CLK/DATA onto the IEC bus through inverting open-collector
//! drivers, bits 6-7 read CLK-IN/DATA-IN back.  The chip's interrupt
//! output is the CPU's NMI pin.

use super::{CiaCore, DDRA, DDRB, ICR, INT_SERIAL, PRA, PRB};
use crate::machine::VideoStandard;
use crate::rs232::{NullModem, Rs232Device};

// Port A pin assignments.
pub const PA_ATN_OUT: u8 = 0x08;
pub const PA_CLK_OUT: u8 = 0x10;
pub const PA_DATA_OUT: u8 = 0x20;
pub const PA_CLK_IN: u8 = 0x40;
pub const PA_DATA_IN: u8 = 0x80;

// Port B user-port RS-232 pins.
const PB_RXD: u8 = 0x01;
const PB_RTS: u8 = 0x02;
const PB_DTR: u8 = 0x04;
const PB_RI: u8 = 0x08;
const PB_DCD: u8 = 0x10;
const PB_CTS: u8 = 0x40;
const PB_DSR: u8 = 0x80;

/// What CIA2 wants to drive onto the IEC wires (true = pull low).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IecDrive {
    pub atn_low: bool,
    pub clk_low: bool,
    pub data_low: bool,
}

pub struct Cia2 {
    pub core: CiaCore,

    // IEC side.
    iec_dirty: bool,
    clk_in_level: bool,
    data_in_level: bool,
    atn_line_low: bool,
    last_clk_level: bool,
    last_data_level: bool,
    last_srq_level: bool,

    // Fast-serial shifter state.
    listening: bool,
    talking: bool,
    shift_reg: u8,
    bit_count: u8,
    out_bit: i8,

    rs232: Box<dyn Rs232Device>,
}

impl Cia2 {
    pub fn new(standard: VideoStandard) -> Self {
        Self {
            core: CiaCore::new(standard),
            iec_dirty: true,
            clk_in_level: true,
            data_in_level: true,
            atn_line_low: false,
            last_clk_level: true,
            last_data_level: true,
            last_srq_level: true,
            listening: false,
            talking: false,
            shift_reg: 0,
            bit_count: 0,
            out_bit: 7,
            rs232: Box::new(NullModem::new()),
        }
    }

    pub fn reset(&mut self) {
        self.core.reset();
        self.iec_dirty = true;
        self.clk_in_level = true;
        self.data_in_level = true;
        self.atn_line_low = false;
        self.last_clk_level = true;
        self.last_data_level = true;
        self.last_srq_level = true;
        self.listening = false;
        self.talking = false;
        self.shift_reg = 0;
        self.bit_count = 0;
        self.out_bit = 7;
    }

    pub fn set_rs232_device(&mut self, dev: Box<dyn Rs232Device>) {
        self.rs232 = dev;
    }

    // ── Register access ───────────────────────────────────────

    pub fn read_register(&mut self, reg: u8) -> u8 {
        let reg = reg & 0x0F;
        match reg {
            PRA => {
                // DDR-gated: outputs read the latch, inputs read pins.
                let mut value =
                    (self.core.port_a & self.core.ddr_a) | !self.core.ddr_a;
                if self.core.ddr_a & PA_CLK_IN == 0 {
                    value = if self.clk_in_level {
                        value | PA_CLK_IN
                    } else {
                        value & !PA_CLK_IN
                    };
                }
                if self.core.ddr_a & PA_DATA_IN == 0 {
                    value = if self.data_in_level {
                        value | PA_DATA_IN
                    } else {
                        value & !PA_DATA_IN
                    };
                }
                value
            }
            PRB => {
                let mut value =
                    (self.core.port_b & self.core.ddr_b) | !self.core.ddr_b;
                for (mask, level) in [
                    (PB_RXD, self.rs232.rxd()),
                    (PB_RI, self.rs232.ri()),
                    (PB_DCD, self.rs232.dcd()),
                    (PB_CTS, self.rs232.cts()),
                    (PB_DSR, self.rs232.dsr()),
                ] {
                    if self.core.ddr_b & mask == 0 {
                        value = if level { value | mask } else { value & !mask };
                    }
                }
                self.core.port_b_with_timer_outputs(value)
            }
            ICR => self.core.read_icr(),
            _ => self.core.read_register(reg),
        }
    }

    pub fn write_register(&mut self, reg: u8, value: u8) {
        let reg = reg & 0x0F;
        match reg {
            PRA => {
                let old = self.core.port_a;
                self.core.write_register(PRA, value);
                if old != self.core.port_a {
                    self.iec_dirty = true;
                }
            }
            DDRA => {
                self.core.write_register(DDRA, value);
                self.iec_dirty = true;
            }
            PRB | DDRB => {
                self.core.write_register(reg, value);
                if self.core.ddr_b & PB_DTR != 0 {
                    self.rs232.set_dtr(self.core.port_b & PB_DTR != 0);
                }
                if self.core.ddr_b & PB_RTS != 0 {
                    self.rs232.set_rts(self.core.port_b & PB_RTS != 0);
                }
            }
            _ => self.core.write_register(reg, value),
        }
    }

    pub fn update_timers(&mut self, cycles: u32) {
        self.core.update_timers(cycles);
    }

    /// The CIA2 interrupt output is the CPU's NMI pin.
    pub fn nmi_asserted(&self) -> bool {
        self.core.line_active()
    }

    // ── VIC bank ──────────────────────────────────────────────

    /// Bits 0-1 (inverted) select the VIC's 16 KB window.
    pub fn vic_bank_base(&self) -> u16 {
        let effective = (self.core.port_a & self.core.ddr_a) | !self.core.ddr_a;
        ((!effective & 0x03) as u16) * 0x4000
    }

    // ── IEC wiring ────────────────────────────────────────────

    /// Drain the pending IEC output state after a port A / DDR write.
    pub fn take_iec_outputs(&mut self) -> Option<IecDrive> {
        if !self.iec_dirty {
            return None;
        }
        self.iec_dirty = false;
        // A high output pin turns the inverting driver on → line low.
        let low_mask = self.core.ddr_a & self.core.port_a;
        Some(IecDrive {
            atn_low: low_mask & PA_ATN_OUT != 0,
            clk_low: low_mask & PA_CLK_OUT != 0,
            data_low: low_mask & PA_DATA_OUT != 0,
        })
    }

    /// Bus CLK line changed; `level` true = released/high.
    pub fn clk_changed(&mut self, level: bool, data_level: bool) {
        let falling = self.last_clk_level && !level;
        self.last_clk_level = level;
        self.clk_in_level = level;
        if !falling {
            return;
        }

        if self.listening && !self.atn_line_low {
            self.shift_reg = (self.shift_reg << 1) | data_level as u8;
            self.bit_count += 1;
            if self.bit_count == 8 {
                self.core.serial_data = self.shift_reg;
                self.bit_count = 0;
                self.shift_reg = 0;
                self.core.trigger(INT_SERIAL);
            }
        }
    }

    pub fn data_changed(&mut self, level: bool) {
        self.last_data_level = level;
        self.data_in_level = level;
    }

    pub fn atn_changed(&mut self, asserted_low: bool) {
        let falling = !self.atn_line_low && asserted_low;
        self.atn_line_low = asserted_low;
        if falling {
            self.listening = false;
            self.talking = false;
            self.shift_reg = 0;
            self.bit_count = 0;
            self.out_bit = 7;
        }
    }

    /// SRQ carries the fast-serial clock; sample DATA on falling edges.
    pub fn srq_changed(&mut self, level: bool, data_level: bool) {
        let falling = self.last_srq_level && !level;
        self.last_srq_level = level;
        if !falling {
            return;
        }
        if self.listening && !self.atn_line_low {
            self.shift_reg = (self.shift_reg << 1) | data_level as u8;
            self.bit_count += 1;
            if self.bit_count == 8 {
                self.core.serial_data = self.shift_reg;
                self.bit_count = 0;
                self.shift_reg = 0;
                self.core.trigger(INT_SERIAL);
            }
        }
    }

    /// Track whether the computer is the receiver on the bus (set by the
    /// machine when TALK/LISTEN commands go out).
    pub fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
        if listening {
            self.bit_count = 0;
            self.shift_reg = 0;
        }
    }

    pub fn set_talking(&mut self, talking: bool) {
        self.talking = talking;
        if talking {
            self.out_bit = 7;
        }
    }

    pub fn dump_registers(&self) -> String {
        format!(
            "CIA2 PA=${:02X} DDRA=${:02X} bank=${:04X} IFR=${:02X} IER=${:02X} nmi={}",
            self.core.port_a,
            self.core.ddr_a,
            self.vic_bank_base(),
            self.core.int_status(),
            self.core.int_enable(),
            self.nmi_asserted()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cia::{CRA, TAH, TAL};

    #[test]
    fn vic_bank_bits_are_inverted() {
        let mut cia = Cia2::new(VideoStandard::Ntsc);
        cia.write_register(DDRA, 0x3F);
        cia.write_register(PRA, 0x03); // bits 0-1 high → bank 0
        assert_eq!(cia.vic_bank_base(), 0x0000);
        cia.write_register(PRA, 0x02);
        assert_eq!(cia.vic_bank_base(), 0x4000);
        cia.write_register(PRA, 0x01);
        assert_eq!(cia.vic_bank_base(), 0x8000);
        cia.write_register(PRA, 0x00);
        assert_eq!(cia.vic_bank_base(), 0xC000);
    }

    #[test]
    fn iec_outputs_follow_port_a() {
        let mut cia = Cia2::new(VideoStandard::Ntsc);
        cia.write_register(DDRA, 0x3F);
        let _ = cia.take_iec_outputs();

        cia.write_register(PRA, PA_ATN_OUT | 0x03);
        let out = cia.take_iec_outputs().unwrap();
        assert!(out.atn_low);
        assert!(!out.clk_low);
        assert!(!out.data_low);

        // No change → nothing to drain.
        assert!(cia.take_iec_outputs().is_none());

        cia.write_register(PRA, PA_CLK_OUT | PA_DATA_OUT | 0x03);
        let out = cia.take_iec_outputs().unwrap();
        assert!(!out.atn_low);
        assert!(out.clk_low);
        assert!(out.data_low);
    }

    #[test]
    fn port_a_reads_bus_input_levels() {
        let mut cia = Cia2::new(VideoStandard::Ntsc);
        cia.write_register(DDRA, 0x3F); // bits 6-7 inputs
        cia.clk_changed(false, true);
        cia.data_changed(false);
        let v = cia.read_register(PRA);
        assert_eq!(v & PA_CLK_IN, 0);
        assert_eq!(v & PA_DATA_IN, 0);

        cia.clk_changed(true, true);
        cia.data_changed(true);
        let v = cia.read_register(PRA);
        assert_eq!(v & PA_CLK_IN, PA_CLK_IN);
        assert_eq!(v & PA_DATA_IN, PA_DATA_IN);
    }

    #[test]
    fn timer_underflow_asserts_nmi() {
        let mut cia = Cia2::new(VideoStandard::Ntsc);
        cia.write_register(ICR, 0x81);
        cia.write_register(TAL, 0x08);
        cia.write_register(TAH, 0x00);
        cia.write_register(CRA, 0x01);
        cia.update_timers(8);
        assert!(cia.nmi_asserted());
        let _ = cia.read_register(ICR);
        assert!(!cia.nmi_asserted());
    }

    #[test]
    fn fast_serial_shifts_on_clk_edges() {
        let mut cia = Cia2::new(VideoStandard::Ntsc);
        cia.set_listening(true);
        // Shift in $A5 MSB-first on eight falling edges.
        for bit in (0..8).rev() {
            let level = (0xA5 >> bit) & 1 != 0;
            cia.clk_changed(true, level);
            cia.clk_changed(false, level);
        }
        assert_eq!(cia.core.serial_data, 0xA5);
        assert!(cia.core.int_status() & INT_SERIAL != 0);
    }
}
