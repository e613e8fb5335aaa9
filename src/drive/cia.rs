//! The 8520-style CIA inside the 1571 and 1581.
//!
//! Carries the burst/fast-serial port and, on port B, the IEC pin
//! mirror with the hardware auto-ATN-acknowledge: when enabled, an ATN
//! falling edge arms a latch that holds DATA low until the controller
//! has completed a full CLK low→high phase and a minimum hold time has
//! passed.  The observed sequence is kept as-is for compatibility.

// Port B pin mirror.
pub const PRB_DATA_IN: u8 = 0x01;
pub const PRB_DATA_OUT: u8 = 0x02;
pub const PRB_CLK_IN: u8 = 0x04;
pub const PRB_CLK_OUT: u8 = 0x08;
pub const PRB_ATN_ACK: u8 = 0x10;
pub const PRB_ATN_IN: u8 = 0x80;

// Interrupt bits.
pub const INT_TIMER_A: u8 = 0x01;
pub const INT_TIMER_B: u8 = 0x02;
pub const INT_SERIAL: u8 = 0x08;
pub const INT_FLAG: u8 = 0x10;

/// Minimum DATA hold after an auto-acknowledge arms.
const MIN_ACK_HOLD: u32 = 40;

pub struct DriveCia {
    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,

    timer_a: u16,
    latch_a: u16,
    timer_a_running: bool,
    timer_b: u16,
    latch_b: u16,
    timer_b_running: bool,
    control_a: u8,
    control_b: u8,

    serial_data: u8,
    int_status: u8,
    int_enable: u8,

    // IEC input mirror (true = wire pulled low).
    atn_in_low: bool,
    clk_in_low: bool,
    data_in_low: bool,
    last_atn_low: bool,

    // Auto ATN acknowledge latch.
    ack_armed: bool,
    ext_data_low: bool,
    atn_ack_hold_cycles: u32,
    atn_ack_saw_clk_low: bool,
    atn_ack_saw_clk_high: bool,
    last_clk_low_for_ack: bool,

    flag_level: bool,
}

impl DriveCia {
    pub fn new() -> Self {
        Self {
            port_a: 0xFF,
            port_b: 0xFF,
            ddr_a: 0,
            ddr_b: 0,
            timer_a: 0,
            latch_a: 0xFFFF,
            timer_a_running: false,
            timer_b: 0,
            latch_b: 0xFFFF,
            timer_b_running: false,
            control_a: 0,
            control_b: 0,
            serial_data: 0,
            int_status: 0,
            int_enable: 0,
            atn_in_low: false,
            clk_in_low: false,
            data_in_low: false,
            last_atn_low: false,
            ack_armed: false,
            ext_data_low: false,
            atn_ack_hold_cycles: 0,
            atn_ack_saw_clk_low: false,
            atn_ack_saw_clk_high: false,
            last_clk_low_for_ack: false,
            flag_level: true,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn irq_active(&self) -> bool {
        self.int_status & self.int_enable & 0x1F != 0
    }

    fn trigger(&mut self, bit: u8) {
        self.int_status |= bit;
    }

    /// Does the auto-acknowledge latch want DATA held low right now?
    pub fn wants_data_low(&self) -> bool {
        self.ext_data_low
    }

    /// FLAG pin; the drive wires ATN onto it.
    pub fn set_flag_line(&mut self, level: bool) {
        if self.flag_level && !level {
            self.trigger(INT_FLAG);
        }
        self.flag_level = level;
    }

    pub fn push_serial_byte(&mut self, value: u8) {
        self.serial_data = value;
        self.trigger(INT_SERIAL);
    }

    fn auto_ack_enabled(&self) -> bool {
        self.ddr_b & PRB_ATN_ACK != 0 && self.port_b & PRB_ATN_ACK != 0
    }

    /// Mirror the bus levels into the port pins.  An ATN falling edge
    /// arms the acknowledge latch; a rising edge cancels it.
    pub fn set_iec_inputs(&mut self, atn_low: bool, clk_low: bool, data_low: bool) {
        self.clk_in_low = clk_low;
        self.data_in_low = data_low;

        let falling = !self.last_atn_low && atn_low;
        let rising = self.last_atn_low && !atn_low;
        self.atn_in_low = atn_low;
        self.last_atn_low = atn_low;

        if falling {
            self.set_flag_line(false);
            if self.auto_ack_enabled() {
                self.ack_armed = true;
                // CLK already low at the ATN edge counts as the low phase.
                self.atn_ack_saw_clk_low = clk_low;
                self.atn_ack_saw_clk_high = false;
                self.last_clk_low_for_ack = clk_low;
                self.atn_ack_hold_cycles = 0;
                self.ext_data_low = self.atn_ack_saw_clk_low;
            }
        } else if rising {
            self.set_flag_line(true);
            self.ack_armed = false;
            self.ext_data_low = false;
            self.atn_ack_hold_cycles = 0;
            self.atn_ack_saw_clk_low = false;
            self.atn_ack_saw_clk_high = false;
        }
    }

    pub fn tick(&mut self, cycles: u32) {
        for _ in 0..cycles {
            self.tick_ack_latch();
            self.tick_timers();
        }
    }

    fn tick_ack_latch(&mut self) {
        if !(self.auto_ack_enabled() && self.ack_armed) {
            return;
        }
        if !self.atn_in_low {
            self.ack_armed = false;
            self.ext_data_low = false;
            self.atn_ack_hold_cycles = 0;
            self.atn_ack_saw_clk_low = false;
            self.atn_ack_saw_clk_high = false;
            return;
        }

        let prev_clk_low = self.last_clk_low_for_ack;
        if !prev_clk_low && self.clk_in_low {
            self.atn_ack_saw_clk_low = true;
            if !self.ext_data_low {
                self.ext_data_low = true;
                self.atn_ack_hold_cycles = 0;
            }
        }
        if prev_clk_low && !self.clk_in_low && self.atn_ack_saw_clk_low {
            self.atn_ack_saw_clk_high = true;
        }
        self.last_clk_low_for_ack = self.clk_in_low;

        if self.ext_data_low {
            self.atn_ack_hold_cycles += 1;
        }

        // Release only after the minimum hold and a full CLK phase.
        if self.atn_ack_hold_cycles >= MIN_ACK_HOLD
            && self.atn_ack_saw_clk_low
            && self.atn_ack_saw_clk_high
        {
            self.ack_armed = false;
            self.ext_data_low = false;
        }
    }

    fn tick_timers(&mut self) {
        if self.timer_a_running {
            if self.timer_a == 0 {
                self.timer_a = self.latch_a;
                self.trigger(INT_TIMER_A);
                if self.control_a & 0x08 != 0 {
                    self.timer_a_running = false;
                }
            } else {
                self.timer_a -= 1;
            }
        }
        if self.timer_b_running {
            if self.timer_b == 0 {
                self.timer_b = self.latch_b;
                self.trigger(INT_TIMER_B);
                if self.control_b & 0x08 != 0 {
                    self.timer_b_running = false;
                }
            } else {
                self.timer_b -= 1;
            }
        }
    }

    // ── Register access ───────────────────────────────────────

    pub fn read_register(&mut self, reg: u8) -> u8 {
        match reg & 0x0F {
            0x0 => (self.port_a & self.ddr_a) | !self.ddr_a,
            0x1 => {
                let mut value = (self.port_b & self.ddr_b) | !self.ddr_b;
                // Input pins mirror the wires (low wire = 0).
                if self.ddr_b & PRB_DATA_IN == 0 {
                    value = if self.data_in_low {
                        value & !PRB_DATA_IN
                    } else {
                        value | PRB_DATA_IN
                    };
                }
                if self.ddr_b & PRB_CLK_IN == 0 {
                    value = if self.clk_in_low {
                        value & !PRB_CLK_IN
                    } else {
                        value | PRB_CLK_IN
                    };
                }
                if self.ddr_b & PRB_ATN_IN == 0 {
                    value = if self.atn_in_low {
                        value & !PRB_ATN_IN
                    } else {
                        value | PRB_ATN_IN
                    };
                }
                value
            }
            0x2 => self.ddr_a,
            0x3 => self.ddr_b,
            0x4 => (self.timer_a & 0xFF) as u8,
            0x5 => (self.timer_a >> 8) as u8,
            0x6 => (self.timer_b & 0xFF) as u8,
            0x7 => (self.timer_b >> 8) as u8,
            0xC => self.serial_data,
            0xD => {
                let mut v = self.int_status & 0x1F;
                if v & self.int_enable != 0 {
                    v |= 0x80;
                }
                self.int_status = 0;
                v
            }
            0xE => self.control_a,
            0xF => self.control_b,
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, reg: u8, value: u8) {
        match reg & 0x0F {
            0x0 => self.port_a = value,
            0x1 => self.port_b = (value & self.ddr_b) | (self.port_b & !self.ddr_b),
            0x2 => self.ddr_a = value,
            0x3 => self.ddr_b = value,
            0x4 => self.latch_a = (self.latch_a & 0xFF00) | value as u16,
            0x5 => {
                self.latch_a = (self.latch_a & 0x00FF) | ((value as u16) << 8);
                if !self.timer_a_running {
                    self.timer_a = self.latch_a;
                }
            }
            0x6 => self.latch_b = (self.latch_b & 0xFF00) | value as u16,
            0x7 => {
                self.latch_b = (self.latch_b & 0x00FF) | ((value as u16) << 8);
                if !self.timer_b_running {
                    self.timer_b = self.latch_b;
                }
            }
            0xC => self.serial_data = value,
            0xD => {
                if value & 0x80 != 0 {
                    self.int_enable |= value & 0x1F;
                } else {
                    self.int_enable &= !(value & 0x1F);
                }
            }
            0xE => {
                self.control_a = value;
                if value & 0x10 != 0 {
                    self.timer_a = self.latch_a;
                }
                self.timer_a_running = value & 0x01 != 0;
            }
            0xF => {
                self.control_b = value;
                if value & 0x10 != 0 {
                    self.timer_b = self.latch_b;
                }
                self.timer_b_running = value & 0x01 != 0;
            }
            _ => {}
        }
    }

    /// Drive-side output intentions on the IEC port.
    pub fn iec_outputs(&self) -> (bool, bool) {
        let out = self.port_b & self.ddr_b;
        (out & PRB_CLK_OUT != 0, out & PRB_DATA_OUT != 0)
    }
}

impl Default for DriveCia {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cia_with_auto_ack() -> DriveCia {
        let mut cia = DriveCia::new();
        cia.write_register(0x3, PRB_ATN_ACK); // ATN-ACK as output
        cia.write_register(0x1, PRB_ATN_ACK); // and driven high
        cia
    }

    #[test]
    fn atn_edge_latches_flag_interrupt() {
        let mut cia = DriveCia::new();
        cia.write_register(0xD, 0x80 | INT_FLAG);
        cia.set_iec_inputs(true, false, false);
        assert!(cia.irq_active());
        let _ = cia.read_register(0xD);
        assert!(!cia.irq_active());
    }

    #[test]
    fn auto_ack_asserts_data_when_clk_already_low() {
        let mut cia = cia_with_auto_ack();
        // CLK low first, then ATN falls.
        cia.set_iec_inputs(false, true, false);
        cia.set_iec_inputs(true, true, false);
        assert!(cia.wants_data_low(), "ACK asserted at the ATN edge");
    }

    #[test]
    fn auto_ack_waits_for_clk_to_drop() {
        let mut cia = cia_with_auto_ack();
        cia.set_iec_inputs(true, false, false);
        assert!(!cia.wants_data_low());
        // Controller pulls CLK low later.
        cia.set_iec_inputs(true, true, false);
        cia.tick(1);
        assert!(cia.wants_data_low());
    }

    #[test]
    fn auto_ack_releases_after_hold_and_full_clk_phase() {
        let mut cia = cia_with_auto_ack();
        cia.set_iec_inputs(true, true, false);
        cia.tick(10);
        assert!(cia.wants_data_low(), "minimum hold not reached");

        // CLK returns high: full phase seen, but the hold still gates.
        cia.set_iec_inputs(true, false, false);
        cia.tick(10);
        assert!(cia.wants_data_low());

        cia.tick(60);
        assert!(!cia.wants_data_low(), "released after hold + phase");
    }

    #[test]
    fn atn_release_cancels_the_ack() {
        let mut cia = cia_with_auto_ack();
        cia.set_iec_inputs(true, true, false);
        cia.tick(5);
        assert!(cia.wants_data_low());
        cia.set_iec_inputs(false, true, false);
        cia.tick(1);
        assert!(!cia.wants_data_low());
    }

    #[test]
    fn port_b_mirrors_bus_inputs() {
        let mut cia = DriveCia::new();
        cia.set_iec_inputs(true, true, true);
        let v = cia.read_register(0x1);
        assert_eq!(v & PRB_DATA_IN, 0);
        assert_eq!(v & PRB_CLK_IN, 0);
        assert_eq!(v & PRB_ATN_IN, 0);
    }

    #[test]
    fn timer_a_counts_and_latches() {
        let mut cia = DriveCia::new();
        cia.write_register(0x4, 8);
        cia.write_register(0x5, 0);
        cia.write_register(0xE, 0x01);
        cia.write_register(0xD, 0x80 | INT_TIMER_A);
        cia.tick(9);
        assert!(cia.irq_active());
    }
}
