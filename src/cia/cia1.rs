//! CIA1 ($DC00): keyboard and joystick scan, jiffy timer, cassette FLAG.
//!
//! Its interrupt line feeds the CPU IRQ pin through the machine's
//! aggregator, one source bit per CIA interrupt cause.

use super::keyboard::KeyMatrix;
use super::{CiaCore, ICR, INT_ALARM, INT_FLAG, INT_SERIAL, INT_TIMER_A, INT_TIMER_B, PRA, PRB};
use crate::machine::irq::{IrqLine, IrqSource};
use crate::machine::VideoStandard;

pub struct Cia1 {
    pub core: CiaCore,
    pub keyboard: KeyMatrix,
    joystick1: u8,
    joystick2: u8,
}

impl Cia1 {
    pub fn new(standard: VideoStandard) -> Self {
        Self {
            core: CiaCore::new(standard),
            keyboard: KeyMatrix::new(),
            joystick1: 0,
            joystick2: 0,
        }
    }

    pub fn reset(&mut self) {
        self.core.reset();
        self.keyboard.reset();
        self.joystick1 = 0;
        self.joystick2 = 0;
    }

    pub fn set_joystick1(&mut self, lines: u8) {
        self.joystick1 = lines & 0x1F;
    }

    pub fn set_joystick2(&mut self, lines: u8) {
        self.joystick2 = lines & 0x1F;
    }

    /// Keep the aggregator's per-source bits in line with IFR & IER.
    fn sync_irq(&self, irq: &mut IrqLine) {
        let active = self.core.int_status() & self.core.int_enable();
        irq.set(IrqSource::Cia1TimerA, active & INT_TIMER_A != 0);
        irq.set(IrqSource::Cia1TimerB, active & INT_TIMER_B != 0);
        irq.set(IrqSource::Cia1Tod, active & INT_ALARM != 0);
        irq.set(IrqSource::Cia1Serial, active & INT_SERIAL != 0);
        irq.set(IrqSource::Cia1Flag, active & INT_FLAG != 0);
    }

    pub fn read_register(&mut self, reg: u8, irq: &mut IrqLine) -> u8 {
        let reg = reg & 0x0F;
        match reg {
            PRA => {
                // Outputs from the latch, inputs pulled high, joystick 2
                // lines pull low regardless of direction.
                let base = (self.core.port_a & self.core.ddr_a) | !self.core.ddr_a;
                base & !self.joystick2
            }
            PRB => {
                // Keyboard: rows selected by port A's effective output.
                let row_select =
                    (self.core.port_a & self.core.ddr_a) | !self.core.ddr_a;
                let mut value = self.keyboard.read_columns(row_select & !self.joystick2);
                value &= (self.core.port_b & self.core.ddr_b) | !self.core.ddr_b;
                value &= !self.joystick1;
                self.core.port_b_with_timer_outputs(value)
            }
            ICR => {
                let v = self.core.read_icr();
                self.sync_irq(irq);
                v
            }
            _ => self.core.read_register(reg),
        }
    }

    pub fn write_register(&mut self, reg: u8, value: u8, irq: &mut IrqLine) {
        self.core.write_register(reg & 0x0F, value);
        self.sync_irq(irq);
    }

    pub fn update_timers(&mut self, cycles: u32, irq: &mut IrqLine) {
        self.core.update_timers(cycles);
        self.sync_irq(irq);
    }

    /// Cassette read line lands on the FLAG pin.
    pub fn set_flag_line(&mut self, level: bool, irq: &mut IrqLine) {
        self.core.set_flag_line(level);
        self.sync_irq(irq);
    }

    pub fn set_cnt_line(&mut self, level: bool) {
        self.core.set_cnt_line(level);
    }

    pub fn irq_line_active(&self) -> bool {
        self.core.line_active()
    }

    pub fn dump_registers(&self) -> String {
        format!(
            "CIA1 TA=${:04X} TB=${:04X} CRA=${:02X} CRB=${:02X} IFR=${:02X} IER=${:02X}",
            self.core.timer_a_value(),
            self.core.timer_b_value(),
            self.core.control_a(),
            self.core.control_b(),
            self.core.int_status(),
            self.core.int_enable()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cia::keyboard::JOY_FIRE;
    use crate::cia::{CRA, DDRA, TAH, TAL};

    #[test]
    fn jiffy_timer_drives_the_irq_line() {
        let mut cia = Cia1::new(VideoStandard::Ntsc);
        let mut irq = IrqLine::new();

        cia.write_register(ICR, 0x81, &mut irq); // enable timer A
        cia.write_register(TAL, 0x10, &mut irq);
        cia.write_register(TAH, 0x00, &mut irq);
        cia.write_register(CRA, 0x01, &mut irq);

        cia.update_timers(0x10, &mut irq);
        assert!(irq.active(), "underflow raises the aggregated line");

        // Reading $DC0D acknowledges and releases the line.
        let v = cia.read_register(ICR, &mut irq);
        assert!(v & 0x80 != 0);
        assert!(!irq.active());
    }

    #[test]
    fn keyboard_scan_reads_selected_rows() {
        let mut cia = Cia1::new(VideoStandard::Ntsc);
        let mut irq = IrqLine::new();
        cia.keyboard.set(1, 2, true);

        // Select row 1: drive port A output low on bit 1.
        cia.write_register(DDRA, 0xFF, &mut irq);
        cia.write_register(PRA, !0x02, &mut irq);
        let cols = cia.read_register(PRB, &mut irq);
        assert_eq!(cols & 0x04, 0, "column 2 pulled low");

        // Deselect: all columns float high.
        cia.write_register(PRA, 0xFF, &mut irq);
        let cols = cia.read_register(PRB, &mut irq);
        assert_eq!(cols, 0xFF);
    }

    #[test]
    fn joystick_lines_pull_ports_low() {
        let mut cia = Cia1::new(VideoStandard::Ntsc);
        let mut irq = IrqLine::new();
        cia.set_joystick1(JOY_FIRE);
        assert_eq!(cia.read_register(PRB, &mut irq) & JOY_FIRE, 0);
        cia.set_joystick2(JOY_FIRE);
        assert_eq!(cia.read_register(PRA, &mut irq) & JOY_FIRE, 0);
    }

    #[test]
    fn cassette_pulses_latch_flag() {
        let mut cia = Cia1::new(VideoStandard::Ntsc);
        let mut irq = IrqLine::new();
        cia.write_register(ICR, 0x90, &mut irq); // enable FLAG
        cia.set_flag_line(false, &mut irq);
        assert!(irq.active());
    }
}
