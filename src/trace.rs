//! Execution tracing context.
//!
//! Instead of singleton loggers, the machine passes one `TraceContext`
//! value into the tick paths that can report transitions.  Everything is
//! off by default; the headless runner and the monitor flip categories on.

/// Trace categories, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCat {
    Cpu,
    Pla,
    Vic,
    Cia1,
    Cia2,
    Iec,
    Drive,
}

/// Breakpoint predicate: return true to request a stop at this PC.
pub type BreakPredicate = Box<dyn Fn(u16) -> bool + Send>;

pub struct TraceContext {
    enabled: u8,
    break_pred: Option<BreakPredicate>,
    /// Set when the breakpoint predicate fired; cleared by the host.
    pub break_hit: bool,
}

impl TraceContext {
    pub fn new() -> Self {
        Self {
            enabled: 0,
            break_pred: None,
            break_hit: false,
        }
    }

    pub fn enable(&mut self, cat: TraceCat) {
        self.enabled |= 1 << (cat as u8);
    }

    pub fn disable(&mut self, cat: TraceCat) {
        self.enabled &= !(1 << (cat as u8));
    }

    pub fn on(&self, cat: TraceCat) -> bool {
        self.enabled & (1 << (cat as u8)) != 0
    }

    pub fn set_breakpoint(&mut self, pred: BreakPredicate) {
        self.break_pred = Some(pred);
    }

    pub fn clear_breakpoint(&mut self) {
        self.break_pred = None;
    }

    /// Called by the machine loop with the pre-instruction PC.
    pub fn check_break(&mut self, pc: u16) {
        if let Some(ref p) = self.break_pred {
            if p(pc) {
                self.break_hit = true;
            }
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_toggle_independently() {
        let mut t = TraceContext::new();
        t.enable(TraceCat::Pla);
        assert!(t.on(TraceCat::Pla));
        assert!(!t.on(TraceCat::Cpu));
        t.disable(TraceCat::Pla);
        assert!(!t.on(TraceCat::Pla));
    }

    #[test]
    fn breakpoint_fires_on_match() {
        let mut t = TraceContext::new();
        t.set_breakpoint(Box::new(|pc| pc == 0x0810));
        t.check_break(0x0800);
        assert!(!t.break_hit);
        t.check_break(0x0810);
        assert!(t.break_hit);
    }
}
