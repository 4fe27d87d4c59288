use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::FailureReport;

/// Bootstrap phases, in the order they are entered. Diagnostic context only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Update,
    Syncfile,
    Wrapper,
    Create,
    Prepare,
    Start,
    Init,
}

impl Phase {
    const ALL: [Phase; 7] = [
        Phase::Update,
        Phase::Syncfile,
        Phase::Wrapper,
        Phase::Create,
        Phase::Prepare,
        Phase::Start,
        Phase::Init,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Phase::Update => "Update",
            Phase::Syncfile => "Syncfile",
            Phase::Wrapper => "Wrapper",
            Phase::Create => "Create",
            Phase::Prepare => "Prepare",
            Phase::Start => "Start",
            Phase::Init => "Init",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Init
    }

    fn index(self) -> u8 {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0) as u8
    }

    fn from_index(index: u8) -> Phase {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(Phase::Update)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Current phase, written by the bootstrap worker and read for display.
#[derive(Clone, Debug, Default)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn get(&self) -> Phase {
        Phase::from_index(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase.index(), Ordering::Relaxed);
    }
}

/// Notifications sent from the worker to the presentation side, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum BootstrapEvent {
    Phase(Phase),
    Progress(f64),
    WhatsNew(String),
    Failure(FailureReport),
    Finished { lingering: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cell_round_trips_every_phase() {
        let cell = PhaseCell::default();
        assert_eq!(cell.get(), Phase::Update);
        for phase in Phase::ALL {
            cell.set(phase);
            assert_eq!(cell.get(), phase);
        }
    }

    #[test]
    fn only_init_is_terminal() {
        assert!(Phase::Init.is_terminal());
        assert!(!Phase::Start.is_terminal());
        assert_eq!(Phase::Syncfile.to_string(), "Syncfile");
    }
}
