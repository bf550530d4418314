//! Управление обучением сигналами ОС.
//!
//! SIGINT и SIGHUP только выставляют флаги; солвер опрашивает их через
//! [`ActionCallback`] раз в итерацию. Каждый флаг сбрасывается при чтении.

use super::{ActionCallback, SolverAction};
use signal_hook::consts::SIGINT;
#[cfg(unix)]
use signal_hook::consts::SIGHUP;
use signal_hook::SigId;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct Flags {
    interrupt: Arc<AtomicBool>,
    hangup: Arc<AtomicBool>,
}

impl Flags {
    fn check(&self, on_interrupt: SolverAction, on_hangup: SolverAction) -> SolverAction {
        if self.hangup.swap(false, Ordering::SeqCst) {
            return on_hangup;
        }
        if self.interrupt.swap(false, Ordering::SeqCst) {
            return on_interrupt;
        }
        SolverAction::None
    }
}

/// Пока жив, перехватывает SIGINT и SIGHUP.
pub struct SignalHandler {
    on_interrupt: SolverAction,
    on_hangup: SolverAction,
    flags: Flags,
    registered: Vec<SigId>,
}

impl SignalHandler {
    pub fn new(on_interrupt: SolverAction, on_hangup: SolverAction) -> io::Result<Self> {
        let flags = Flags::default();
        let mut registered = vec![signal_hook::flag::register(
            SIGINT,
            Arc::clone(&flags.interrupt),
        )?];
        #[cfg(unix)]
        registered.push(signal_hook::flag::register(
            SIGHUP,
            Arc::clone(&flags.hangup),
        )?);
        Ok(Self {
            on_interrupt,
            on_hangup,
            flags,
            registered,
        })
    }

    /// Действие по последнему пришедшему сигналу; SIGHUP проверяется первым.
    pub fn check_for_signals(&self) -> SolverAction {
        self.flags.check(self.on_interrupt, self.on_hangup)
    }

    /// Callback для [`Solver::with_action_callback`](super::Solver::with_action_callback).
    pub fn action_callback(&self) -> ActionCallback {
        let flags = self.flags.clone();
        let (on_interrupt, on_hangup) = (self.on_interrupt, self.on_hangup);
        Box::new(move || flags.check(on_interrupt, on_hangup))
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_cleared_on_read() {
        let flags = Flags::default();
        flags.interrupt.store(true, Ordering::SeqCst);
        flags.hangup.store(true, Ordering::SeqCst);
        let check = || flags.check(SolverAction::Stop, SolverAction::Snapshot);
        assert_eq!(check(), SolverAction::Snapshot);
        assert_eq!(check(), SolverAction::Stop);
        assert_eq!(check(), SolverAction::None);
    }

    #[cfg(unix)]
    #[test]
    fn test_raised_signals_reach_the_callback() {
        let handler = SignalHandler::new(SolverAction::Stop, SolverAction::Snapshot).unwrap();
        let mut callback = handler.action_callback();
        assert_eq!(callback(), SolverAction::None);

        signal_hook::low_level::raise(SIGHUP).unwrap();
        assert_eq!(callback(), SolverAction::Snapshot);
        signal_hook::low_level::raise(SIGINT).unwrap();
        assert_eq!(handler.check_for_signals(), SolverAction::Stop);
        assert_eq!(callback(), SolverAction::None);
    }
}
