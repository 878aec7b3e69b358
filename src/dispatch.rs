//! Dispatch threads for carriers whose interrupts arrive through an OS
//! device rather than a bus vector.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};

use crate::carrier::IrqCore;
use crate::error::{IpacError, IpacResult};

/// What a wait on an interrupt device produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    /// Running interrupt count, as read from a UIO device.
    Count(u32),
    /// A vector delivered by the device driver.
    Vector(u8),
    /// The wait timed out.
    Idle,
}

/// A blocking interrupt event stream.
pub trait InterruptSource: Send {
    /// Waits at most `timeout` for the next event.
    ///
    /// `Err(DeviceGone)` means the stream is closed for good; any other
    /// error is transient.
    fn wait(&mut self, timeout: Duration) -> IpacResult<IrqEvent>;
}

/// Detects interrupts the event count skipped over.
#[derive(Debug, Default)]
pub struct MissedCounter {
    last: Option<u32>,
}

impl MissedCounter {
    /// Records `count` and returns how many interrupts went unseen since the
    /// previous one.
    pub fn observe(&mut self, count: u32) -> u32 {
        let missed = match self.last {
            Some(last) => count.wrapping_sub(last).saturating_sub(1),
            None => 0,
        };
        self.last = Some(count);
        missed
    }
}

/// Handles one event for `core`. Returns false when the loop should stop.
fn handle_event(core: &IrqCore, missed: &mut MissedCounter, event: IpacResult<IrqEvent>) -> bool {
    let name = core.board().name();
    match event {
        Ok(IrqEvent::Idle) => {}
        Ok(IrqEvent::Count(count)) => {
            let skipped = missed.observe(count);
            if skipped > 0 {
                warn!("{}: we missed {} interrupts", name, skipped);
                core.stats().add_missed(skipped as u64);
            }
            match core.dispatch_pending() {
                Ok(0) => trace!("{}: interrupt {} with nothing pending", name, count),
                Ok(_) => {}
                Err(e) => {
                    core.stats().add_io_error();
                    error!("{}: reading pending interrupts: {}", name, e);
                }
            }
        }
        Ok(IrqEvent::Vector(vector)) => {
            if !core.service_vector(vector) {
                debug!("{}: no handler for vector {:#x}", name, vector);
            }
        }
        Err(IpacError::DeviceGone) => {
            warn!("{}: interrupt device closed, dispatch stopping", name);
            return false;
        }
        Err(e) => {
            core.stats().add_io_error();
            error!("{}: interrupt device read failed: {}", name, e);
        }
    }
    true
}

/// A long-running thread feeding one carrier's interrupt events into its
/// routing tables.
pub struct DispatchThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchThread {
    /// `poll` bounds each wait so the stop flag is seen promptly.
    pub fn spawn(
        name: String,
        core: Arc<IrqCore>,
        mut source: Box<dyn InterruptSource>,
        poll: Duration,
    ) -> IpacResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut missed = MissedCounter::default();
                while !flag.load(Ordering::Acquire) {
                    let event = source.wait(poll);
                    if !handle_event(&core, &mut missed, event) {
                        break;
                    }
                }
                debug!("{}: dispatch thread exiting", core.board().name());
            })
            .map_err(|e| {
                error!("cannot start dispatch thread: {}", e);
                IpacError::NoMemory
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatchThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missed_counts() {
        let mut m = MissedCounter::default();
        assert_eq!(m.observe(7), 0);
        assert_eq!(m.observe(8), 0);
        assert_eq!(m.observe(11), 2);
        assert_eq!(m.observe(11), 0);
    }

    #[test]
    fn missed_counts_across_wrap() {
        let mut m = MissedCounter::default();
        m.observe(u32::MAX - 1);
        assert_eq!(m.observe(1), 2);
    }
}
