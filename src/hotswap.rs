//! Presence polling for hot-swappable carriers.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use spin::Mutex;

use crate::carrier::IrqCore;
use crate::queue::EventQueue;
use crate::registry::CarrierHandle;

/// Depth of the insertion/removal event queue.
const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Inserted,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEvent {
    pub carrier: CarrierHandle,
    pub change: PresenceChange,
}

struct Watch {
    carrier: CarrierHandle,
    core: Arc<IrqCore>,
    present: bool,
}

/// Polls every watched carrier at a fixed interval and reports edges.
///
/// On insertion the carrier's register mirror is written back, since a
/// freshly inserted board comes up with its power-on register values.
pub struct PresenceMonitor {
    watches: Arc<Mutex<Vec<Watch>>>,
    events: Arc<EventQueue<PresenceEvent>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// One pass over the list. The list lock is held throughout.
fn scan(watches: &Mutex<Vec<Watch>>, events: &EventQueue<PresenceEvent>) {
    let mut watches = watches.lock();
    for watch in watches.iter_mut() {
        let name = watch.core.board().name();
        let now = watch.core.detect_presence();
        let change = match (watch.present, now) {
            (true, false) => PresenceChange::Removed,
            (false, true) => PresenceChange::Inserted,
            // Pulled and reseated between scans; the hotswap interrupt saw it.
            (true, true) if !watch.core.is_present() => PresenceChange::Inserted,
            _ => continue,
        };
        watch.present = now;
        watch.core.set_present(now);
        match change {
            PresenceChange::Inserted => {
                info!("{}: BOARD INSERTION on carrier {}", name, watch.carrier);
                if let Err(e) = watch.core.flush_mirror() {
                    error!("{}: cannot restore registers after insertion: {}", name, e);
                }
            }
            PresenceChange::Removed => {
                info!("{}: BOARD REMOVAL on carrier {}", name, watch.carrier);
            }
        }
        let event = PresenceEvent {
            carrier: watch.carrier,
            change,
        };
        if !events.push(event) {
            warn!("{}: presence event queue full, dropped {:?}", name, change);
        }
    }
}

impl PresenceMonitor {
    pub fn spawn(interval: Duration) -> Self {
        let watches: Arc<Mutex<Vec<Watch>>> = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(EventQueue::new(EVENT_QUEUE_DEPTH));
        let stop = Arc::new(AtomicBool::new(false));

        let (w, e, s) = (watches.clone(), events.clone(), stop.clone());
        let handle = thread::Builder::new()
            .name("ipac-hotswap".into())
            .spawn(move || {
                while !s.load(Ordering::Acquire) {
                    scan(&w, &e);
                    thread::park_timeout(interval);
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("cannot start presence monitor: {}", err);
                None
            }
        };
        Self {
            watches,
            events,
            stop,
            handle,
        }
    }

    pub fn watch(&self, carrier: CarrierHandle, core: Arc<IrqCore>) {
        let present = core.is_present();
        self.watches.lock().push(Watch {
            carrier,
            core,
            present,
        });
    }

    pub fn unwatch(&self, carrier: CarrierHandle) {
        self.watches.lock().retain(|w| w.carrier != carrier);
    }

    pub fn watched(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// The next insertion or removal, waiting up to `timeout`.
    pub fn next_event(&self, timeout: Option<Duration>) -> Option<PresenceEvent> {
        self.events.read(timeout)
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("presence monitor panicked");
            }
        }
    }
}
