//! Interrupt delivery through OS event devices and hotswap presence polling.
#![cfg(feature = "std")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ipac_carrier::boards::{HY8002, HY_LINUX, TAMC220};
use ipac_carrier::dispatch::IrqEvent;
use ipac_carrier::hotswap::PresenceChange;
use ipac_carrier::platform::{BusSpace, EventDevice, HytecRegion, SimMemory, SimPlatform};
use ipac_carrier::{CarrierRegistry, IpacError, IrqCommand, IrqHandler, RegistryOptions};

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast() -> RegistryOptions {
    RegistryOptions {
        presence_interval: Duration::from_millis(10),
        dispatch_poll: Duration::from_millis(10),
    }
}

fn counter() -> (Arc<AtomicUsize>, IrqHandler) {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    (
        hits,
        Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

/// Polls `cond` until it holds or `WAIT` runs out.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn tamc220_registers(sim: &SimPlatform) -> Arc<SimMemory> {
    let (mem, offset) = sim
        .memory(BusSpace::UioResource { uio: 2, bar: 2 }, 0)
        .expect("control BAR is mapped");
    assert_eq!(offset, 0);
    mem
}

#[test]
fn uio_count_dispatches_pending_lines() {
    init_logging();
    let sim = SimPlatform::new();
    let events = sim.events(EventDevice::Uio(2));
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&TAMC220, "2", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();
    assert!(carrier.dispatch_running());

    let (hits, handler) = counter();
    carrier.connect_line(1, 1, handler).unwrap();
    registry.irq_cmd(handle, 1, 1, IrqCommand::Enable).unwrap();

    let regs = tamc220_registers(&sim);
    regs.poke16(0x0C, 1 << 3);

    assert!(events.send(IrqEvent::Count(1)));
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));
    assert_eq!(carrier.counters().missed, 0);

    assert!(events.send(IrqEvent::Count(5)));
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 2));
    let c = carrier.counters();
    assert_eq!(c.missed, 3);
    assert_eq!(c.dispatched, 2);
}

#[test]
fn disabled_lines_are_not_dispatched() {
    init_logging();
    let sim = SimPlatform::new();
    let events = sim.events(EventDevice::Uio(2));
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&TAMC220, "2", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();

    let (hits, handler) = counter();
    registry.int_connect(handle, 0, 0, handler).unwrap();
    registry.irq_cmd(handle, 0, 0, IrqCommand::Enable).unwrap();

    // Both lines of slot 0 asserted, only line 0 enabled.
    tamc220_registers(&sim).poke16(0x0C, 0b11);
    assert!(events.send(IrqEvent::Count(1)));
    assert!(eventually(|| carrier.counters().dispatched == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_handler_is_counted_and_dispatch_continues() {
    init_logging();
    let sim = SimPlatform::new();
    let events = sim.events(EventDevice::Uio(4));
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&TAMC220, "4", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();

    carrier
        .connect_line(0, 0, Arc::new(|| panic!("handler bug")))
        .unwrap();
    registry.irq_cmd(handle, 0, 0, IrqCommand::Enable).unwrap();
    let (mem, _) = sim
        .memory(BusSpace::UioResource { uio: 4, bar: 2 }, 0)
        .unwrap();
    mem.poke16(0x0C, 1);

    assert!(events.send(IrqEvent::Count(1)));
    assert!(eventually(|| carrier.counters().faults == 1));
    assert!(events.send(IrqEvent::Count(2)));
    assert!(eventually(|| carrier.counters().faults == 2));
    assert!(carrier.dispatch_running());
}

#[test]
fn closed_device_stops_dispatch() {
    init_logging();
    let sim = SimPlatform::new();
    let events = sim.events(EventDevice::Uio(0));
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&TAMC220, "0", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();
    assert!(carrier.dispatch_running());

    events.close();
    assert!(eventually(|| !carrier.dispatch_running()));
    assert!(!events.send(IrqEvent::Count(1)));

    registry.destroy(handle).unwrap();
    drop(carrier);
    assert_eq!(sim.registered_count(), 0);
}

fn hylinux_sim(hardware_id: u16) -> Arc<SimPlatform> {
    let sim = SimPlatform::new();
    let config = sim.attach(
        BusSpace::Hytec {
            device: None,
            region: HytecRegion::Config,
        },
        0,
        2,
    );
    config.poke16(0, hardware_id);
    sim
}

#[test]
fn driver_vectors_reach_connected_handlers() {
    init_logging();
    let sim = hylinux_sim(0x9010);
    let events = sim.events(EventDevice::Hytec(None));
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&HY_LINUX, "99,3", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();
    assert!(!carrier.dispatch_running());
    assert!(carrier.carrier_info().unwrap().contains("0x9010"));

    let (hits, handler) = counter();
    registry.int_connect(handle, 0, 0x42, handler).unwrap();
    assert!(sim.connected_vectors().contains(&0x42));
    assert!(carrier.dispatch_running());

    assert!(events.send(IrqEvent::Vector(0x42)));
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 1));

    assert!(events.send(IrqEvent::Vector(0x43)));
    assert!(eventually(|| carrier.counters().unused == 1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_hardware_id_is_rejected() {
    init_logging();
    let sim = hylinux_sim(0x1234);
    let registry = CarrierRegistry::new(sim.clone());
    assert_eq!(
        registry.initialise(&HY_LINUX, "99,3", 0).err(),
        Some(IpacError::BadModule)
    );
    assert!(registry.is_empty());
    assert_eq!(sim.registered_count(), 0);
}

/// A Hy8002 at VME slot 3 with a valid configuration ROM.
fn hy8002_sim() -> (Arc<SimPlatform>, Arc<SimMemory>) {
    let sim = SimPlatform::new();
    let a16 = sim.attach(BusSpace::VmeA16, 3 << 11, 0x800);
    let rom = [
        (0x1F, b'C'),
        (0x23, b'R'),
        (0x27, 0x00),
        (0x2B, 0x80),
        (0x2F, 0x03),
        (0x33, 0x80),
        (0x37, 0x02),
        (0x3B, 0x00),
        (0x3F, 0x00),
    ];
    for (offset, value) in rom {
        a16.poke8(0x600 + offset, value);
    }
    (sim, a16)
}

#[test]
fn hotswap_restores_registers_on_insertion() {
    init_logging();
    let (sim, a16) = hy8002_sim();
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&HY8002, "3,2,0x40", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();
    assert!(sim.connected_vectors().contains(&0x40));
    assert_eq!(a16.peek16(0x410), 0x40);

    registry.irq_cmd(handle, 1, 0, IrqCommand::Enable).unwrap();
    let csr = a16.peek16(0x408);
    let intsel = a16.peek16(0x40C);
    assert_ne!(intsel, 0);

    a16.set_present(false);
    let event = registry.next_presence_event(Some(WAIT)).unwrap();
    assert_eq!(event.carrier, handle);
    assert_eq!(event.change, PresenceChange::Removed);
    assert!(!carrier.is_present());

    // Power-on values of a freshly inserted board.
    a16.poke16(0x408, 0);
    a16.poke16(0x40C, 0);
    a16.set_present(true);
    let event = registry.next_presence_event(Some(WAIT)).unwrap();
    assert_eq!(event.change, PresenceChange::Inserted);
    assert!(carrier.is_present());
    assert_eq!(a16.peek16(0x408), csr);
    assert_eq!(a16.peek16(0x40C), intsel);
}

#[test]
fn hotswap_vector_marks_the_carrier_for_rescan() {
    init_logging();
    let (sim, a16) = hy8002_sim();
    let registry = CarrierRegistry::with_options(sim.clone(), fast());
    let handle = registry.initialise(&HY8002, "3,2,0x40", 0).unwrap();
    let carrier = registry.lookup(handle).unwrap();
    let csr = a16.peek16(0x408);

    // The board was swapped faster than the scan period.
    a16.poke16(0x408, 0);
    assert!(carrier.service_vector(0x40));
    let event = registry.next_presence_event(Some(WAIT)).unwrap();
    assert_eq!(event.change, PresenceChange::Inserted);
    assert!(carrier.is_present());
    assert_eq!(a16.peek16(0x408), csr);
}

#[test]
fn carriers_without_hotswap_have_no_presence_events() {
    init_logging();
    let (sim, _) = hy8002_sim();
    let registry = CarrierRegistry::with_options(sim, fast());
    registry.initialise(&HY8002, "3,2", 0).unwrap();
    assert!(registry
        .next_presence_event(Some(Duration::from_millis(50)))
        .is_none());
}
