//! Linux user-space platform: PCI carriers through UIO, Hytec carriers
//! through the Hytec character device driver.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use axaddrspace::device::AccessWidth;
use log::{debug, info, warn};
use spin::Mutex;

use super::{BusSpace, EventDevice, HytecRegion, Platform, WindowRequest};
use crate::dispatch::{InterruptSource, IrqEvent};
use crate::error::{IpacError, IpacResult};
use crate::utils::check_access;
use crate::window::{MmioWindow, RegisterWindow};

const HYTEC_IOC_MAGIC: libc::c_ulong = b'H' as libc::c_ulong;

const fn io(nr: libc::c_ulong) -> libc::c_ulong {
    (HYTEC_IOC_MAGIC << 8) | nr
}

/// `_IOR`/`_IOW` with an `int` argument.
const fn io_int(dir: libc::c_ulong, nr: libc::c_ulong) -> libc::c_ulong {
    (dir << 30) | (4 << 16) | (HYTEC_IOC_MAGIC << 8) | nr
}

const OP_GET_CONFIG: libc::c_ulong = io(1);
const OP_CARRIER_READ_BLOCK: libc::c_ulong = io_int(2, 5);
const OP_CARRIER_WRITE_BLOCK: libc::c_ulong = io_int(1, 6);
const OP_BASE_ADD3: libc::c_ulong = io(19);
const OP_REGISTER_VECTOR: libc::c_ulong = io(23);

#[repr(C)]
#[derive(Default)]
struct IoctlBuf {
    data: libc::c_ulong,
    address: libc::c_ulong,
    length: libc::c_ulong,
}

#[repr(C)]
#[derive(Default)]
struct IoctlConfig {
    hardware_id: u16,
}

/// PCI command register byte holding the INTx disable bit.
const PCI_COMMAND_HI: u64 = 5;
const PCI_INTX_DISABLE: u8 = 0x04;

fn io_error(what: &str, err: io::Error) -> IpacError {
    warn!("{}: {}", what, err);
    IpacError::Io
}

/// A shared `mmap` of a device file.
struct MmapWindow {
    mmio: MmioWindow,
    addr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is plain device memory; all access goes through
// volatile loads and stores.
unsafe impl Send for MmapWindow {}
unsafe impl Sync for MmapWindow {}

impl MmapWindow {
    fn map(file: &File, offset: usize, len: usize) -> IpacResult<Self> {
        // SAFETY: a fresh shared mapping; the kernel validates fd and range.
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            warn!(
                "mmap of {:#x} bytes at {:#x} failed: {}",
                len,
                offset,
                io::Error::last_os_error()
            );
            return Err(IpacError::NoMemory);
        }
        Ok(Self {
            // SAFETY: the mapping lives until `drop`.
            mmio: unsafe { MmioWindow::new(addr as usize, len) },
            addr,
            len,
        })
    }
}

impl RegisterWindow for MmapWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn host_addr(&self) -> usize {
        self.addr as usize
    }

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        self.mmio.read(offset, width)
    }

    fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()> {
        self.mmio.write(offset, width, value)
    }
}

impl Drop for MmapWindow {
    fn drop(&mut self) {
        // SAFETY: `addr` and `len` come from a successful mmap.
        unsafe { libc::munmap(self.addr, self.len) };
    }
}

/// An open Hytec carrier device node.
struct HytecDevice {
    file: File,
    path: PathBuf,
}

impl HytecDevice {
    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> IpacResult<()> {
        // SAFETY: `arg` is the repr(C) layout the driver expects for `request`.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            warn!("{}: ioctl {:#x} failed: {}", self.path.display(), request, err);
            return Err(IpacError::Io);
        }
        Ok(())
    }

    fn carrier_read(&self, register: usize) -> IpacResult<u16> {
        let mut value: u16 = 0;
        let mut buf = IoctlBuf {
            data: &mut value as *mut u16 as libc::c_ulong,
            address: register as libc::c_ulong,
            length: 1,
        };
        self.ioctl(OP_CARRIER_READ_BLOCK, &mut buf)?;
        Ok(value)
    }

    fn carrier_write(&self, register: usize, value: u16) -> IpacResult<()> {
        let mut value = value;
        let mut buf = IoctlBuf {
            data: &mut value as *mut u16 as libc::c_ulong,
            address: register as libc::c_ulong,
            length: 1,
        };
        self.ioctl(OP_CARRIER_WRITE_BLOCK, &mut buf)
    }

    fn hardware_id(&self) -> IpacResult<u16> {
        let mut config = IoctlConfig::default();
        self.ioctl(OP_GET_CONFIG, &mut config)?;
        Ok(config.hardware_id)
    }
}

/// Carrier registers, one ioctl per 16-bit access.
struct HytecRegisters {
    device: Arc<HytecDevice>,
    len: usize,
}

impl RegisterWindow for HytecRegisters {
    fn len(&self) -> usize {
        self.len
    }

    fn host_addr(&self) -> usize {
        0
    }

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        check_access(offset, width, self.len)?;
        match width {
            AccessWidth::Word => Ok(self.device.carrier_read(offset)? as usize),
            _ => Err(IpacError::NotImplemented),
        }
    }

    fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()> {
        check_access(offset, width, self.len)?;
        match width {
            AccessWidth::Word => self.device.carrier_write(offset, value as u16),
            _ => Err(IpacError::NotImplemented),
        }
    }
}

/// The driver configuration, exposed as a read-only word holding the
/// hardware ID.
struct HytecConfig {
    device: Arc<HytecDevice>,
}

impl RegisterWindow for HytecConfig {
    fn len(&self) -> usize {
        2
    }

    fn host_addr(&self) -> usize {
        0
    }

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        check_access(offset, width, 2)?;
        match width {
            AccessWidth::Word => Ok(self.device.hardware_id()? as usize),
            _ => Err(IpacError::NotImplemented),
        }
    }

    fn write(&self, _offset: usize, _width: AccessWidth, _value: usize) -> IpacResult<()> {
        Err(IpacError::NotImplemented)
    }
}

/// `/dev/uioN`. Each wait re-enables INTx, which the UIO core disabled
/// when it delivered the previous interrupt.
struct UioEventSource {
    dev: File,
    config: File,
}

impl UioEventSource {
    fn unmask(&self) -> IpacResult<()> {
        let mut byte = [0u8; 1];
        self.config
            .read_exact_at(&mut byte, PCI_COMMAND_HI)
            .map_err(|e| io_error("uio: reading PCI command", e))?;
        byte[0] &= !PCI_INTX_DISABLE;
        self.config
            .write_all_at(&byte, PCI_COMMAND_HI)
            .map_err(|e| io_error("uio: writing PCI command", e))
    }
}

/// Waits until `file` is readable. `Ok(false)` on timeout.
fn poll_readable(file: &File, timeout: Duration) -> IpacResult<bool> {
    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd.
    let ret = unsafe { libc::poll(&mut fds, 1, ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(io_error("poll", err));
    }
    if ret == 0 {
        return Ok(false);
    }
    if fds.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
        return Err(IpacError::DeviceGone);
    }
    Ok(true)
}

impl InterruptSource for UioEventSource {
    fn wait(&mut self, timeout: Duration) -> IpacResult<IrqEvent> {
        self.unmask()?;
        if !poll_readable(&self.dev, timeout)? {
            return Ok(IrqEvent::Idle);
        }
        let mut count = [0u8; 4];
        match self.dev.read_exact(&mut count) {
            Ok(()) => Ok(IrqEvent::Count(u32::from_ne_bytes(count))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(IpacError::DeviceGone),
            Err(e) => Err(io_error("uio: reading interrupt count", e)),
        }
    }
}

/// A Hytec device node read for interrupt vectors.
struct HytecVectorSource {
    file: File,
}

impl InterruptSource for HytecVectorSource {
    fn wait(&mut self, timeout: Duration) -> IpacResult<IrqEvent> {
        if !poll_readable(&self.file, timeout)? {
            return Ok(IrqEvent::Idle);
        }
        let mut vector = [0u8; 4];
        match self.file.read_exact(&mut vector) {
            Ok(()) => Ok(IrqEvent::Vector((i32::from_ne_bytes(vector) & 0xFF) as u8)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(IpacError::DeviceGone),
            Err(e) => Err(io_error("hytec: reading interrupt vector", e)),
        }
    }
}

/// Host platform for carriers reachable from Linux user space.
///
/// There is no VME bridge, so VME requests fail with `BadDriver`.
pub struct LinuxPlatform {
    sysfs_uio: PathBuf,
    dev: PathBuf,
    hytec: Mutex<BTreeMap<Option<u8>, Arc<HytecDevice>>>,
    registered: Mutex<Vec<WindowRequest>>,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::with_roots("/sys/class/uio", "/dev")
    }
}

impl LinuxPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A platform that looks for UIO class entries under `sysfs_uio` and
    /// device nodes under `dev`.
    pub fn with_roots(sysfs_uio: impl AsRef<Path>, dev: impl AsRef<Path>) -> Self {
        Self {
            sysfs_uio: sysfs_uio.as_ref().to_path_buf(),
            dev: dev.as_ref().to_path_buf(),
            hytec: Mutex::new(BTreeMap::new()),
            registered: Mutex::new(Vec::new()),
        }
    }

    fn open_rw(path: &Path) -> IpacResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                warn!("cannot open {}: {}", path.display(), e);
                IpacError::BadDriver
            })
    }

    fn hytec_path(&self, device: Option<u8>) -> PathBuf {
        match device {
            Some(n) => self.dev.join(format!("IOC9010{}", n)),
            None => self.dev.join("IOC9010"),
        }
    }

    fn hytec_device(&self, device: Option<u8>) -> IpacResult<Arc<HytecDevice>> {
        let mut open = self.hytec.lock();
        if let Some(dev) = open.get(&device) {
            return Ok(dev.clone());
        }
        let path = self.hytec_path(device);
        let file = Self::open_rw(&path)?;
        info!("opened {}", path.display());
        let dev = Arc::new(HytecDevice { file, path });
        open.insert(device, dev.clone());
        Ok(dev)
    }

    fn map_uio(
        &self,
        uio: u32,
        bar: u8,
        request: &WindowRequest,
    ) -> IpacResult<Arc<dyn RegisterWindow>> {
        let path = self
            .sysfs_uio
            .join(format!("uio{}", uio))
            .join("device")
            .join(format!("resource{}", bar));
        let file = Self::open_rw(&path)?;
        let window = MmapWindow::map(&file, request.base.as_usize(), request.len)?;
        Ok(Arc::new(window))
    }

    fn map_hytec(
        &self,
        device: Option<u8>,
        region: HytecRegion,
        request: &WindowRequest,
    ) -> IpacResult<Arc<dyn RegisterWindow>> {
        let dev = self.hytec_device(device)?;
        Ok(match region {
            HytecRegion::Registers => Arc::new(HytecRegisters {
                device: dev,
                len: request.len,
            }),
            HytecRegion::Config => Arc::new(HytecConfig { device: dev }),
            HytecRegion::Memory => {
                let mut buf = IoctlBuf::default();
                dev.ioctl(OP_BASE_ADD3, &mut buf)?;
                let offset = buf.address as usize + request.base.as_usize();
                Arc::new(MmapWindow::map(&dev.file, offset, request.len)?)
            }
        })
    }
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn map(&self, request: &WindowRequest) -> IpacResult<Arc<dyn RegisterWindow>> {
        let mut registered = self.registered.lock();
        if registered.iter().any(|r| r.overlaps(request)) {
            warn!("{:?} at {:#x} is already registered", request.space, request.base.as_usize());
            return Err(IpacError::NoMemory);
        }
        let window = match request.space {
            BusSpace::VmeA16 | BusSpace::VmeA24 | BusSpace::VmeA32 => {
                warn!("no VME bridge for {:?}", request.space);
                return Err(IpacError::BadDriver);
            }
            BusSpace::UioResource { uio, bar } => self.map_uio(uio, bar, request)?,
            BusSpace::Hytec { device, region } => self.map_hytec(device, region, request)?,
        };
        debug!(
            "linux: mapped {:?} {:#x}+{:#x}",
            request.space,
            request.base.as_usize(),
            request.len
        );
        registered.push(*request);
        Ok(window)
    }

    fn unmap(&self, request: &WindowRequest) {
        let mut registered = self.registered.lock();
        if let Some(pos) = registered.iter().position(|r| r == request) {
            registered.remove(pos);
        }
    }

    fn open_events(&self, device: EventDevice) -> IpacResult<Box<dyn InterruptSource>> {
        match device {
            EventDevice::Uio(n) => {
                let dev = Self::open_rw(&self.dev.join(format!("uio{}", n)))?;
                let config = Self::open_rw(
                    &self
                        .sysfs_uio
                        .join(format!("uio{}", n))
                        .join("device")
                        .join("config"),
                )?;
                Ok(Box::new(UioEventSource { dev, config }))
            }
            EventDevice::Hytec(n) => {
                let dev = self.hytec_device(n)?;
                let file = dev
                    .file
                    .try_clone()
                    .map_err(|e| io_error("hytec: duplicating device handle", e))?;
                Ok(Box::new(HytecVectorSource { file }))
            }
        }
    }

    fn register_vector(&self, device: EventDevice, vector: u8) -> IpacResult<()> {
        match device {
            EventDevice::Hytec(n) => {
                let mut buf = IoctlBuf {
                    data: vector as libc::c_ulong,
                    ..IoctlBuf::default()
                };
                self.hytec_device(n)?.ioctl(OP_REGISTER_VECTOR, &mut buf)
            }
            EventDevice::Uio(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers() {
        assert_eq!(OP_GET_CONFIG, 0x4801);
        assert_eq!(OP_BASE_ADD3, 0x4813);
        assert_eq!(OP_REGISTER_VECTOR, 0x4817);
        assert_eq!(OP_CARRIER_READ_BLOCK, 0x8004_4805);
        assert_eq!(OP_CARRIER_WRITE_BLOCK, 0x4004_4806);
    }

    #[test]
    fn vme_needs_a_bridge() {
        let linux = LinuxPlatform::with_roots("/nonexistent/uio", "/nonexistent/dev");
        let req = WindowRequest::new(BusSpace::VmeA16, 0x1800, 0x100, AccessWidth::Word);
        assert_eq!(linux.map(&req).err(), Some(IpacError::BadDriver));
        let uio = WindowRequest::new(
            BusSpace::UioResource { uio: 0, bar: 2 },
            0,
            0x100,
            AccessWidth::Word,
        );
        assert_eq!(linux.map(&uio).err(), Some(IpacError::BadDriver));
        assert_eq!(
            linux.open_events(EventDevice::Hytec(None)).err(),
            Some(IpacError::BadDriver)
        );
    }
}
