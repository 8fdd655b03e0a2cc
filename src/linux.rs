// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Linux userspace backend.
//!
//! - The accelerator registers and the DMA channel's DCR window are mapped
//!   from `/dev/mem`.
//! - The register region is reserved with an exclusive `flock` on a lock
//!   file named after its base address.
//! - The interrupt line is a UIO device. A thread blocks on it and runs the
//!   bound handler.
//! - Descriptor memory and payload staging come from a `u-dma-buf` buffer
//!   opened with `O_SYNC`, so CPU accesses are uncached.

use crate::error::{DpiError, DpiResult};
use crate::platform::{
    CoherentMemory, DcrResource, DmaMapper, DmaMapping, IrqHandler, IrqLine, IrqReturn, MemRegion,
    Platform,
};
use crate::regs::{DcrIo, DcrReg, RegisterIo};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Bytes of the u-dma-buf buffer reserved for coherent allocations.
/// Payloads are staged behind it.
pub const COHERENT_SLOT_LEN: usize = 0x1000;

/// How long the interrupt thread blocks before checking for shutdown.
const IRQ_POLL_MS: libc::c_int = 100;

/// Where the backend finds its kernel interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxConfig {
    /// Physical memory device, normally `/dev/mem`.
    pub mem_device: PathBuf,
    /// UIO device bound to the DMA TX interrupt.
    pub uio_device: PathBuf,
    /// Name of the u-dma-buf buffer, e.g. `udmabuf0`.
    pub udmabuf: String,
    /// Physical address of DCR register 0 when DCRs are memory mapped.
    pub dcr_mmio_base: u64,
    /// Directory for region lock files.
    pub lock_dir: PathBuf,
}

impl Default for LinuxConfig {
    fn default() -> Self {
        Self {
            mem_device: PathBuf::from("/dev/mem"),
            uio_device: PathBuf::from("/dev/uio0"),
            udmabuf: "udmabuf0".to_string(),
            dcr_mmio_base: 0,
            lock_dir: PathBuf::from("/run/lock"),
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn open_sync(path: &Path) -> DpiResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| {
            DpiError::ResourceUnavailable(format!("cannot open {}: {e}", path.display()))
        })
}

// ============================================================================
// Memory mapped windows
// ============================================================================

/// A shared mapping of `len` bytes at physical offset `phys` of a device file.
struct Mmio {
    ptr: *mut u8,
    len: usize,
    page_offset: usize,
}

// SAFETY: the mapping is only accessed through volatile word reads and
// writes; the hardware serializes concurrent accesses.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    fn map(file: &File, phys: u64, len: usize) -> DpiResult<Self> {
        let page_offset = (phys % page_size() as u64) as usize;
        let map_base = phys - page_offset as u64;
        let map_len = len + page_offset;

        // SAFETY: fresh mapping, checked against MAP_FAILED below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                map_base as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(DpiError::ResourceUnavailable(format!(
                "mmap of {len:#x} bytes at {phys:#x} failed: {err}"
            )));
        }

        Ok(Self {
            // SAFETY: page_offset < map_len.
            ptr: unsafe { (ptr as *mut u8).add(page_offset) },
            len,
            page_offset,
        })
    }

    #[inline]
    fn read32(&self, offset: usize) -> Option<u32> {
        if offset % 4 != 0 || offset + 4 > self.len {
            return None;
        }
        // SAFETY: in bounds and aligned.
        Some(unsafe { std::ptr::read_volatile(self.ptr.add(offset) as *const u32) })
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) -> bool {
        if offset % 4 != 0 || offset + 4 > self.len {
            return false;
        }
        // SAFETY: in bounds and aligned.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset) as *mut u32, value) };
        true
    }

    /// Copy `bytes` to `offset`. The caller keeps the range in bounds.
    fn copy_in(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.len);
        // SAFETY: caller keeps the range in bounds; the source is a
        // distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        fence(Ordering::SeqCst);
    }
}

impl Drop for Mmio {
    fn drop(&mut self) {
        // SAFETY: undoes the mapping created in `map`.
        unsafe {
            libc::munmap(
                self.ptr.sub(self.page_offset) as *mut libc::c_void,
                self.len + self.page_offset,
            );
        }
    }
}

/// Accelerator register block mapped from `/dev/mem`.
pub struct LinuxRegisters {
    mmio: Mmio,
}

impl RegisterIo for LinuxRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.mmio.read32(offset).unwrap_or_else(|| {
            log::warn!("register read outside window: {offset:#x}");
            0
        })
    }

    fn write32(&self, offset: usize, value: u32) {
        if !self.mmio.write32(offset, value) {
            log::warn!("register write outside window: {offset:#x}");
        }
    }
}

/// DMA channel DCRs reached through their memory mapped alias.
pub struct LinuxChannel {
    mmio: Mmio,
}

impl DcrIo for LinuxChannel {
    fn dcr_read(&self, reg: DcrReg) -> u32 {
        self.mmio.read32(reg.index() as usize * 4).unwrap_or(0)
    }

    fn dcr_write(&self, reg: DcrReg, value: u32) {
        if !self.mmio.write32(reg.index() as usize * 4, value) {
            log::warn!("DCR write outside window: {reg}");
        }
    }
}

// ============================================================================
// Region reservation
// ============================================================================

/// Exclusive `flock` on the region's lock file; released on drop.
pub struct RegionLock {
    file: File,
    path: PathBuf,
}

impl RegionLock {
    fn acquire(path: PathBuf) -> DpiResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // SAFETY: valid descriptor owned by `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(DpiError::ResourceUnavailable(format!(
                "memory region busy ({}): {err}",
                path.display()
            )));
        }
        Ok(Self { file, path })
    }
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        // SAFETY: valid descriptor owned by `self.file`.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        log::trace!("released {}", self.path.display());
    }
}

fn lock_file_name(region: &MemRegion) -> String {
    format!("dpi-{:08x}.lock", region.start)
}

// ============================================================================
// u-dma-buf memory
// ============================================================================

/// Parse a sysfs hex attribute such as `0x3e000000\n`.
fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

fn read_sysfs(name: &str, attr: &str) -> DpiResult<String> {
    let path = Path::new("/sys/class/u-dma-buf").join(name).join(attr);
    fs::read_to_string(&path).map_err(|e| {
        DpiError::ResourceUnavailable(format!("cannot read {}: {e}", path.display()))
    })
}

/// The whole u-dma-buf buffer, mapped uncached.
struct UdmaBuf {
    mmio: Mmio,
    phys: u32,
    coherent_taken: AtomicBool,
    staging_busy: AtomicBool,
}

impl UdmaBuf {
    fn open(name: &str) -> DpiResult<Self> {
        let phys = parse_hex(&read_sysfs(name, "phys_addr")?)
            .ok_or_else(|| DpiError::ResourceUnavailable(format!("{name}: bad phys_addr")))?;
        let size = read_sysfs(name, "size")?
            .trim()
            .parse::<usize>()
            .map_err(|e| DpiError::ResourceUnavailable(format!("{name}: bad size: {e}")))?;

        if size <= COHERENT_SLOT_LEN {
            return Err(DpiError::ResourceUnavailable(format!(
                "{name}: {size} bytes leave no room for payloads"
            )));
        }
        let last = phys.checked_add(size as u64 - 1);
        if !last.is_some_and(|last| last <= u64::from(u32::MAX)) {
            return Err(DpiError::ResourceUnavailable(format!(
                "{name}: not addressable by the DMA engine"
            )));
        }
        let phys = phys as u32;

        let file = open_sync(&Path::new("/dev").join(name))?;
        let mmio = Mmio::map(&file, 0, size)?;
        log::info!("{name}: {size:#x} bytes at bus address {phys:#010x}");
        Ok(Self {
            mmio,
            phys,
            coherent_taken: AtomicBool::new(false),
            staging_busy: AtomicBool::new(false),
        })
    }

    fn staging_len(&self) -> usize {
        self.mmio.len - COHERENT_SLOT_LEN
    }
}

/// Descriptor memory at the start of the u-dma-buf buffer.
pub struct UdmaCoherent {
    buf: Arc<UdmaBuf>,
    len: usize,
}

impl CoherentMemory for UdmaCoherent {
    fn device_addr(&self) -> u32 {
        self.buf.phys
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read_word(&self, index: usize) -> u32 {
        self.buf.mmio.read32(index * 4).unwrap_or(0)
    }

    fn write_word(&mut self, index: usize, value: u32) {
        if index * 4 < self.len {
            self.buf.mmio.write32(index * 4, value);
        }
    }
}

impl Drop for UdmaCoherent {
    fn drop(&mut self) {
        self.buf.coherent_taken.store(false, Ordering::Release);
    }
}

/// A payload copied into the staging area.
#[derive(Debug)]
pub struct StagedPayload {
    addr: u32,
    len: usize,
}

impl DmaMapping for StagedPayload {
    fn device_addr(&self) -> u32 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Stages payloads behind the coherent slot, one at a time.
pub struct UdmaMapper {
    buf: Arc<UdmaBuf>,
}

impl DmaMapper for UdmaMapper {
    type Mapping = StagedPayload;

    fn map_to_device(&self, payload: &[u8]) -> DpiResult<StagedPayload> {
        if payload.len() > self.buf.staging_len() {
            return Err(DpiError::MappingFailure(format!(
                "payload of {} bytes exceeds staging area of {}",
                payload.len(),
                self.buf.staging_len()
            )));
        }
        if self.buf.staging_busy.swap(true, Ordering::AcqRel) {
            return Err(DpiError::MappingFailure("staging area in use".into()));
        }
        self.buf.mmio.copy_in(COHERENT_SLOT_LEN, payload);
        Ok(StagedPayload {
            addr: self.buf.phys + COHERENT_SLOT_LEN as u32,
            len: payload.len(),
        })
    }

    fn unmap(&self, mapping: StagedPayload) {
        log::trace!("unstaged {} bytes at {:#010x}", mapping.len, mapping.addr);
        self.buf.staging_busy.store(false, Ordering::Release);
    }
}

// ============================================================================
// UIO interrupts
// ============================================================================

struct IrqThread {
    line: IrqLine,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

fn irq_loop(file: File, stop: Arc<AtomicBool>, handler: IrqHandler) {
    let unmask = 1u32.to_ne_bytes();
    while !stop.load(Ordering::Acquire) {
        if let Err(e) = (&file).write_all(&unmask) {
            log::error!("cannot unmask UIO interrupt: {e}");
            return;
        }

        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, IRQ_POLL_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("poll on UIO device failed: {err}");
            return;
        }
        if ready == 0 {
            continue;
        }

        let mut count = [0u8; 4];
        if let Err(e) = (&file).read_exact(&mut count) {
            log::error!("read from UIO device failed: {e}");
            return;
        }
        if handler() == IrqReturn::None {
            log::trace!("UIO event {} not handled", u32::from_ne_bytes(count));
        }
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Board resources reached from Linux userspace.
pub struct LinuxPlatform {
    config: LinuxConfig,
    buf: Arc<UdmaBuf>,
    irq: Mutex<Option<IrqThread>>,
}

impl LinuxPlatform {
    /// Open the u-dma-buf buffer named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is missing, too small, or not
    /// addressable by the 32-bit DMA engine.
    pub fn open(config: LinuxConfig) -> DpiResult<Self> {
        let buf = Arc::new(UdmaBuf::open(&config.udmabuf)?);
        Ok(Self {
            config,
            buf,
            irq: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LinuxConfig {
        &self.config
    }
}

impl Platform for LinuxPlatform {
    type Region = RegionLock;
    type Regs = LinuxRegisters;
    type Channel = LinuxChannel;
    type Mapper = UdmaMapper;
    type Coherent = UdmaCoherent;

    fn reserve_region(&self, region: &MemRegion) -> DpiResult<RegionLock> {
        RegionLock::acquire(self.config.lock_dir.join(lock_file_name(region)))
    }

    fn map_region(&self, region: &MemRegion) -> DpiResult<LinuxRegisters> {
        let file = open_sync(&self.config.mem_device)?;
        let len = usize::try_from(region.len()).map_err(|_| {
            DpiError::ResourceUnavailable(format!("region of {:#x} bytes", region.len()))
        })?;
        let mmio = Mmio::map(&file, region.start, len)?;
        Ok(LinuxRegisters { mmio })
    }

    fn open_channel(&self, dcr: &DcrResource) -> DpiResult<LinuxChannel> {
        if dcr.len <= DcrReg::DmaControl.index() {
            return Err(DpiError::ResourceUnavailable(format!(
                "DCR window of {} registers does not reach {}",
                dcr.len,
                DcrReg::DmaControl
            )));
        }
        let file = open_sync(&self.config.mem_device)?;
        let base = self.config.dcr_mmio_base + u64::from(dcr.start) * 4;
        let mmio = Mmio::map(&file, base, dcr.len as usize * 4)?;
        Ok(LinuxChannel { mmio })
    }

    fn request_irq(&self, line: IrqLine, handler: IrqHandler) -> DpiResult<()> {
        let mut slot = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = slot.as_ref() {
            return Err(DpiError::ResourceUnavailable(format!(
                "{} already bound",
                thread.line
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.uio_device)
            .map_err(|e| {
                DpiError::ResourceUnavailable(format!(
                    "cannot open {}: {e}",
                    self.config.uio_device.display()
                ))
            })?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("dpi-{line}").replace(' ', ""))
            .spawn(move || irq_loop(file, thread_stop, handler))?;

        *slot = Some(IrqThread { line, stop, handle });
        Ok(())
    }

    fn free_irq(&self, line: IrqLine) {
        let thread = {
            let mut slot = self.irq.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(t) if t.line == line => slot.take(),
                _ => None,
            }
        };
        if let Some(thread) = thread {
            thread.stop.store(true, Ordering::Release);
            if thread.handle.join().is_err() {
                log::error!("interrupt thread for {line} panicked");
            }
        }
    }

    fn dma_mapper(&self) -> DpiResult<UdmaMapper> {
        Ok(UdmaMapper {
            buf: Arc::clone(&self.buf),
        })
    }

    fn alloc_coherent(&self, len: usize) -> DpiResult<UdmaCoherent> {
        if len > COHERENT_SLOT_LEN {
            return Err(DpiError::ResourceUnavailable(format!(
                "coherent request of {len} bytes exceeds slot of {COHERENT_SLOT_LEN}"
            )));
        }
        if self.buf.coherent_taken.swap(true, Ordering::AcqRel) {
            return Err(DpiError::ResourceUnavailable("coherent slot in use".into()));
        }
        for index in 0..len.div_ceil(4) {
            self.buf.mmio.write32(index * 4, 0);
        }
        Ok(UdmaCoherent {
            buf: Arc::clone(&self.buf),
            len,
        })
    }
}

impl Drop for LinuxPlatform {
    fn drop(&mut self) {
        let line = self
            .irq
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.line);
        if let Some(line) = line {
            self.free_irq(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x3e000000\n"), Some(0x3e00_0000));
        assert_eq!(parse_hex("0X10"), Some(0x10));
        assert_eq!(parse_hex("ff"), Some(0xff));
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn test_lock_file_name() {
        let region = MemRegion::with_len(0x8000_0000, 0x1_0000);
        assert_eq!(lock_file_name(&region), "dpi-80000000.lock");
    }

    #[test]
    fn test_region_lock_is_exclusive() {
        let path = std::env::temp_dir().join(format!("dpi-test-{}.lock", std::process::id()));
        let first = RegionLock::acquire(path.clone()).unwrap();
        assert!(matches!(
            RegionLock::acquire(path.clone()),
            Err(DpiError::ResourceUnavailable(_))
        ));
        drop(first);
        let again = RegionLock::acquire(path.clone()).unwrap();
        drop(again);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_default_config() {
        let config = LinuxConfig::default();
        assert_eq!(config.mem_device, Path::new("/dev/mem"));
        assert_eq!(config.udmabuf, "udmabuf0");
    }
}
