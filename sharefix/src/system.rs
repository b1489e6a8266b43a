//! OS bindings: anonymous mappings, the perf syscall and the capability gate.

use std::{
    fs, io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    ptr::{self, NonNull},
};

use bitflags::bitflags;
use log::warn;

use crate::{Error, Result};

pub const OS_PAGE_SIZE: usize = 4096;

#[inline]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { OS_PAGE_SIZE } else { size as usize }
}

// ── Anonymous memory ──────────────────────────────────────────────────

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no aliasing with existing memory
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from a mapping of `size` bytes
    let _ = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
}

// ── perf_event_open ───────────────────────────────────────────────────

pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

/// Offsets into `perf_event_mmap_page`.
pub const DATA_HEAD_OFFSET: usize = 1024;
pub const DATA_TAIL_OFFSET: usize = 1032;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u64 {
        const DISABLED = 1 << 0;
        const EXCLUDE_KERNEL = 1 << 5;
        const EXCLUDE_HV = 1 << 6;
        /// Two-bit `precise_ip` field set to 2: zero skid requested.
        const PRECISE_IP_2 = 2 << 15;
    }
}

/// `struct perf_event_attr`, ABI version 5.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved: u16,
}

const _: () = assert!(size_of::<PerfEventAttr>() == 112);

impl PerfEventAttr {
    /// Raw event sampled every `period` occurrences in user space only.
    pub fn raw_sampling(event: u64, period: u64, timed: bool) -> Self {
        let mut sample_type = PERF_SAMPLE_ADDR;
        if timed {
            sample_type |= PERF_SAMPLE_TIME;
        }
        Self {
            type_: PERF_TYPE_RAW,
            size: size_of::<Self>() as u32,
            config: event,
            sample_period: period,
            sample_type,
            flags: (AttrFlags::DISABLED | AttrFlags::EXCLUDE_KERNEL | AttrFlags::PRECISE_IP_2)
                .bits(),
            ..Self::default()
        }
    }
}

/// Opens a counter for the calling thread on any CPU.
pub fn perf_event_open(attr: &PerfEventAttr) -> io::Result<OwnedFd> {
    // SAFETY: attr is a valid, fully initialized perf_event_attr
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            0 as libc::pid_t,
            -1 as libc::c_int,
            -1 as libc::c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

pub fn map_shared(fd: RawFd, size: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: shared mapping of a perf descriptor, size is page aligned
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned null"))
}

pub fn perf_enable(fd: RawFd, enable: bool) -> io::Result<()> {
    let request = if enable {
        PERF_EVENT_IOC_ENABLE
    } else {
        PERF_EVENT_IOC_DISABLE
    };
    // SAFETY: fd is a perf event descriptor, the request takes no argument
    let rc = unsafe { libc::ioctl(fd, request as _, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── Capability gate ───────────────────────────────────────────────────

const VENDOR_INTEL: &str = "GenuineIntel";
const FAMILY_CORE: u32 = 6;

/// Remote HITM on Haswell-EP: load-latency HITM and offcore HITM events.
const HASWELL_EVENTS: &[u64] = &[0x4D2, 0x10D3];
const HASWELL_TESTED: &[u32] = &[0x3F];
const HASWELL_UNTESTED: &[u32] = &[0x3E, 0x45, 0x46];
const LATER_EVENTS: &[u64] = &[0x10D3];
const LATER_UNTESTED: &[u32] = &[0x3D, 0x4E, 0x5E, 0x47, 0x56];

const MIN_KERNEL: (u32, u32) = (4, 1);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
}

impl CpuInfo {
    /// Reads the first processor block of `/proc/cpuinfo` text.
    pub fn parse(text: &str) -> Option<Self> {
        let mut info = CpuInfo::default();
        let (mut vendor, mut family, mut model) = (false, false, false);
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                if vendor && family && model {
                    break;
                }
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "vendor_id" if !vendor => {
                    info.vendor = value.to_owned();
                    vendor = true;
                }
                "cpu family" if !family => {
                    info.family = value.parse().ok()?;
                    family = true;
                }
                "model" if !model => {
                    info.model = value.parse().ok()?;
                    model = true;
                }
                _ => {}
            }
        }
        (vendor && family && model).then_some(info)
    }

    /// Raw event codes that report remote HITM on this CPU.
    pub fn hitm_events(&self) -> Result<&'static [u64]> {
        if self.vendor != VENDOR_INTEL || self.family != FAMILY_CORE {
            return Err(Error::UnsupportedPlatform(format!(
                "{} family {}",
                self.vendor, self.family
            )));
        }
        if HASWELL_TESTED.contains(&self.model) {
            return Ok(HASWELL_EVENTS);
        }
        if HASWELL_UNTESTED.contains(&self.model) {
            warn!("cpu model {:#x} is untested, using Haswell events", self.model);
            return Ok(HASWELL_EVENTS);
        }
        if LATER_UNTESTED.contains(&self.model) {
            warn!("cpu model {:#x} is untested, using offcore event only", self.model);
            return Ok(LATER_EVENTS);
        }
        Err(Error::UnsupportedPlatform(format!(
            "cpu model {:#x}",
            self.model
        )))
    }
}

/// Whether a kernel release string such as `4.15.0-generic` is recent enough.
pub fn kernel_supported(release: &str) -> bool {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor) >= MIN_KERNEL
}

/// Checks CPU and kernel and returns the events to sample.
pub fn detect_hitm_events() -> Result<&'static [u64]> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo")?;
    let cpu = CpuInfo::parse(&cpuinfo)
        .ok_or_else(|| Error::UnsupportedPlatform("unreadable /proc/cpuinfo".into()))?;
    let events = cpu.hitm_events()?;

    let release = fs::read_to_string("/proc/sys/kernel/osrelease")?;
    if !kernel_supported(release.trim()) {
        return Err(Error::UnsupportedPlatform(format!(
            "kernel {} is older than {}.{}",
            release.trim(),
            MIN_KERNEL.0,
            MIN_KERNEL.1
        )));
    }
    Ok(events)
}
