//! Shared fixtures for integration tests.
//!
//! `RecordingDrm` stands in for a render node: it hands out sequential GEM
//! handles and PRIME descriptors, records every bind, unbind and submission,
//! and replays scripted errors.

#![allow(dead_code)]

use drm_residency::drm::ioctl::{GemExecObject2, VmBindArgs};
use drm_residency::{
    AllocationProperties, AllocationType, DeviceBitfield, DrmInterface, DrmMemoryManager,
    ExecBufferParams, OsContext, ResidencyConfig, TaskCountEngine, VmBindMode,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Recorded {
    pub next_handle: u32,
    pub next_fd: RawFd,
    pub closed_handles: Vec<u32>,
    pub closed_fds: Vec<RawFd>,
    pub binds: Vec<VmBindArgs>,
    pub unbinds: Vec<VmBindArgs>,
    pub execs: usize,
    pub prime: HashMap<RawFd, u32>,
    /// Errno per upcoming exec; `0` succeeds. Exhausted means success.
    pub exec_script: VecDeque<i32>,
    /// Errno for the n-th upcoming export (0-based); others succeed.
    pub fail_export_at: Option<(usize, i32)>,
    pub exports: usize,
    pub fail_bind: Option<i32>,
}

#[derive(Debug)]
pub struct RecordingDrm {
    pub vm_bind: bool,
    pub state: Mutex<Recorded>,
}

impl RecordingDrm {
    pub fn new(vm_bind: bool) -> Arc<Self> {
        Arc::new(Self {
            vm_bind,
            state: Mutex::new(Recorded {
                next_handle: 1,
                next_fd: 200,
                ..Default::default()
            }),
        })
    }

    pub fn binds(&self) -> usize {
        self.state.lock().binds.len()
    }

    pub fn unbinds(&self) -> usize {
        self.state.lock().unbinds.len()
    }

    pub fn closed_handles(&self) -> Vec<u32> {
        self.state.lock().closed_handles.clone()
    }

    pub fn script_exec(&self, results: &[i32]) {
        self.state.lock().exec_script.extend(results);
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl DrmInterface for RecordingDrm {
    fn gem_create(&self, _size: u64) -> io::Result<u32> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }

    fn gem_userptr(&self, _address: u64, size: u64) -> io::Result<u32> {
        self.gem_create(size)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        self.state.lock().closed_handles.push(handle);
        Ok(())
    }

    fn gem_set_tiling(&self, _handle: u32, _tiling_mode: u32, _stride: u32) -> io::Result<()> {
        Ok(())
    }

    fn gem_wait(&self, _handle: u32, _timeout_ns: i64) -> io::Result<()> {
        Ok(())
    }

    fn exec(&self, _objects: &mut [GemExecObject2], _params: &ExecBufferParams) -> io::Result<()> {
        let mut state = self.state.lock();
        state.execs += 1;
        match state.exec_script.pop_front() {
            Some(0) | None => Ok(()),
            Some(code) => Err(errno(code)),
        }
    }

    fn vm_bind(&self, args: &VmBindArgs) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_bind {
            return Err(errno(code));
        }
        state.binds.push(*args);
        Ok(())
    }

    fn vm_unbind(&self, args: &VmBindArgs) -> io::Result<()> {
        self.state.lock().unbinds.push(*args);
        Ok(())
    }

    fn handle_to_prime_fd(&self, handle: u32) -> io::Result<RawFd> {
        let mut state = self.state.lock();
        let attempt = state.exports;
        state.exports += 1;
        if let Some((at, code)) = state.fail_export_at {
            if at == attempt {
                return Err(errno(code));
            }
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.prime.insert(fd, handle);
        Ok(fd)
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        self.state
            .lock()
            .prime
            .get(&fd)
            .copied()
            .ok_or_else(|| errno(libc::EBADF))
    }

    fn close_prime_fd(&self, fd: RawFd) -> io::Result<()> {
        self.state.lock().closed_fds.push(fd);
        Ok(())
    }

    fn is_vm_bind_available(&self) -> bool {
        self.vm_bind
    }
}

/// A manager over a fresh `RecordingDrm`, explicit-bind if `vm_bind`.
pub fn manager(vm_bind: bool, sub_devices: u32) -> (Arc<RecordingDrm>, Arc<DrmMemoryManager>) {
    let drm = RecordingDrm::new(vm_bind);
    let mode = if vm_bind { VmBindMode::Enabled } else { VmBindMode::Disabled };
    let config = ResidencyConfig::new()
        .with_vm_bind(mode)
        .with_sub_device_count(sub_devices);
    let manager = Arc::new(DrmMemoryManager::new(drm.clone(), config));
    (drm, manager)
}

/// Register a context spanning `tiles` and return it with its engine.
pub fn context(
    manager: &DrmMemoryManager,
    id: u32,
    tiles: DeviceBitfield,
) -> (Arc<OsContext>, Arc<TaskCountEngine>) {
    let engine = Arc::new(TaskCountEngine::new());
    let ctx = Arc::new(OsContext::new(id, tiles, engine.clone()).expect("valid context"));
    manager.register_engine(ctx.clone()).expect("register engine");
    (ctx, engine)
}

pub fn buffer(tiles: DeviceBitfield) -> AllocationProperties {
    AllocationProperties::new(0, 0x1000, AllocationType::Buffer).tile_mask(tiles)
}
