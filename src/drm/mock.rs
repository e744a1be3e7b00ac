use crate::drm::ioctl::{GemExecObject2, VmBindArgs};
use crate::drm::{DrmInterface, ExecBufferParams};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub next_handle: u32,
    pub next_fd: RawFd,
    pub closed: Vec<u32>,
    pub binds: Vec<VmBindArgs>,
    pub unbinds: Vec<VmBindArgs>,
    pub execs: Vec<Vec<GemExecObject2>>,
    pub exec_results: VecDeque<i32>,
    pub tiling_calls: u32,
    pub waits: u32,
    pub prime_fds: HashMap<RawFd, u32>,
    pub closed_fds: Vec<RawFd>,
    pub fail_bind_errno: Option<i32>,
    pub fail_unbind_errno: Option<i32>,
    pub fail_export_errno: Option<i32>,
    pub fail_close_errno: Option<i32>,
}

/// Records every kernel request and answers from scripted results.
#[derive(Debug)]
pub(crate) struct MockDrm {
    pub state: Mutex<MockState>,
    pub vm_bind: bool,
}

impl MockDrm {
    pub fn new(vm_bind: bool) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                next_fd: 100,
                ..Default::default()
            }),
            vm_bind,
        }
    }

    pub fn bind_count(&self) -> usize {
        self.state.lock().binds.len()
    }

    pub fn unbind_count(&self) -> usize {
        self.state.lock().unbinds.len()
    }

    pub fn closed_handles(&self) -> Vec<u32> {
        self.state.lock().closed.clone()
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl DrmInterface for MockDrm {
    fn gem_create(&self, _size: u64) -> io::Result<u32> {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }

    fn gem_userptr(&self, address: u64, size: u64) -> io::Result<u32> {
        if address == 0 {
            return Err(errno(libc::EFAULT));
        }
        self.gem_create(size)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_close_errno {
            return Err(errno(code));
        }
        state.closed.push(handle);
        Ok(())
    }

    fn gem_set_tiling(&self, _handle: u32, _tiling_mode: u32, _stride: u32) -> io::Result<()> {
        self.state.lock().tiling_calls += 1;
        Ok(())
    }

    fn gem_wait(&self, _handle: u32, _timeout_ns: i64) -> io::Result<()> {
        self.state.lock().waits += 1;
        Ok(())
    }

    fn exec(&self, objects: &mut [GemExecObject2], _params: &ExecBufferParams) -> io::Result<()> {
        let mut state = self.state.lock();
        state.execs.push(objects.to_vec());
        match state.exec_results.pop_front() {
            Some(0) | None => Ok(()),
            Some(code) => Err(errno(code)),
        }
    }

    fn vm_bind(&self, args: &VmBindArgs) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_bind_errno {
            return Err(errno(code));
        }
        state.binds.push(*args);
        Ok(())
    }

    fn vm_unbind(&self, args: &VmBindArgs) -> io::Result<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_unbind_errno {
            return Err(errno(code));
        }
        state.unbinds.push(*args);
        Ok(())
    }

    fn handle_to_prime_fd(&self, handle: u32) -> io::Result<RawFd> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_export_errno {
            return Err(errno(code));
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.prime_fds.insert(fd, handle);
        Ok(fd)
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        self.state
            .lock()
            .prime_fds
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
