use crate::drm::ioctl::{
    DRM_CLOEXEC, DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_I915_GEM_EXECBUFFER2_WR, DRM_IOCTL_I915_GEM_SET_TILING, DRM_IOCTL_I915_GEM_USERPTR,
    DRM_IOCTL_I915_GEM_VM_BIND, DRM_IOCTL_I915_GEM_VM_UNBIND, DRM_IOCTL_I915_GEM_WAIT,
    DRM_IOCTL_I915_GETPARAM, DRM_IOCTL_PRIME_FD_TO_HANDLE, DRM_IOCTL_PRIME_HANDLE_TO_FD,
    DRM_RDWR, GemClose, GemCreate, GemExecObject2, GemExecbuffer2, GemSetTiling, GemUserptr,
    GemWait, GetParam, I915_EXEC_NO_RELOC, I915_PARAM_VM_BIND_VERSION, PrimeHandle, VmBindArgs,
};
use crate::drm::{DrmInterface, ExecBufferParams};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// A handle to a DRM render node.
///
/// The file descriptor is wrapped in an `Arc`, so the device is cheap to clone
/// into every buffer object that must outlive the code that opened it.
#[derive(Clone, Debug)]
pub struct DrmDevice {
    pub file: Arc<File>,
    vm_bind_version: i32,
}

impl DrmDevice {
    /// Opens the default render node.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened (driver not loaded, permissions).
    pub fn open() -> io::Result<Self> {
        Self::open_path(DEFAULT_RENDER_NODE)
    }

    /// Opens a specific render node and probes for VM bind support.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened.
    pub fn open_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut device = Self {
            file: Arc::new(file),
            vm_bind_version: 0,
        };
        device.vm_bind_version = device.get_param(I915_PARAM_VM_BIND_VERSION).unwrap_or(0);
        debug!(
            path = %path.as_ref().display(),
            vm_bind_version = device.vm_bind_version,
            "opened DRM render node"
        );

        Ok(device)
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) {
                return Err(err);
            }
        }
    }

    /// Query a driver parameter.
    pub fn get_param(&self, param: i32) -> io::Result<i32> {
        let mut value: i32 = 0;
        let mut args = GetParam {
            param,
            value: &raw mut value as u64,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GETPARAM, &mut args)?;
        }
        Ok(value)
    }
}

impl DrmInterface for DrmDevice {
    fn gem_create(&self, size: u64) -> io::Result<u32> {
        let mut args = GemCreate {
            size,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CREATE, &mut args)?;
        }
        Ok(args.handle)
    }

    fn gem_userptr(&self, address: u64, size: u64) -> io::Result<u32> {
        let mut args = GemUserptr {
            user_ptr: address,
            user_size: size,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, &mut args)?;
        }
        Ok(args.handle)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut args = GemClose { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    fn gem_set_tiling(&self, handle: u32, tiling_mode: u32, stride: u32) -> io::Result<()> {
        let mut args = GemSetTiling {
            handle,
            tiling_mode,
            stride,
            swizzle_mode: 0,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_SET_TILING, &mut args) }
    }

    fn gem_wait(&self, handle: u32, timeout_ns: i64) -> io::Result<()> {
        let mut args = GemWait {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, &mut args) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn exec(&self, objects: &mut [GemExecObject2], params: &ExecBufferParams) -> io::Result<()> {
        let mut args = GemExecbuffer2 {
            buffers_ptr: objects.as_mut_ptr() as u64,
            buffer_count: objects.len() as u32,
            batch_start_offset: params.batch_start_offset,
            batch_len: params.batch_len,
            // Every object is softpinned; there are no relocations.
            flags: params.flags | I915_EXEC_NO_RELOC,
            rsvd1: u64::from(params.drm_context_id),
            ..Default::default()
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_EXECBUFFER2_WR, &mut args) }
    }

    fn vm_bind(&self, args: &VmBindArgs) -> io::Result<()> {
        let mut args = *args;
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_VM_BIND, &mut args) }
    }

    fn vm_unbind(&self, args: &VmBindArgs) -> io::Result<()> {
        let mut args = *args;
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_VM_UNBIND, &mut args) }
    }

    fn handle_to_prime_fd(&self, handle: u32) -> io::Result<RawFd> {
        let mut args = PrimeHandle {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut args)?;
        }
        Ok(args.fd)
    }

    fn prime_fd_to_handle(&self, fd: RawFd) -> io::Result<u32> {
        let mut args = PrimeHandle {
            handle: 0,
            flags: 0,
            fd,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args)?;
        }
        Ok(args.handle)
    }

    fn close_prime_fd(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn is_vm_bind_available(&self) -> bool {
        self.vm_bind_version > 0
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
