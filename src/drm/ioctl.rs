#![allow(clippy::cast_possible_truncation)]

use std::mem;

// ===============================================================================================
// Request Encoding
// ===============================================================================================

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'
pub const DRM_COMMAND_BASE: u32 = 0x40;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (DRM_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

const fn drm_iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, mem::size_of::<T>())
}

const fn drm_iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, mem::size_of::<T>())
}

// ===============================================================================================
// Core GEM
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

// ===============================================================================================
// Object Creation
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreate {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptr {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

// ===============================================================================================
// Tiling & Synchronization
// ===============================================================================================

pub const I915_TILING_NONE: u32 = 0;
pub const I915_TILING_X: u32 = 1;
pub const I915_TILING_Y: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetTiling {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWait {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetParam {
    pub param: i32,
    pub value: u64, // pointer to i32
}

pub const I915_PARAM_VM_BIND_VERSION: i32 = 57;

// ===============================================================================================
// Submission
// ===============================================================================================

pub const EXEC_OBJECT_SUPPORTS_48B_ADDRESS: u64 = 1 << 3;
pub const EXEC_OBJECT_PINNED: u64 = 1 << 4;
pub const EXEC_OBJECT_ASYNC: u64 = 1 << 6;
pub const EXEC_OBJECT_CAPTURE: u64 = 1 << 7;

pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GemExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemExecbuffer2 {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    pub rsvd1: u64, // context id
    pub rsvd2: u64,
}

const _: () = assert!(mem::size_of::<GemExecObject2>() == 56);
const _: () = assert!(mem::size_of::<GemExecbuffer2>() == 64);

// ===============================================================================================
// Virtual Memory Binding
// ===============================================================================================

pub const I915_GEM_VM_BIND_IMMEDIATE: u64 = 1 << 0;
pub const I915_GEM_VM_BIND_CAPTURE: u64 = 1 << 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VmBindArgs {
    pub vm_id: u32,
    pub handle: u32,
    pub start: u64,
    pub offset: u64,
    pub length: u64,
    pub flags: u64,
    pub pat_index: u16,
    pub pad: [u16; 3],
    pub extensions: u64,
}

// ===============================================================================================
// IOCTL Numbers
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemClose>(0x09);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr::<PrimeHandle>(0x2d);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = drm_iowr::<PrimeHandle>(0x2e);

pub const DRM_IOCTL_I915_GETPARAM: u32 = drm_iowr::<GetParam>(DRM_COMMAND_BASE + 0x06);
pub const DRM_IOCTL_I915_GEM_CREATE: u32 = drm_iowr::<GemCreate>(DRM_COMMAND_BASE + 0x1b);
pub const DRM_IOCTL_I915_GEM_SET_TILING: u32 = drm_iowr::<GemSetTiling>(DRM_COMMAND_BASE + 0x21);
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2_WR: u32 =
    drm_iowr::<GemExecbuffer2>(DRM_COMMAND_BASE + 0x29);
pub const DRM_IOCTL_I915_GEM_WAIT: u32 = drm_iowr::<GemWait>(DRM_COMMAND_BASE + 0x2c);
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 = drm_iowr::<GemUserptr>(DRM_COMMAND_BASE + 0x33);
pub const DRM_IOCTL_I915_GEM_VM_BIND: u32 = drm_iowr::<VmBindArgs>(DRM_COMMAND_BASE + 0x3d);
pub const DRM_IOCTL_I915_GEM_VM_UNBIND: u32 = drm_iowr::<VmBindArgs>(DRM_COMMAND_BASE + 0x3e);
