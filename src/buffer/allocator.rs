//! Backing storage for pool buffers
//!
//! A pool buffer is made of planes, each one a driver-allocated region that can
//! be shared with another process through a duplicable file descriptor.
//!
//! Two allocators are provided:
//! - [`DumbBufferAllocator`]: DRM dumb buffers exported as PRIME descriptors
//! - [`MemfdAllocator`]: anonymous shared memory, used when no DRM node is
//!   available
//!
//! Plane contents are written through a [`PlaneMapping`], which unmaps itself
//! on drop.

use crate::assets::LUMA_WIDTH_ALIGN;
use crate::error::{Result, SinkError};
use nix::libc;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// One plane of a pool buffer.
#[derive(Debug)]
pub struct Plane {
    /// Shareable handle (PRIME descriptor or memfd).
    pub fd: OwnedFd,
    /// Driver-local handle, 0 when the allocator has none.
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
    /// Map offset on the allocator's device.
    pub offset: u64,
}

impl Plane {
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Source of plane storage for the buffer pool.
pub trait PlaneAllocator: Send {
    fn name(&self) -> &'static str;

    /// Allocates one 8-bit plane of at least `width` x `height` bytes.
    fn alloc_plane(&mut self, width: u32, height: u32) -> Result<Plane>;

    /// Returns the plane's storage to the driver.
    fn free_plane(&mut self, plane: Plane);

    /// Maps the plane for CPU writes.
    fn map_plane(&self, plane: &Plane) -> Result<PlaneMapping>;
}

pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Opens the DRM device named in the configuration, falling back to shared
/// memory planes when the node cannot be opened.
pub fn open_allocator(device: &Path) -> Box<dyn PlaneAllocator> {
    match DumbBufferAllocator::open(device) {
        Ok(drm) => {
            log::debug!("using drm node {:?}", device);
            Box::new(drm)
        }
        Err(e) => {
            log::error!("Failed to open drm node ({:?}): {}", device, e);
            log::info!("falling back to shared memory planes");
            Box::new(MemfdAllocator::new())
        }
    }
}

/// Writable CPU mapping of a plane.
pub struct PlaneMapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl PlaneMapping {
    fn map(fd: BorrowedFd<'_>, len: u64, offset: u64) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| SinkError::Errno(nix::errno::Errno::EOVERFLOW))?;
        let length = NonZeroUsize::new(len).ok_or(SinkError::Errno(nix::errno::Errno::EINVAL))?;

        // SAFETY: the mapping is fresh, owned by the returned value and
        // unmapped exactly once in Drop.
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )?
        };

        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live read-write mapping we own.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: as above, shared borrow.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { mman::munmap(self.ptr, self.len) } {
            log::error!("munmap failed: {}", e);
        }
    }
}

// ── DRM dumb buffers ────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeCreateDumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeMapDumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmModeDestroyDumb {
    handle: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct DrmPrimeHandle {
    handle: u32,
    flags: u32,
    fd: i32,
}

nix::ioctl_readwrite!(drm_mode_create_dumb, b'd', 0xB2, DrmModeCreateDumb);
nix::ioctl_readwrite!(drm_mode_map_dumb, b'd', 0xB3, DrmModeMapDumb);
nix::ioctl_readwrite!(drm_mode_destroy_dumb, b'd', 0xB4, DrmModeDestroyDumb);
nix::ioctl_readwrite!(drm_prime_handle_to_fd, b'd', 0x2d, DrmPrimeHandle);

/// Allocates planes as DRM dumb buffers and exports them as PRIME descriptors.
pub struct DumbBufferAllocator {
    device: File,
    path: PathBuf,
}

impl DumbBufferAllocator {
    pub fn open(path: &Path) -> Result<Self> {
        let device = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            device,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn destroy_handle(&self, handle: u32) {
        let mut destroy = DrmModeDestroyDumb { handle };
        // SAFETY: valid fd and a properly sized, initialized argument struct.
        if let Err(e) = unsafe { drm_mode_destroy_dumb(self.device.as_raw_fd(), &mut destroy) } {
            log::error!("DRM_IOCTL_MODE_DESTROY_DUMB failed: {}", e);
        }
    }

    fn create(&self, width: u32, height: u32) -> Result<Plane> {
        let mut create = DrmModeCreateDumb {
            width: align_up(width, LUMA_WIDTH_ALIGN),
            height,
            bpp: 8,
            ..Default::default()
        };
        // SAFETY: valid fd and a properly sized, initialized argument struct.
        unsafe { drm_mode_create_dumb(self.device.as_raw_fd(), &mut create) }.map_err(|e| {
            SinkError::Allocation {
                width,
                height,
                reason: format!("DRM_IOCTL_MODE_CREATE_DUMB failed: {e}"),
            }
        })?;

        let mut map = DrmModeMapDumb {
            handle: create.handle,
            ..Default::default()
        };
        // SAFETY: as above.
        if let Err(e) = unsafe { drm_mode_map_dumb(self.device.as_raw_fd(), &mut map) } {
            self.destroy_handle(create.handle);
            return Err(SinkError::Allocation {
                width,
                height,
                reason: format!("DRM_IOCTL_MODE_MAP_DUMB failed: {e}"),
            });
        }

        let mut prime = DrmPrimeHandle {
            handle: create.handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        // SAFETY: as above.
        if let Err(e) = unsafe { drm_prime_handle_to_fd(self.device.as_raw_fd(), &mut prime) } {
            self.destroy_handle(create.handle);
            return Err(SinkError::Allocation {
                width,
                height,
                reason: format!("drm prime handle to fd failed: {e}"),
            });
        }

        Ok(Plane {
            // SAFETY: the kernel just handed us this descriptor; nothing else owns it.
            fd: unsafe { OwnedFd::from_raw_fd(prime.fd) },
            handle: create.handle,
            pitch: create.pitch,
            size: create.size,
            offset: map.offset,
        })
    }
}

impl PlaneAllocator for DumbBufferAllocator {
    fn name(&self) -> &'static str {
        "drm-dumb"
    }

    fn alloc_plane(&mut self, width: u32, height: u32) -> Result<Plane> {
        self.create(width, height)
    }

    fn free_plane(&mut self, plane: Plane) {
        let handle = plane.handle;
        drop(plane.fd);
        if handle != 0 {
            self.destroy_handle(handle);
        }
    }

    fn map_plane(&self, plane: &Plane) -> Result<PlaneMapping> {
        PlaneMapping::map(self.device.as_fd(), plane.size, plane.offset)
    }
}

// ── Shared memory ───────────────────────────────────────────────────────────

/// Allocates planes as sealed-size memfd regions.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    allocated: usize,
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Self { allocated: 0 }
    }

    /// Number of planes currently alive.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl PlaneAllocator for MemfdAllocator {
    fn name(&self) -> &'static str {
        "memfd"
    }

    fn alloc_plane(&mut self, width: u32, height: u32) -> Result<Plane> {
        let pitch = align_up(width, LUMA_WIDTH_ALIGN);
        let size = u64::from(pitch) * u64::from(height);
        if size == 0 {
            return Err(SinkError::Allocation {
                width,
                height,
                reason: "empty plane".to_string(),
            });
        }

        let fd = nix::sys::memfd::memfd_create(
            c"plane-sink",
            nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC,
        )?;
        nix::unistd::ftruncate(&fd, size as libc::off_t)?;

        self.allocated += 1;
        Ok(Plane {
            fd,
            handle: 0,
            pitch,
            size,
            offset: 0,
        })
    }

    fn free_plane(&mut self, plane: Plane) {
        self.allocated = self.allocated.saturating_sub(1);
        drop(plane);
    }

    fn map_plane(&self, plane: &Plane) -> Result<PlaneMapping> {
        PlaneMapping::map(plane.fd.as_fd(), plane.size, plane.offset)
    }
}
