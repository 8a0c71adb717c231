use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use super::framebuffer::{frame_layout, FrameBuffer, BITS_PER_PIXEL};
use super::mapping::{page_align, Mapping};
use crate::error::{Error, Result};

/// Allocator of 32-bit pixel buffers whose memory can be handed to another process
pub trait BufferDevice {
    /// Allocate and map a buffer of the given size in pixels
    fn allocate(&mut self, width: u32, height: u32) -> Result<FrameBuffer>;

    /// Fresh process-transferable handle to the buffer's memory.
    /// The caller owns it and closes it when done.
    fn export(&self, buffer: &FrameBuffer) -> Result<OwnedFd>;

    /// Unmap and free a buffer
    fn release(&mut self, buffer: FrameBuffer) -> Result<()>;

    /// Buffers allocated and not yet released
    fn live_allocations(&self) -> usize;
}

impl<D: BufferDevice + ?Sized> BufferDevice for Box<D> {
    fn allocate(&mut self, width: u32, height: u32) -> Result<FrameBuffer> {
        (**self).allocate(width, height)
    }

    fn export(&self, buffer: &FrameBuffer) -> Result<OwnedFd> {
        (**self).export(buffer)
    }

    fn release(&mut self, buffer: FrameBuffer) -> Result<()> {
        (**self).release(buffer)
    }

    fn live_allocations(&self) -> usize {
        (**self).live_allocations()
    }
}

fn layout(width: u32, height: u32) -> Result<(u32, usize)> {
    frame_layout(width, height).ok_or_else(|| Error::Device {
        op: "allocate",
        source: io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}x{} buffer does not fit in memory", width, height),
        ),
    })
}

// === memfd backend ===

/// Buffers backed by anonymous memory files
///
/// Exported handles are duplicates of the memfd, so the consumer can map the
/// exact pages the producer rendered into.
#[derive(Debug, Default)]
pub struct MemfdDevice {
    next_handle: u32,
    buffers: HashMap<u32, OwnedFd>,
}

impl MemfdDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferDevice for MemfdDevice {
    fn allocate(&mut self, width: u32, height: u32) -> Result<FrameBuffer> {
        let (stride, visible) = layout(width, height)?;
        let size = page_align(visible);

        let name = CString::new("frame-buffer").map_err(|e| Error::Device {
            op: "memfd_create",
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        // SAFETY: name is a valid C string
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::device("memfd_create"));
        }
        // SAFETY: raw is a freshly created descriptor we own
        let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });

        file.set_len(size as u64).map_err(|source| Error::Device {
            op: "ftruncate",
            source,
        })?;

        let map = Mapping::shared(file.as_fd(), size, 0)
            .map_err(|source| Error::Device { op: "mmap", source })?;

        self.next_handle += 1;
        let handle = self.next_handle;
        self.buffers.insert(handle, OwnedFd::from(file));

        Ok(FrameBuffer {
            width,
            height,
            stride,
            size,
            handle,
            map,
        })
    }

    fn export(&self, buffer: &FrameBuffer) -> Result<OwnedFd> {
        let export_err = |source| Error::Export {
            handle: buffer.handle,
            source,
        };

        let fd = self.buffers.get(&buffer.handle).ok_or_else(|| {
            export_err(io::Error::new(io::ErrorKind::NotFound, "unknown buffer handle"))
        })?;

        fd.try_clone().map_err(export_err)
    }

    fn release(&mut self, buffer: FrameBuffer) -> Result<()> {
        let handle = buffer.handle;
        drop(buffer.into_map());

        self.buffers.remove(&handle).map(drop).ok_or_else(|| Error::Device {
            op: "release",
            source: io::Error::new(io::ErrorKind::NotFound, "unknown buffer handle"),
        })
    }

    fn live_allocations(&self) -> usize {
        self.buffers.len()
    }
}

// === DRM dumb buffer backend ===

const DRM_IOCTL_BASE: u32 = b'd' as u32;

const fn drm_iowr(nr: u32, size: usize) -> u32 {
    // _IOC(_IOC_READ | _IOC_WRITE, 'd', nr, size)
    (3 << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const fn drm_io(nr: u32) -> u32 {
    (DRM_IOCTL_BASE << 8) | nr
}

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

const DRM_IOCTL_DROP_MASTER: u32 = drm_io(0x1f);
const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr(0x2d, std::mem::size_of::<DrmPrimeHandle>());
const DRM_IOCTL_MODE_CREATE_DUMB: u32 = drm_iowr(0xb2, std::mem::size_of::<DrmModeCreateDumb>());
const DRM_IOCTL_MODE_MAP_DUMB: u32 = drm_iowr(0xb3, std::mem::size_of::<DrmModeMapDumb>());
const DRM_IOCTL_MODE_DESTROY_DUMB: u32 = drm_iowr(0xb4, std::mem::size_of::<DrmModeDestroyDumb>());

/// Dumb buffers on a DRM card node, exported as PRIME fds
#[derive(Debug)]
pub struct DrmDevice {
    card: File,
    live: usize,
}

impl DrmDevice {
    /// Open a card node and give up DRM master so a display server can keep it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let card = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path.as_ref())
            .map_err(|source| Error::Device { op: "open card", source })?;

        let device = Self { card, live: 0 };

        // Not being master in the first place is fine
        // SAFETY: DROP_MASTER takes no argument
        if unsafe { libc::ioctl(device.card.as_raw_fd(), DRM_IOCTL_DROP_MASTER as _, 0) } != 0 {
            log::warn!("drop master: {}", io::Error::last_os_error());
        }

        log::info!("opened DRM device {}", path.as_ref().display());
        Ok(device)
    }

    fn ioctl<T>(&self, request: u32, arg: &mut T, op: &'static str) -> Result<()> {
        loop {
            // SAFETY: arg is a repr(C) struct matching the request's size
            let r = unsafe { libc::ioctl(self.card.as_raw_fd(), request as _, arg as *mut T) };
            if r == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            // EINTR means the ioctl did not run
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Device { op, source: err });
            }
        }
    }

    fn destroy(&self, handle: u32) -> Result<()> {
        let mut destroy = DrmModeDestroyDumb { handle };
        self.ioctl(DRM_IOCTL_MODE_DESTROY_DUMB, &mut destroy, "destroy dumb")
    }
}

impl BufferDevice for DrmDevice {
    fn allocate(&mut self, width: u32, height: u32) -> Result<FrameBuffer> {
        let (stride, _) = layout(width, height)?;
        let mut create = DrmModeCreateDumb {
            width,
            height,
            bpp: BITS_PER_PIXEL,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_MODE_CREATE_DUMB, &mut create, "create dumb")?;

        let mut map_req = DrmModeMapDumb {
            handle: create.handle,
            ..Default::default()
        };
        let mapped = self
            .ioctl(DRM_IOCTL_MODE_MAP_DUMB, &mut map_req, "map dumb")
            .and_then(|()| {
                Mapping::shared(self.card.as_fd(), create.size as usize, map_req.offset as libc::off_t)
                    .map_err(|source| Error::Device { op: "mmap", source })
            });

        let map = match mapped {
            Ok(map) => map,
            Err(e) => {
                self.destroy(create.handle)?;
                return Err(e);
            }
        };

        self.live += 1;

        Ok(FrameBuffer {
            width,
            height,
            stride,
            size: create.size as usize,
            handle: create.handle,
            map,
        })
    }

    fn export(&self, buffer: &FrameBuffer) -> Result<OwnedFd> {
        let mut prime = DrmPrimeHandle {
            handle: buffer.handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };

        self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut prime, "prime export")
            .map_err(|e| match e {
                Error::Device { source, .. } => Error::Export {
                    handle: buffer.handle,
                    source,
                },
                other => other,
            })?;

        // SAFETY: the kernel returned a new descriptor we now own
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    fn release(&mut self, buffer: FrameBuffer) -> Result<()> {
        let handle = buffer.handle;
        drop(buffer.into_map());
        self.destroy(handle)?;
        self.live -= 1;
        Ok(())
    }

    fn live_allocations(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapping::page_size;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        assert_eq!(DRM_IOCTL_DROP_MASTER, 0x641f);
        assert_eq!(DRM_IOCTL_PRIME_HANDLE_TO_FD, 0xc00c_642d);
        assert_eq!(DRM_IOCTL_MODE_CREATE_DUMB, 0xc020_64b2);
        assert_eq!(DRM_IOCTL_MODE_MAP_DUMB, 0xc010_64b3);
        assert_eq!(DRM_IOCTL_MODE_DESTROY_DUMB, 0xc004_64b4);
    }

    #[test]
    fn memfd_allocation_geometry() {
        let mut device = MemfdDevice::new();
        let fb = device.allocate(100, 10).unwrap();

        assert_eq!(fb.width(), 100);
        assert_eq!(fb.height(), 10);
        assert_eq!(fb.stride(), 400);
        assert!(fb.size() >= 100 * 10 * 4);
        assert_eq!(fb.size() % page_size(), 0);
        assert_eq!(device.live_allocations(), 1);

        device.release(fb).unwrap();
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn memfd_handles_are_distinct() {
        let mut device = MemfdDevice::new();
        let a = device.allocate(4, 4).unwrap();
        let b = device.allocate(4, 4).unwrap();
        assert_ne!(a.handle(), b.handle());
        device.release(a).unwrap();
        device.release(b).unwrap();
    }

    #[test]
    fn memfd_export_shares_pages() {
        let mut device = MemfdDevice::new();
        let mut fb = device.allocate(4, 4).unwrap();
        fb.fill_rect(0, 0, 1, 1, crate::core::framebuffer::Xrgb8888(0x1122_3344));

        let exported = device.export(&fb).unwrap();
        let view = Mapping::shared(exported.as_fd(), fb.size(), 0).unwrap();
        assert_eq!(&view.as_slice()[..4], &0x1122_3344u32.to_ne_bytes());

        drop(view);
        device.release(fb).unwrap();
    }

    #[test]
    fn handles_not_reused_after_release() {
        let mut device = MemfdDevice::new();
        let fb = device.allocate(4, 4).unwrap();
        let handle = fb.handle();
        device.release(fb).unwrap();

        let other = device.allocate(4, 4).unwrap();
        assert_ne!(other.handle(), handle);
        device.release(other).unwrap();
    }

    #[test]
    fn oversized_allocation_is_device_error() {
        let mut device = MemfdDevice::new();
        let err = device.allocate(1 << 30, 1).unwrap_err();
        assert!(matches!(err, Error::Device { op: "allocate", .. }));
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn missing_card_is_device_error() {
        let err = DrmDevice::open("/nonexistent/dri/card0").unwrap_err();
        assert!(matches!(err, Error::Device { op: "open card", .. }));
    }
}
