//! Shared control block: per-output request counters and geometry.
//!
//! The block is written by two processes without locks. Each field has one
//! writer direction: the requester raises `request_count` and owns the
//! geometry, the producer only lowers `request_count`. The two sides get
//! different views so the producer code cannot touch a field it does not own.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::core::mapping::Mapping;
use crate::error::{Error, Result};

/// Number of output slots in the control block
pub const MAX_OUTPUTS: usize = 5;

/// One output slot
#[repr(C)]
#[derive(Debug, Default)]
pub struct OutputState {
    output_id: AtomicI32,
    width: AtomicI32,
    height: AtomicI32,
    request_count: AtomicI32,
}

/// Fixed layout shared between requester and producer
#[repr(C)]
#[derive(Debug, Default)]
pub struct ControlBlock {
    num_outputs: AtomicI32,
    outputs: [OutputState; MAX_OUTPUTS],
}

impl ControlBlock {
    /// Producer side of the protocol
    pub fn producer(&self) -> ProducerView<'_> {
        ProducerView { block: self }
    }

    /// Requester side of the protocol
    pub fn requester(&self) -> RequesterView<'_> {
        RequesterView { block: self }
    }
}

/// Output width and height in pixels, as published by the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: i32,
    pub height: i32,
}

/// Read geometry, read and decrement counters
#[derive(Debug, Clone, Copy)]
pub struct ProducerView<'a> {
    block: &'a ControlBlock,
}

impl<'a> ProducerView<'a> {
    /// Published output count, clamped to the slot array
    pub fn num_outputs(&self) -> usize {
        self.block.num_outputs.load(Ordering::Acquire).clamp(0, MAX_OUTPUTS as i32) as usize
    }

    pub fn output_id(&self, index: usize) -> i32 {
        self.block.outputs[index].output_id.load(Ordering::Acquire)
    }

    pub fn geometry(&self, index: usize) -> Geometry {
        let output = &self.block.outputs[index];
        Geometry {
            width: output.width.load(Ordering::Acquire),
            height: output.height.load(Ordering::Acquire),
        }
    }

    /// Outstanding requests for an output; a negative value reads as zero
    pub fn pending(&self, index: usize) -> u32 {
        self.block.outputs[index].request_count.load(Ordering::Acquire).max(0) as u32
    }

    pub fn any_pending(&self) -> bool {
        (0..self.num_outputs()).any(|i| self.pending(i) > 0)
    }

    /// Consume one request. Returns false when nothing was pending.
    ///
    /// Only this side decrements, so a positive value observed here cannot
    /// drop to zero before the `fetch_sub` lands.
    pub fn take_request(&self, index: usize) -> bool {
        let count = &self.block.outputs[index].request_count;
        if count.load(Ordering::Acquire) <= 0 {
            return false;
        }
        count.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

/// Publish outputs and raise counters
#[derive(Debug, Clone, Copy)]
pub struct RequesterView<'a> {
    block: &'a ControlBlock,
}

impl<'a> RequesterView<'a> {
    pub fn set_num_outputs(&self, count: usize) {
        self.block.num_outputs.store(count.min(MAX_OUTPUTS) as i32, Ordering::Release);
    }

    /// Set id and geometry for a slot
    pub fn configure_output(&self, index: usize, output_id: i32, width: i32, height: i32) {
        let output = &self.block.outputs[index];
        output.output_id.store(output_id, Ordering::Release);
        output.width.store(width, Ordering::Release);
        output.height.store(height, Ordering::Release);
    }

    pub fn set_geometry(&self, index: usize, width: i32, height: i32) {
        let output = &self.block.outputs[index];
        output.width.store(width, Ordering::Release);
        output.height.store(height, Ordering::Release);
    }

    /// Ask for one more frame on an output
    pub fn request(&self, index: usize) {
        self.block.outputs[index].request_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pending(&self, index: usize) -> i32 {
        self.block.outputs[index].request_count.load(Ordering::Acquire)
    }
}

/// Control block living in a named POSIX shared memory object
pub struct SharedControl {
    map: Mapping,
    name: String,
}

impl SharedControl {
    /// Open the named region read-write.
    ///
    /// With `create` the object is created if missing. In both cases a region
    /// smaller than the control block is grown to fit it.
    pub fn open(name: &str, create: bool) -> Result<Self> {
        let shm_err = |source: io::Error| Error::SharedMemory {
            name: name.to_string(),
            source,
        };

        let c_name = CString::new(name)
            .map_err(|e| shm_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let mut flags = libc::O_RDWR;
        if create {
            flags |= libc::O_CREAT;
        }

        // SAFETY: c_name is a valid NUL terminated string
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), flags, libc::S_IRUSR | libc::S_IWUSR) };
        if raw < 0 {
            return Err(shm_err(io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly opened descriptor we own
        let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });

        let len = size_of::<ControlBlock>();
        if (file.metadata().map_err(shm_err)?.len() as usize) < len {
            file.set_len(len as u64).map_err(shm_err)?;
        }

        let map = Mapping::shared(file.as_fd(), len, 0).map_err(shm_err)?;

        log::info!("mapped control block {} ({} bytes)", name, len);

        Ok(Self {
            map,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block(&self) -> &ControlBlock {
        // SAFETY: the mapping is page aligned, at least size_of::<ControlBlock>()
        // long and lives as long as self. ControlBlock is all atomics, so any
        // bit pattern is valid and concurrent writers are fine.
        unsafe { &*self.map.as_ptr().cast::<ControlBlock>() }
    }
}
