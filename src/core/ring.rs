use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use super::device::BufferDevice;
use super::framebuffer::{frame_layout, FrameBuffer};
use super::render::FrameRenderer;
use crate::control::{Geometry, ProducerView};
use crate::error::{Error, Result};

/// Buffers per output kept in flight in recycling mode
pub const DEFAULT_RING_DEPTH: usize = 15;

/// How buffers are obtained for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BufferPolicy {
    /// Fixed ring per output, allocated once at startup
    Recycle,
    /// Allocate, send and free a buffer for every request
    PerRequest,
}

impl Default for BufferPolicy {
    #[cfg(not(feature = "per-request-buffers"))]
    fn default() -> Self {
        BufferPolicy::Recycle
    }

    #[cfg(feature = "per-request-buffers")]
    fn default() -> Self {
        BufferPolicy::PerRequest
    }
}

/// Fixed set of same-sized buffers handed out round robin
#[derive(Debug)]
pub struct BufferRing {
    buffers: Box<[FrameBuffer]>,
    cursor: usize,
}

impl BufferRing {
    /// Wrap pre-allocated buffers; panics on an empty set
    pub fn new(buffers: Vec<FrameBuffer>) -> Self {
        assert!(!buffers.is_empty(), "buffer ring needs at least one buffer");
        Self {
            buffers: buffers.into_boxed_slice(),
            cursor: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.buffers.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Next buffer in ring order, cleared
    pub fn select(&mut self) -> &mut FrameBuffer {
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.buffers.len();

        let buffer = &mut self.buffers[index];
        buffer.clear();
        buffer
    }

    pub fn buffers(&self) -> &[FrameBuffer] {
        &self.buffers
    }

    fn into_buffers(self) -> Vec<FrameBuffer> {
        self.buffers.into_vec()
    }
}

/// Buffer handed out for one request
pub enum Lease<'a> {
    /// Ring slot, stays owned by the ring
    Ring(&'a mut FrameBuffer),
    /// Per-request allocation, released after transfer
    Fresh(FrameBuffer),
}

impl Deref for Lease<'_> {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        match self {
            Lease::Ring(buffer) => buffer,
            Lease::Fresh(buffer) => buffer,
        }
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut FrameBuffer {
        match self {
            Lease::Ring(buffer) => buffer,
            Lease::Fresh(buffer) => buffer,
        }
    }
}

/// Per-output buffer supply under one policy
#[derive(Debug)]
pub struct BufferManager {
    policy: BufferPolicy,
    depth: usize,
    rings: Vec<BufferRing>,
}

impl BufferManager {
    /// Set up buffers for every output currently published.
    ///
    /// In recycling mode this allocates `depth` buffers per output at the
    /// geometry seen now and paints the renderer's test pattern into each.
    pub fn new<D, R>(
        policy: BufferPolicy,
        depth: usize,
        control: ProducerView<'_>,
        device: &mut D,
        renderer: &mut R,
    ) -> Result<Self>
    where
        D: BufferDevice + ?Sized,
        R: FrameRenderer + ?Sized,
    {
        let mut manager = Self {
            policy,
            depth,
            rings: Vec::new(),
        };

        if policy == BufferPolicy::PerRequest {
            return Ok(manager);
        }

        if depth == 0 {
            return Err(Error::Config("ring depth must be at least 1".into()));
        }

        // Reject every bad output before the device hands anything out
        let geometries = (0..control.num_outputs())
            .map(|output| checked_geometry(output, control.geometry(output)))
            .collect::<Result<Vec<_>>>()?;

        for (output, (width, height)) in geometries.into_iter().enumerate() {
            let mut buffers = Vec::with_capacity(depth);
            for _ in 0..depth {
                let mut buffer = match device.allocate(width, height) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        manager.rings.push(BufferRing { buffers: buffers.into(), cursor: 0 });
                        manager.release_all(device)?;
                        return Err(e);
                    }
                };
                renderer.test_pattern(&mut buffer);
                buffers.push(buffer);
            }
            log::info!("output {}: {} buffers of {}x{}", output, depth, width, height);
            manager.rings.push(BufferRing::new(buffers));
        }

        Ok(manager)
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn ring(&self, output: usize) -> Option<&BufferRing> {
        self.rings.get(output)
    }

    /// Buffer for one request on `output`
    pub fn acquire<D>(&mut self, output: usize, geometry: Geometry, device: &mut D) -> Result<Lease<'_>>
    where
        D: BufferDevice + ?Sized,
    {
        match self.policy {
            BufferPolicy::Recycle => {
                let rings = self.rings.len();
                let ring = self
                    .rings
                    .get_mut(output)
                    .ok_or(Error::OutputWithoutRing { output, rings })?;
                Ok(Lease::Ring(ring.select()))
            }
            BufferPolicy::PerRequest => {
                let (width, height) = checked_geometry(output, geometry)?;
                let mut buffer = device.allocate(width, height)?;
                buffer.clear();
                Ok(Lease::Fresh(buffer))
            }
        }
    }

    /// Give back a lease once its handle has been sent
    pub fn finish<D>(lease: Lease<'_>, device: &mut D) -> Result<()>
    where
        D: BufferDevice + ?Sized,
    {
        match lease {
            Lease::Ring(_) => Ok(()),
            Lease::Fresh(buffer) => device.release(buffer),
        }
    }

    /// Free every ring buffer through the device
    pub fn release_all<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: BufferDevice + ?Sized,
    {
        for ring in self.rings.drain(..) {
            for buffer in ring.into_buffers() {
                device.release(buffer)?;
            }
        }
        Ok(())
    }
}

fn checked_geometry(output: usize, geometry: Geometry) -> Result<(u32, u32)> {
    let Geometry { width, height } = geometry;
    let invalid = Error::InvalidGeometry { output, width, height };
    if width <= 0 || height <= 0 {
        return Err(invalid);
    }
    let (width, height) = (width as u32, height as u32);
    frame_layout(width, height).ok_or(invalid)?;
    Ok((width, height))
}
