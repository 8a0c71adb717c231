use bytemuck::{Pod, Zeroable};

use super::mapping::Mapping;

/// Pixel depth in bits, fixed for every buffer
pub const BITS_PER_PIXEL: u32 = 32;
pub const BYTES_PER_PIXEL: u32 = BITS_PER_PIXEL / 8;

/// One XRGB8888 pixel, native endian
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Xrgb8888(pub u32);

impl Xrgb8888 {
    pub const BLACK: Self = Self(0x0000_0000);
    pub const WHITE: Self = Self(0x00ff_ffff);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }
}

/// Row stride and visible byte count for a `width` x `height` buffer,
/// or `None` when either does not fit
pub fn frame_layout(width: u32, height: u32) -> Option<(u32, usize)> {
    let stride = width.checked_mul(BYTES_PER_PIXEL)?;
    let visible = (stride as usize).checked_mul(height as usize)?;
    Some((stride, visible))
}

/// Renderable buffer with its CPU mapping.
///
/// The backing allocation belongs to the device that created it; the buffer
/// only carries the driver handle and must go back through
/// `BufferDevice::release`.
#[derive(Debug)]
pub struct FrameBuffer {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) stride: u32,
    pub(crate) size: usize,
    pub(crate) handle: u32,
    pub(crate) map: Mapping,
}

impl FrameBuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Allocation size, at least `stride * height`
    pub fn size(&self) -> usize {
        self.size
    }

    /// In-process driver handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map.as_slice()[..self.size]
    }

    /// Visible pixels, row major, `width * height` long
    pub fn pixels(&self) -> &[Xrgb8888] {
        let visible = self.stride as usize * self.height as usize;
        bytemuck::cast_slice(&self.map.as_slice()[..visible])
    }

    pub fn pixels_mut(&mut self) -> &mut [Xrgb8888] {
        let visible = self.stride as usize * self.height as usize;
        bytemuck::cast_slice_mut(&mut self.map.as_mut_slice()[..visible])
    }

    /// Zero the whole allocation, padding included
    pub fn clear(&mut self) {
        let size = self.size;
        self.map.as_mut_slice()[..size].fill(0);
    }

    /// Fill an axis aligned rectangle, clipped to the buffer
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Xrgb8888) {
        let x_end = x.saturating_add(width).min(self.width);
        let y_end = y.saturating_add(height).min(self.height);
        if x >= x_end || y >= y_end {
            return;
        }

        let row_len = self.width as usize;
        let pixels = self.pixels_mut();
        for row in y as usize..y_end as usize {
            let start = row * row_len;
            pixels[start + x as usize..start + x_end as usize].fill(color);
        }
    }

    pub(crate) fn into_map(self) -> Mapping {
        self.map
    }
}
