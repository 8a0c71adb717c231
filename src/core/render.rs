use super::framebuffer::{FrameBuffer, Xrgb8888};
use crate::control::MAX_OUTPUTS;

/// Fills buffers with content before they are handed out
pub trait FrameRenderer {
    /// Initial content for a freshly allocated ring buffer
    fn test_pattern(&mut self, buffer: &mut FrameBuffer);

    /// Draw the next frame for an output into a cleared buffer
    fn render(&mut self, output: usize, buffer: &mut FrameBuffer);
}

impl<R: FrameRenderer + ?Sized> FrameRenderer for Box<R> {
    fn test_pattern(&mut self, buffer: &mut FrameBuffer) {
        (**self).test_pattern(buffer)
    }

    fn render(&mut self, output: usize, buffer: &mut FrameBuffer) {
        (**self).render(output, buffer)
    }
}

const BAR_WIDTH: u32 = 40;
const BAR_SPEED: u32 = 8;

/// Vertical white bar sliding across each output
#[derive(Debug, Clone)]
pub struct ColorBar {
    bar_width: u32,
    speed: u32,
    xpos: [u32; MAX_OUTPUTS],
}

impl ColorBar {
    pub fn new() -> Self {
        Self::with_bar(BAR_WIDTH, BAR_SPEED)
    }

    pub fn with_bar(bar_width: u32, speed: u32) -> Self {
        Self {
            bar_width,
            speed,
            xpos: [0; MAX_OUTPUTS],
        }
    }

    /// Where the next bar for `output` starts
    pub fn position(&self, output: usize) -> u32 {
        self.xpos[output]
    }
}

impl Default for ColorBar {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRenderer for ColorBar {
    fn test_pattern(&mut self, buffer: &mut FrameBuffer) {
        const STRIPES: [Xrgb8888; 8] = [
            Xrgb8888::rgb(255, 255, 255),
            Xrgb8888::rgb(255, 255, 0),
            Xrgb8888::rgb(0, 255, 255),
            Xrgb8888::rgb(0, 255, 0),
            Xrgb8888::rgb(255, 0, 255),
            Xrgb8888::rgb(255, 0, 0),
            Xrgb8888::rgb(0, 0, 255),
            Xrgb8888::rgb(0, 0, 0),
        ];

        let width = buffer.width();
        let height = buffer.height();
        let stripe = width.div_ceil(STRIPES.len() as u32).max(1);

        for (i, color) in STRIPES.iter().enumerate() {
            buffer.fill_rect(i as u32 * stripe, 0, stripe, height, *color);
        }
    }

    fn render(&mut self, output: usize, buffer: &mut FrameBuffer) {
        let x = self.xpos[output];
        buffer.fill_rect(x, 0, self.bar_width, buffer.height(), Xrgb8888::WHITE);

        // Narrow outputs keep the bar pinned at the left edge
        let travel = buffer.width().saturating_sub(self.bar_width).max(1);
        self.xpos[output] = (x + self.speed) % travel;
    }
}
