pub mod device;
pub mod framebuffer;
pub mod mapping;
pub mod render;
pub mod ring;
pub mod scheduler;
pub mod server;
pub mod transfer;

pub use device::{BufferDevice, DrmDevice, MemfdDevice};
pub use framebuffer::{frame_layout, FrameBuffer, Xrgb8888, BITS_PER_PIXEL, BYTES_PER_PIXEL};
pub use mapping::Mapping;
pub use render::{ColorBar, FrameRenderer};
pub use ring::{BufferManager, BufferPolicy, BufferRing, Lease, DEFAULT_RING_DEPTH};
pub use scheduler::{DeliveryStats, ExitReason, Scheduler, IDLE_POLL_TIMEOUT};
pub use server::ClientListener;
pub use transfer::{recv_handle, HandleChannel};
