use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

use super::device::BufferDevice;
use super::render::FrameRenderer;
use super::ring::{BufferManager, BufferPolicy};
use super::transfer::HandleChannel;
use crate::control::{ProducerView, MAX_OUTPUTS};
use crate::error::{Error, Result};

/// Wait used when no output has pending requests
pub const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Why the loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator exit source became readable
    UserInput,
    /// Consumer hung up (or wrote to us, which it never should)
    LostClient,
}

impl ExitReason {
    pub fn message(&self) -> &'static str {
        match self {
            ExitReason::UserInput => "exit due to user-input",
            ExitReason::LostClient => "exit due to lost client",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Frames delivered per output slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    per_output: [u64; MAX_OUTPUTS],
}

impl DeliveryStats {
    pub fn output(&self, index: usize) -> u64 {
        self.per_output[index]
    }

    pub fn total(&self) -> u64 {
        self.per_output.iter().sum()
    }

    fn record(&mut self, index: usize) {
        self.per_output[index] += 1;
    }
}

/// Everything the producer loop owns: control view, device, renderer, rings
/// and the consumer channel.
pub struct Scheduler<'a, D: BufferDevice, R: FrameRenderer> {
    control: ProducerView<'a>,
    device: D,
    renderer: R,
    buffers: BufferManager,
    channel: HandleChannel,
    stats: DeliveryStats,
}

impl<'a, D: BufferDevice, R: FrameRenderer> Scheduler<'a, D, R> {
    /// Build the context; in recycling mode this allocates every ring
    pub fn new(
        control: ProducerView<'a>,
        mut device: D,
        mut renderer: R,
        channel: HandleChannel,
        policy: BufferPolicy,
        ring_depth: usize,
    ) -> Result<Self> {
        let buffers = BufferManager::new(policy, ring_depth, control, &mut device, &mut renderer)?;

        Ok(Self {
            control,
            device,
            renderer,
            buffers,
            channel,
            stats: DeliveryStats::default(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn channel(&self) -> &HandleChannel {
        &self.channel
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Poll until `exit` or the channel becomes ready
    pub fn run(&mut self, exit: BorrowedFd<'_>) -> Result<ExitReason> {
        log::info!(
            "producer loop started ({:?}, ring depth {})",
            self.buffers.policy(),
            self.buffers.depth()
        );

        loop {
            if let Some(reason) = self.wait(exit)? {
                log::info!("{} after {} frames", reason, self.stats.total());
                return Ok(reason);
            }
            self.service_pending()?;
        }
    }

    /// One readiness wait. Zero timeout when work is pending, otherwise
    /// [`IDLE_POLL_TIMEOUT`]. `None` means the wait timed out.
    pub fn wait(&self, exit: BorrowedFd<'_>) -> Result<Option<ExitReason>> {
        let timeout = if self.control.any_pending() {
            0
        } else {
            IDLE_POLL_TIMEOUT.as_millis() as libc::c_int
        };

        let mut fds = [
            libc::pollfd {
                fd: exit.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.channel.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: fds is a valid array of pollfd for the duration of the call
        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if r < 0 {
            return Err(Error::Poll(io::Error::last_os_error()));
        }

        classify(fds[0].revents, fds[1].revents)
    }

    /// Serve at most one request per output, in index order.
    ///
    /// The counter is decremented before the buffer is touched, so a failure
    /// further down never leaves the same request to be served twice.
    /// Returns the number of frames sent.
    pub fn service_pending(&mut self) -> Result<usize> {
        let mut served = 0;

        for output in 0..self.control.num_outputs() {
            if !self.control.take_request(output) {
                continue;
            }

            let output_id = self.control.output_id(output);
            let geometry = self.control.geometry(output);

            let mut lease = self.buffers.acquire(output, geometry, &mut self.device)?;
            self.renderer.render(output, &mut lease);
            self.channel.send_buffer(&self.device, output_id, &lease)?;

            log::debug!(
                "output {} (id {}): sent buffer {} {}x{}",
                output,
                output_id,
                lease.handle(),
                lease.width(),
                lease.height()
            );

            BufferManager::finish(lease, &mut self.device)?;
            self.stats.record(output);
            served += 1;
        }

        Ok(served)
    }

    /// Free ring buffers and close the channel
    pub fn shutdown(self) -> Result<DeliveryStats> {
        let Self {
            mut device,
            mut buffers,
            channel,
            stats,
            ..
        } = self;

        buffers.release_all(&mut device)?;
        drop(channel);
        Ok(stats)
    }
}

/// Map poll results on the exit source and the channel to a stop reason.
/// A descriptor that is not open (`POLLNVAL`) is a poll failure, not input.
fn classify(exit: libc::c_short, channel: libc::c_short) -> Result<Option<ExitReason>> {
    if (exit | channel) & libc::POLLNVAL != 0 {
        return Err(Error::Poll(io::Error::from_raw_os_error(libc::EBADF)));
    }
    if exit != 0 {
        return Ok(Some(ExitReason::UserInput));
    }
    if channel != 0 {
        return Ok(Some(ExitReason::LostClient));
    }
    Ok(None)
}
