// cli.rs - Command-line interface configuration
use std::path::PathBuf;

use clap::Parser;

use crate::config::DeviceKind;
use crate::core::BufferPolicy;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "frame-producer")]
#[command(about = "Renders frames on request and passes buffer handles to one consumer", long_about = None)]
pub struct Cli {
    /// JSON config file; flags given here override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// POSIX shared memory name of the control block
    #[arg(long)]
    pub shm_name: Option<String>,

    /// Create the control block if the controller has not
    #[arg(long)]
    pub create_shm: bool,

    /// Unix socket path the consumer connects to
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Buffer allocator
    #[arg(long, value_enum)]
    pub device: Option<DeviceKind>,

    /// DRM card node, used with `--device drm`
    #[arg(long)]
    pub card: Option<PathBuf>,

    /// Buffers per output in recycling mode
    #[arg(long)]
    pub ring_depth: Option<usize>,

    #[arg(long, value_enum)]
    pub policy: Option<BufferPolicy>,

    /// Disable advisory console output
    #[arg(long = "quiet", default_value = "false")]
    pub quiet: bool,
}
