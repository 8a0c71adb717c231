use std::io;
use std::os::fd::AsFd;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;

use frame_producer::cli::Cli;
use frame_producer::config::{Config, DeviceKind};
use frame_producer::core::{
    BufferDevice, ClientListener, ColorBar, DrmDevice, HandleChannel, MemfdDevice, Scheduler,
};
use frame_producer::SharedControl;

fn open_device(config: &Config) -> Result<Box<dyn BufferDevice>> {
    Ok(match config.device {
        DeviceKind::Memfd => Box::new(MemfdDevice::new()),
        DeviceKind::Drm => Box::new(
            DrmDevice::open(&config.card)
                .with_context(|| format!("opening {}", config.card.display()))?,
        ),
    })
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;
    let say = |line: &str| {
        if !cli.quiet {
            println!("{}", line);
        }
    };

    let started = Local::now();

    let shared = SharedControl::open(&config.shm_name, config.create_shm)
        .context("opening control block")?;
    let device = open_device(&config)?;

    let listener = ClientListener::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    say("listening...");

    let stream = listener.accept_one().context("accepting consumer")?;
    say("accepted connection");

    let mut scheduler = Scheduler::new(
        shared.block().producer(),
        device,
        ColorBar::new(),
        HandleChannel::new(stream),
        config.policy,
        config.ring_depth,
    )
    .context("allocating buffers")?;

    let stdin = io::stdin();
    let reason = scheduler.run(stdin.as_fd()).context("producer loop")?;
    if !cli.quiet {
        eprintln!("{}", reason);
    }

    let stats = scheduler.shutdown().context("releasing buffers")?;
    say("done");

    drop(listener);

    let elapsed = Local::now() - started;
    log::info!(
        "session on {} started {} ran {:.1}s, delivered {} frames",
        shared.name(),
        started.format("%Y-%m-%d %H:%M:%S"),
        elapsed.num_milliseconds() as f64 / 1000.0,
        stats.total()
    );

    Ok(())
}
