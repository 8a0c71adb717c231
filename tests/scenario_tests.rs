use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use frame_producer::control::ControlBlock;
use frame_producer::core::{
    recv_handle, BufferDevice, BufferPolicy, ColorBar, ExitReason, HandleChannel, Mapping,
    MemfdDevice, Scheduler, Xrgb8888,
};

/// Control block with the given (id, width, height) outputs
fn control(outputs: &[(i32, i32, i32)]) -> ControlBlock {
    let block = ControlBlock::default();
    for (i, (id, w, h)) in outputs.iter().enumerate() {
        block.requester().configure_output(i, *id, *w, *h);
    }
    block.requester().set_num_outputs(outputs.len());
    block
}

fn scheduler(
    block: &ControlBlock,
    channel: UnixStream,
    policy: BufferPolicy,
    depth: usize,
) -> Scheduler<'_, MemfdDevice, ColorBar> {
    Scheduler::new(
        block.producer(),
        MemfdDevice::new(),
        ColorBar::new(),
        HandleChannel::new(channel),
        policy,
        depth,
    )
    .unwrap()
}

fn drain_tags(rx: &UnixStream) -> Vec<u8> {
    std::iter::from_fn(|| recv_handle(rx).unwrap().map(|(tag, _)| tag)).collect()
}

#[cfg(test)]
mod scenario_tests {
    use super::*;

    // ============================================================================
    // Scenario A: two increments queued before the loop runs
    // ============================================================================

    #[test]
    fn test_two_queued_requests_drain_over_two_passes() {
        let block = control(&[(42, 64, 16)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 15);

        block.requester().request(0);
        block.requester().request(0);
        assert_eq!(block.requester().pending(0), 2);

        assert_eq!(producer.service_pending().unwrap(), 1);
        assert_eq!(block.requester().pending(0), 1);

        assert_eq!(producer.service_pending().unwrap(), 1);
        assert_eq!(block.requester().pending(0), 0);

        assert_eq!(producer.service_pending().unwrap(), 0);
        assert_eq!(producer.channel().sent(), 2);

        producer.shutdown().unwrap();
        assert_eq!(drain_tags(&rx), vec![42, 42]);
    }

    #[test]
    fn test_run_loop_delivers_queued_requests() {
        let block = control(&[(42, 64, 16)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let (exit, mut exit_tx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 15);

        block.requester().request(0);
        block.requester().request(0);

        let (reason, tags) = std::thread::scope(|s| {
            let consumer = s.spawn(move || {
                let mut tags = Vec::new();
                for _ in 0..2 {
                    let (tag, _fd) = recv_handle(&rx).unwrap().unwrap();
                    tags.push(tag);
                }
                exit_tx.write_all(b"\n").unwrap();
                tags
            });

            let reason = producer.run(exit.as_fd()).unwrap();
            (reason, consumer.join().unwrap())
        });

        assert_eq!(reason, ExitReason::UserInput);
        assert_eq!(tags, vec![42, 42]);
        assert_eq!(block.requester().pending(0), 0);
        assert_eq!(producer.stats().output(0), 2);
    }

    // ============================================================================
    // Scenario B: operator exit while idle
    // ============================================================================

    #[test]
    fn test_user_input_while_idle() {
        let block = control(&[(0, 32, 32)]);
        let (tx, _rx) = UnixStream::pair().unwrap();
        let (exit, mut exit_tx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 2);

        exit_tx.write_all(b"q").unwrap();

        let reason = producer.run(exit.as_fd()).unwrap();
        assert_eq!(reason, ExitReason::UserInput);
        assert_eq!(reason.to_string(), "exit due to user-input");
        assert_eq!(producer.channel().sent(), 0);
    }

    // ============================================================================
    // Scenario C: consumer gone while a request is pending
    // ============================================================================

    #[test]
    fn test_lost_client_leaves_request_undelivered() {
        let block = control(&[(0, 32, 32)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let (exit, _exit_tx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 2);

        block.requester().request(0);
        drop(rx);

        let reason = producer.run(exit.as_fd()).unwrap();
        assert_eq!(reason, ExitReason::LostClient);
        assert_eq!(reason.to_string(), "exit due to lost client");

        // Accepted behavior: the request stays on the counter
        assert_eq!(block.requester().pending(0), 1);
        assert_eq!(producer.channel().sent(), 0);
    }

    // ============================================================================
    // Scenario D: allocate-per-request mode frees right after transfer
    // ============================================================================

    #[test]
    fn test_per_request_buffer_freed_after_transfer() {
        let block = control(&[(5, 48, 8)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::PerRequest, 15);
        assert_eq!(producer.device().live_allocations(), 0);

        block.requester().request(0);
        assert_eq!(producer.service_pending().unwrap(), 1);
        assert_eq!(producer.device().live_allocations(), 0);

        // The consumer's duplicate outlives the producer's allocation
        let (tag, fd) = recv_handle(&rx).unwrap().unwrap();
        assert_eq!(tag, 5);
        let view = Mapping::shared(fd.as_fd(), 48 * 8 * 4, 0).unwrap();
        let first_pixel = u32::from_ne_bytes(view.as_slice()[..4].try_into().unwrap());
        assert_eq!(first_pixel, Xrgb8888::WHITE.0);
    }

    #[test]
    fn test_per_request_picks_up_geometry_change() {
        let block = control(&[(0, 48, 8)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::PerRequest, 15);

        block.requester().set_geometry(0, 96, 2);
        block.requester().request(0);
        producer.service_pending().unwrap();

        let (_, fd) = recv_handle(&rx).unwrap().unwrap();
        let size = std::fs::File::from(fd).metadata().unwrap().len();
        assert!(size >= 96 * 2 * 4);
    }

    // ============================================================================
    // Ordering across outputs and iterations
    // ============================================================================

    #[test]
    fn test_delivery_order_is_output_major_per_pass() {
        let block = control(&[(10, 16, 4), (20, 16, 4), (30, 16, 4)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 4);
        let requester = block.requester();

        // Burst: output 2 twice, output 0 once, output 1 three times
        for output in [2, 0, 1, 2, 1, 1] {
            requester.request(output);
        }

        let mut expected = Vec::new();
        let mut model = [1u32, 3, 2];
        while model.iter().any(|c| *c > 0) {
            for (i, count) in model.iter_mut().enumerate() {
                if *count > 0 {
                    *count -= 1;
                    expected.push([10, 20, 30][i]);
                }
            }
            producer.service_pending().unwrap();
        }

        // Late request only lands on the next pass
        requester.request(0);
        producer.service_pending().unwrap();
        expected.push(10);

        producer.shutdown().unwrap();
        assert_eq!(drain_tags(&rx), expected);
        assert_eq!(expected, vec![10, 20, 30, 20, 30, 20, 10]);
    }

    #[test]
    fn test_counters_never_negative_under_concurrent_requester() {
        let block = control(&[(0, 8, 8), (1, 8, 8)]);
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut producer = scheduler(&block, tx, BufferPolicy::Recycle, 3);

        let total = std::thread::scope(|s| {
            let consumer = s.spawn(|| drain_tags(&rx).len());

            let requester = s.spawn(|| {
                for i in 0..200 {
                    block.requester().request(i % 2);
                }
            });

            while !requester.is_finished() || block.producer().any_pending() {
                producer.service_pending().unwrap();
                for output in 0..2 {
                    assert!(block.requester().pending(output) >= 0);
                }
            }

            producer.service_pending().unwrap();
            let stats = producer.stats().clone();
            drop(producer);
            assert_eq!(consumer.join().unwrap() as u64, stats.total());
            stats.total()
        });

        assert_eq!(total, 200);
        assert_eq!(block.requester().pending(0), 0);
        assert_eq!(block.requester().pending(1), 0);
    }
}
