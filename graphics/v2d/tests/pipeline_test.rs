// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use v2d::iommu::pte;
use v2d::regs::{
    tbu_reg, tcr0_size, IrqStatus, TBU_TCR0, V2D_MMU_IRQ_STATUS, V2D_MMU_TOP_CTRL,
};
use v2d::sim::{self, FakeExporter, SimEngine};
use v2d::{
    BlendMode, EngineState, Error, Fence, FenceStatus, JobError, PixelFormat, ScatterList,
    SgSegment, Surface, SurfaceSlot, TaskParams, V2dConfig, V2dDevice, V2dTask, WaitResult,
};

const WAIT: Duration = Duration::from_secs(5);

struct Rig {
    engine: Arc<SimEngine>,
    exporter: Arc<FakeExporter>,
    device: V2dDevice,
}

fn quick_config() -> V2dConfig {
    V2dConfig {
        watchdog_timeout: Duration::from_millis(200),
        fence_wait_short: Duration::from_millis(10),
        fence_wait_long: Duration::from_millis(40),
        reset_poll_limit: 1000,
        ..V2dConfig::default()
    }
}

fn rig(config: V2dConfig) -> Rig {
    let engine = Arc::new(SimEngine::new());
    let exporter = Arc::new(FakeExporter::new());
    let device = V2dDevice::new(config, sim::platform(&engine, &exporter)).unwrap();
    engine.connect_irq(device.irq_handle());
    Rig {
        engine,
        exporter,
        device,
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn outcome(fence: &Fence) -> FenceStatus {
    match fence.wait(WAIT) {
        WaitResult::Signaled(status) => status,
        WaitResult::Timeout => panic!("fence {:?} never signalled", fence),
    }
}

fn surface(fd: u32) -> Surface {
    Surface::linear(fd, 64, 64, PixelFormat::Argb8888)
}

/// Copy from `src` to `dst`, both registered as contiguous buffers
fn simple_copy(rig: &Rig, src: u32, dst: u32) -> V2dTask {
    rig.exporter
        .add_contiguous(src, 0x4000_0000 + u64::from(src) * 0x10_0000, 0x4000);
    rig.exporter
        .add_contiguous(dst, 0x4000_0000 + u64::from(dst) * 0x10_0000, 0x4000);
    V2dTask::new(TaskParams::copy(surface(src), surface(dst)))
}

fn finish_frame(rig: &Rig) {
    rig.engine.raise(IrqStatus::EOF);
    assert!(rig.engine.fire());
}

fn assert_quiescent(rig: &Rig) {
    assert!(wait_until(|| rig.device.power_refcount() == 0));
    assert_eq!(rig.exporter.outstanding(), 0);
    assert_eq!(rig.device.in_flight_len(), 0);
    let (enables, disables) = rig.engine.power_transitions();
    assert_eq!(enables, disables);
    assert!(rig
        .device
        .tbu_snapshot()
        .iter()
        .all(|tbu| tbu.entry_count == 0 && tbu.window.is_none()));
}

#[test]
fn test_contiguous_buffers_skip_translation() {
    let rig = rig(quick_config());
    rig.engine.set_auto_complete(true);
    for (fd, phys) in [(1, 0x4000_0000), (2, 0x4800_0000), (3, 0x5000_0000)] {
        rig.exporter.add_contiguous(fd, phys, 0x4000);
    }
    let mut params = TaskParams::copy(surface(1), surface(3));
    params.foreground = Some(surface(2));
    params.blend = BlendMode::SrcOver;

    let submission = rig.device.submit(V2dTask::new(params)).unwrap();
    let fence = submission.fence.unwrap();
    assert_eq!(outcome(&fence), FenceStatus::Signaled);

    let task = &rig.engine.dispatched()[0];
    assert_eq!(task.job, submission.job);
    assert_eq!(task.addr(SurfaceSlot::Background), Some(0x4000_0000));
    assert_eq!(task.addr(SurfaceSlot::Foreground), Some(0x4800_0000));
    assert_eq!(task.addr(SurfaceSlot::Destination), Some(0x5000_0000));
    assert_eq!(task.addr(SurfaceSlot::Mask), None);

    for tbu in 0..rig.device.config().tbu_count {
        assert!(rig
            .engine
            .writes_to(tbu_reg(tbu, TBU_TCR0))
            .iter()
            .all(|&val| val == 0));
    }
    assert_quiescent(&rig);
}

#[test]
fn test_fragmented_destination_fills_table() {
    let rig = rig(quick_config());
    rig.exporter.add_contiguous(1, 0x4000_0000, 0x4000);
    let pages = [0x6000_0000u64, 0x6100_0000, 0x6200_0000];
    rig.exporter.add(
        2,
        ScatterList::new(
            pages
                .iter()
                .map(|&phys| SgSegment::new(phys, 0, 0x1000))
                .collect(),
        ),
    );

    let submission = rig
        .device
        .submit(V2dTask::new(TaskParams::copy(surface(1), surface(2))))
        .unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));

    let dst = SurfaceSlot::Destination.index();
    let tbu = &rig.device.tbu_snapshot()[dst];
    assert_eq!(tbu.entry_count, 3);
    assert_eq!(
        tbu.entries,
        pages.iter().map(|&phys| pte(phys)).collect::<Vec<_>>()
    );
    let tcr = rig.engine.writes_to(tbu_reg(dst, TBU_TCR0));
    assert_eq!(tcr0_size(*tcr.last().unwrap()), 2);
    assert_eq!(
        rig.engine.dispatched()[0].addr(SurfaceSlot::Destination),
        Some(rig.device.config().iova_base + dst as u64 * rig.device.config().iova_step)
    );

    finish_frame(&rig);
    assert_eq!(outcome(submission.fence.as_ref().unwrap()), FenceStatus::Signaled);
    assert_quiescent(&rig);
}

#[test]
fn test_engine_fault_fails_job_and_resets_once() {
    let rig = rig(quick_config());
    let submission = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));
    assert_eq!(rig.device.engine_state(), EngineState::Dispatched);

    rig.engine.raise_mmu_fault(0, 0x8000_1000);
    assert!(rig.engine.fire());

    assert_eq!(
        outcome(submission.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::HardwareFault)
    );
    assert!(wait_until(|| rig.device.stats().resets == 1));
    assert!(wait_until(|| rig.device.engine_state() == EngineState::Idle));
    assert_eq!(rig.engine.resets(), 1);
    assert_eq!(rig.engine.reg(V2D_MMU_IRQ_STATUS), 0);

    let stats = rig.device.stats();
    assert_eq!(stats.hw_faults, 1);
    assert_eq!(stats.mmu_faults, 1);
    assert_quiescent(&rig);

    // The engine is usable again afterwards
    let next = rig.device.submit(simple_copy(&rig, 3, 4)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 2));
    finish_frame(&rig);
    assert_eq!(outcome(next.fence.as_ref().unwrap()), FenceStatus::Signaled);
}

#[test]
fn test_fault_takes_every_frame_on_the_engine() {
    let rig = rig(V2dConfig {
        max_in_flight: 2,
        ..quick_config()
    });
    let first = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    let second = rig.device.submit(simple_copy(&rig, 3, 4)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 2));
    let third = rig.device.submit(simple_copy(&rig, 5, 6)).unwrap();

    rig.engine.raise(IrqStatus::DMA_RD_ERR);
    assert!(rig.engine.fire());

    for submission in [&first, &second] {
        assert_eq!(
            outcome(submission.fence.as_ref().unwrap()),
            FenceStatus::Error(JobError::HardwareFault)
        );
    }
    assert!(wait_until(|| rig.engine.dispatch_count() == 3));
    assert_eq!(rig.engine.dispatched()[2].job, third.job);
    assert_eq!(rig.device.engine_state(), EngineState::Dispatched);

    finish_frame(&rig);
    assert_eq!(outcome(third.fence.as_ref().unwrap()), FenceStatus::Signaled);
    assert_eq!(rig.engine.resets(), 1);
    assert_eq!(rig.device.stats().hw_faults, 1);
    assert_quiescent(&rig);
}

#[test]
fn test_compressed_output_needs_both_done_bits() {
    let rig = rig(quick_config());
    let mut task = simple_copy(&rig, 1, 2);
    task.params.destination.compressed = true;
    let fence = rig.device.submit(task).unwrap().fence.unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));

    finish_frame(&rig);
    assert_eq!(fence.wait(Duration::from_millis(50)), WaitResult::Timeout);

    rig.engine.raise(IrqStatus::FBCENC_DONE);
    assert!(rig.engine.fire());
    assert_eq!(outcome(&fence), FenceStatus::Signaled);
}

#[test]
fn test_watchdog_recovers_hung_engine() {
    let rig = rig(quick_config());
    let never = Arc::new(Fence::new(99, 1));

    let stuck = rig
        .device
        .submit(simple_copy(&rig, 1, 2).with_in_fence(never))
        .unwrap();
    // The input fence never signals, so the job runs anyway after both waits
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));

    let next = rig.device.submit(simple_copy(&rig, 3, 4)).unwrap();
    assert_eq!(
        outcome(stuck.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::Timeout)
    );
    assert!(wait_until(|| rig.engine.dispatch_count() == 2));
    assert_eq!(rig.engine.dispatched()[1].job, next.job);

    finish_frame(&rig);
    assert_eq!(outcome(next.fence.as_ref().unwrap()), FenceStatus::Signaled);

    let stats = rig.device.stats();
    assert_eq!(stats.watchdog_timeouts, 1);
    assert!(stats.resets >= 1);
    assert_quiescent(&rig);
}

#[test]
fn test_recovery_resets_before_queued_job_runs() {
    let rig = rig(V2dConfig {
        watchdog_timeout: WAIT,
        reset_poll_limit: 1_000_000,
        ..quick_config()
    });
    rig.engine.set_reset_latency(200_000);
    let stuck = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));

    rig.exporter.add_contiguous(3, 0x4300_0000, 0x4000);
    rig.exporter.add(
        4,
        ScatterList::new(vec![
            SgSegment::new(0x6000_0000, 0, 0x1000),
            SgSegment::new(0x6100_0000, 0, 0x1000),
        ]),
    );
    let queued = rig
        .device
        .submit(V2dTask::new(TaskParams::copy(surface(3), surface(4))))
        .unwrap();

    thread::scope(|s| {
        s.spawn(|| rig.device.recover());
    });

    assert_eq!(
        outcome(stuck.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::Timeout)
    );
    assert!(wait_until(|| rig.engine.dispatch_count() == 2));
    assert_eq!(rig.device.engine_state(), EngineState::Dispatched);
    // The queued job set up its translation after the reset, not before
    assert_eq!(rig.engine.writes_to(V2D_MMU_TOP_CTRL).last(), Some(&1));
    assert_eq!(rig.device.tbu_snapshot()[SurfaceSlot::Destination.index()].entry_count, 2);

    finish_frame(&rig);
    assert_eq!(outcome(queued.fence.as_ref().unwrap()), FenceStatus::Signaled);
    assert_eq!(rig.engine.resets(), 1);
    assert_quiescent(&rig);
}

#[test]
fn test_late_input_fence_gates_dispatch() {
    let rig = rig(V2dConfig {
        fence_wait_short: Duration::from_millis(20),
        fence_wait_long: WAIT,
        watchdog_timeout: WAIT,
        ..quick_config()
    });
    rig.engine.set_auto_complete(true);
    let producer = Arc::new(Fence::new(7, 1));
    let submission = rig
        .device
        .submit(simple_copy(&rig, 1, 2).with_in_fence(producer.clone()))
        .unwrap();

    // Past the short wait, still inside the long one
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.engine.dispatch_count(), 0);

    let signalled = Instant::now();
    assert!(producer.signal(FenceStatus::Signaled));
    assert_eq!(outcome(submission.fence.as_ref().unwrap()), FenceStatus::Signaled);
    assert!(signalled.elapsed() < Duration::from_secs(1));
    assert_eq!(rig.engine.dispatch_count(), 1);
    assert_quiescent(&rig);
}

#[test]
fn test_jobs_dispatch_in_submission_order() {
    let rig = rig(quick_config());
    rig.engine.set_auto_complete(true);

    let submissions: Vec<_> = (0..20)
        .map(|i| rig.device.submit(simple_copy(&rig, 2 * i + 1, 2 * i + 2)).unwrap())
        .collect();
    for submission in &submissions {
        assert_eq!(outcome(submission.fence.as_ref().unwrap()), FenceStatus::Signaled);
    }

    let order: Vec<_> = rig.engine.dispatched().iter().map(|t| t.job).collect();
    let expected: Vec<_> = submissions.iter().map(|s| s.job).collect();
    assert_eq!(order, expected);
    assert_eq!(rig.device.stats().completed, 20);
    assert_quiescent(&rig);
}

#[test]
fn test_in_flight_never_exceeds_bound() {
    let rig = rig(V2dConfig {
        max_in_flight: 2,
        ..quick_config()
    });
    let submissions: Vec<_> = (0..5)
        .map(|i| rig.device.submit(simple_copy(&rig, 2 * i + 1, 2 * i + 2)).unwrap())
        .collect();

    assert!(wait_until(|| rig.engine.dispatch_count() == 2));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(rig.engine.dispatch_count(), 2);
    assert_eq!(rig.device.in_flight_len(), 2);
    assert_eq!(rig.device.pending_len(), 3);

    // Each end-of-frame retires the oldest frame on the engine
    for (i, submission) in submissions.iter().enumerate() {
        assert!(wait_until(|| rig.engine.dispatch_count() > i));
        finish_frame(&rig);
        assert_eq!(outcome(submission.fence.as_ref().unwrap()), FenceStatus::Signaled);
    }
    assert!(rig.device.stats().max_in_flight <= 2);
    assert_quiescent(&rig);
}

#[test]
fn test_recovery_on_idle_engine_is_harmless() {
    let rig = rig(quick_config());
    rig.device.recover();
    rig.device.recover();

    assert_eq!(rig.engine.resets(), 2);
    assert_eq!(rig.device.stats().resets, 2);
    assert_eq!(rig.device.engine_state(), EngineState::Idle);
    assert_quiescent(&rig);

    rig.engine.set_auto_complete(true);
    let submission = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    assert_eq!(outcome(submission.fence.as_ref().unwrap()), FenceStatus::Signaled);
}

#[test]
fn test_failed_mapping_still_completes() {
    let rig = rig(quick_config());
    rig.engine.set_auto_complete(true);
    rig.exporter.add_contiguous(1, 0x4000_0000, 0x4000);
    rig.exporter.add_contiguous(2, 0x4100_0000, 0x4000);
    rig.exporter.fail_map(2);

    let submission = rig
        .device
        .submit(V2dTask::new(TaskParams::copy(surface(1), surface(2))))
        .unwrap();
    assert_eq!(
        outcome(submission.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::MapFailed)
    );
    assert_eq!(rig.engine.dispatch_count(), 0);
    assert_eq!(rig.device.stats().map_failures, 1);
    assert_quiescent(&rig);
}

/// xorshift64, enough to shuffle buffer layouts
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[test]
fn test_random_workload_releases_everything() {
    let rig = rig(quick_config());
    rig.engine.set_auto_complete(true);
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    let mut next_fd = 1u32;
    let mut expected = Vec::new();

    for _ in 0..40 {
        let mut broken = false;
        let mut fds = [0u32; 2];
        for fd in fds.iter_mut() {
            *fd = next_fd;
            next_fd += 1;
            let segments = 1 + rng.below(4);
            let mut list = Vec::new();
            for i in 0..segments {
                let offset = if rng.below(10) == 0 { 0x200 } else { 0 };
                broken |= offset != 0 && segments > 1;
                list.push(SgSegment::new(
                    0x4000_0000 + rng.below(0x1000) * 0x10_0000 + i * 0x1000,
                    offset,
                    0x1000 * (1 + rng.below(3)),
                ));
            }
            rig.exporter.add(*fd, ScatterList::new(list));
        }

        let submission = rig
            .device
            .submit(V2dTask::new(TaskParams::copy(surface(fds[0]), surface(fds[1]))))
            .unwrap();
        expected.push((submission, broken));
    }

    for (submission, broken) in &expected {
        let status = outcome(submission.fence.as_ref().unwrap());
        if *broken {
            assert_eq!(status, FenceStatus::Error(JobError::MapFailed));
        } else {
            assert_eq!(status, FenceStatus::Signaled);
        }
    }

    let counters = rig.exporter.counters();
    assert_eq!(counters.gets, counters.puts);
    assert_eq!(counters.attaches, counters.detaches);
    assert_eq!(counters.maps, counters.unmaps);
    assert_quiescent(&rig);
}

#[test]
fn test_stuck_reset_makes_device_unusable() {
    let rig = rig(V2dConfig {
        reset_poll_limit: 50,
        ..quick_config()
    });
    rig.engine.break_reset();
    let submission = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));

    rig.engine.raise(IrqStatus::DMA_WR_ERR);
    assert!(rig.engine.fire());
    assert_eq!(
        outcome(submission.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::HardwareFault)
    );

    assert!(wait_until(|| !rig.device.is_usable()));
    assert_eq!(rig.device.engine_state(), EngineState::Unusable);
    assert_eq!(
        rig.device.submit(simple_copy(&rig, 3, 4)).unwrap_err(),
        Error::DeviceUnusable
    );
    assert_quiescent(&rig);
}

#[test]
fn test_shutdown_cancels_outstanding_jobs() {
    let mut rig = rig(V2dConfig {
        watchdog_timeout: WAIT,
        ..quick_config()
    });
    let running = rig.device.submit(simple_copy(&rig, 1, 2)).unwrap();
    assert!(wait_until(|| rig.engine.dispatch_count() == 1));
    let queued = rig.device.submit(simple_copy(&rig, 3, 4)).unwrap();

    rig.device.shutdown();

    for submission in [&running, &queued] {
        assert_eq!(
            outcome(submission.fence.as_ref().unwrap()),
            FenceStatus::Error(JobError::Cancelled)
        );
    }
    assert_eq!(rig.exporter.outstanding(), 0);
    assert_eq!(rig.device.power_refcount(), 0);
    assert_eq!(rig.device.engine_state(), EngineState::Idle);
    assert_eq!(
        rig.device.submit(simple_copy(&rig, 5, 6)).unwrap_err(),
        Error::Shutdown
    );
}

#[test]
fn test_shutdown_while_waiting_on_input_never_dispatches() {
    let mut rig = rig(V2dConfig {
        fence_wait_long: Duration::from_millis(300),
        watchdog_timeout: WAIT,
        ..quick_config()
    });
    let never = Arc::new(Fence::new(99, 1));
    let submission = rig
        .device
        .submit(simple_copy(&rig, 1, 2).with_in_fence(never))
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    rig.device.shutdown();

    assert_eq!(
        outcome(submission.fence.as_ref().unwrap()),
        FenceStatus::Error(JobError::Cancelled)
    );
    assert_eq!(rig.engine.dispatch_count(), 0);
    assert_eq!(rig.engine.power_transitions(), (0, 0));
    assert_eq!(rig.exporter.outstanding(), 0);
}

#[test]
fn test_submission_is_validated_up_front() {
    let rig = rig(quick_config());
    rig.exporter.add_contiguous(1, 0x4000_0000, 0x4000);

    let err = rig
        .device
        .submit(V2dTask::new(TaskParams::copy(surface(1), surface(42))))
        .unwrap_err();
    assert_eq!(err, Error::InvalidBuffer(42));

    let mut params = TaskParams::copy(surface(1), surface(1));
    params.blend = BlendMode::Masked;
    assert!(matches!(
        rig.device.submit(V2dTask::new(params)),
        Err(Error::InvalidTask(_))
    ));

    assert_eq!(rig.device.pending_len(), 0);
    assert_eq!(rig.device.stats().submitted, 0);
}

#[test]
fn test_stray_interrupt_is_ignored() {
    let rig = rig(quick_config());
    rig.engine.raise(IrqStatus::EOF);
    assert!(!rig.engine.fire());
    assert_eq!(rig.device.stats().spurious_irqs, 1);
    assert_eq!(rig.device.engine_state(), EngineState::Idle);
}
