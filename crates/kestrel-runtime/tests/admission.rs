mod common;

use std::thread;
use std::time::Duration;

use kestrel_runtime::csr::RetireMode;
use kestrel_runtime::{
    ExecutionStatus, QueueProperties, RuntimeError, STATUS_COMPLETE, TASK_COUNT_NOT_READY,
};
use pretty_assertions::assert_eq;

use common::{init_tracing, kernel, simulated_context};

#[test]
fn blocked_command_flushes_exactly_once_when_its_user_event_completes() {
    init_tracing();
    let (ctx, gpu) = simulated_context(RetireMode::Immediate);
    let q = ctx.create_queue(QueueProperties::empty());

    let x = q.enqueue_kernel(kernel("x"), &[]).unwrap();
    assert_eq!(x.execution_status(), ExecutionStatus::Submitted);
    assert_eq!(gpu.submission_count(), 1);
    let level = q.task_level();

    let u = ctx.create_user_event();
    let y = q.enqueue_kernel(kernel("y"), &[u.clone()]).unwrap();
    assert_eq!(q.task_level(), level + 1);
    assert_eq!(y.task_count(), TASK_COUNT_NOT_READY);
    assert_eq!(u.pending_child_count(), 1);
    assert_eq!(y.blocking_parent_count(), 1);
    assert_eq!(gpu.submission_count(), 1);

    ctx.set_user_event_status(&u, STATUS_COMPLETE).unwrap();
    assert_eq!(gpu.submission_count(), 2);
    assert_eq!(y.task_count(), x.task_count() + 1);

    ctx.wait_for_events(&[x.clone(), y.clone()]).unwrap();
    assert!(x.is_completed());
    assert!(y.is_completed());

    // A second signal must not resubmit anything.
    assert!(ctx.set_user_event_status(&u, STATUS_COMPLETE).is_err());
    assert_eq!(gpu.submission_count(), 2);
}

#[test]
fn one_user_event_gates_commands_on_two_queues() {
    init_tracing();
    let (ctx, gpu) = simulated_context(RetireMode::Immediate);
    let a = ctx.create_queue(QueueProperties::empty());
    let b = ctx.create_queue(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE);
    let u = ctx.create_user_event();

    let on_a = a.enqueue_kernel(kernel("a"), &[u.clone()]).unwrap();
    let on_b = b.enqueue_kernel(kernel("b"), &[u.clone(), on_a.clone()]).unwrap();
    assert_eq!(u.pending_child_count(), 2);
    assert_eq!(gpu.submission_count(), 0);

    ctx.set_user_event_status(&u, STATUS_COMPLETE).unwrap();
    assert_eq!(gpu.submission_count(), 2);
    assert!(on_a.task_count() < on_b.task_count());
    ctx.wait_for_events(&[on_b]).unwrap();
}

#[test]
fn waiting_on_a_failed_chain_reports_the_error() {
    init_tracing();
    let (ctx, gpu) = simulated_context(RetireMode::Immediate);
    let q = ctx.create_queue(QueueProperties::empty());
    let u = ctx.create_user_event();
    let e = q.enqueue_kernel(kernel("k"), &[u.clone()]).unwrap();

    let waiter = {
        let ctx = ctx.clone();
        let e = e.clone();
        thread::spawn(move || ctx.wait_for_events(&[e]))
    };
    thread::sleep(Duration::from_millis(5));
    ctx.set_user_event_status(&u, -9).unwrap();

    assert_eq!(
        waiter.join().unwrap(),
        Err(RuntimeError::ExecStatusErrorForEventsInWaitList { status: -9 })
    );
    assert_eq!(e.raw_status(), -9);
    assert_eq!(gpu.submission_count(), 0);
}

#[test]
fn blocking_wait_rides_out_a_slow_engine() {
    init_tracing();
    let (ctx, gpu) = simulated_context(RetireMode::Deferred);
    let q = ctx.create_queue(QueueProperties::empty());
    let events: Vec<_> = (0..12)
        .map(|i| q.enqueue_kernel(kernel(&format!("k{i}")), &[]).unwrap())
        .collect();
    assert_eq!(gpu.pending_count(), 12);

    let retirer = {
        let gpu = gpu.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            gpu.retire_all()
        })
    };
    ctx.wait_for_events(&events).unwrap();
    retirer.join().unwrap();
    assert!(events.iter().all(|e| e.is_completed()));
    q.finish().unwrap();
}

#[test]
fn lost_tag_writes_surface_as_a_hang() {
    init_tracing();
    let (ctx, _gpu) = simulated_context(RetireMode::DropTagWrites);
    let q = ctx.create_queue(QueueProperties::empty());
    let e = q.enqueue_kernel(kernel("k"), &[]).unwrap();

    let err = ctx.device().csr().wait_for_idle().unwrap_err();
    assert_eq!(
        err,
        RuntimeError::GpuHang {
            task_count: e.task_count(),
            flush_stamp: e.flush_stamp(),
        }
    );
    assert!(!e.is_completed());
}
