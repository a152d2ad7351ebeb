use super::*;

use kestrel_shared::{STATUS_QUEUED, STATUS_RUNNING};
use pretty_assertions::assert_eq;

type Log = Arc<Mutex<Vec<String>>>;

struct Recorded {
    name: &'static str,
    log: Log,
    fail: bool,
}

impl DeferredCommand for Recorded {
    fn submit(self: Box<Self>, _event: &Event) -> Result<CompletionStamp> {
        lock(&self.log).push(format!("submit {}", self.name));
        if self.fail {
            return Err(RuntimeError::Backend("submission rejected".into()));
        }
        Ok(CompletionStamp {
            task_count: 1,
            task_level: 1,
            flush_stamp: 1,
        })
    }

    fn abort(self: Box<Self>, _event: &Event, status: i32) {
        lock(&self.log).push(format!("abort {} {}", self.name, status));
    }
}

fn user_event(registry: &Arc<EventRegistry>) -> Arc<Event> {
    registry.insert_with(|id, reg| Event::new(id, reg, EventInit::user()))
}

fn deferred(
    registry: &Arc<EventRegistry>,
    parents: &[&Arc<Event>],
    name: &'static str,
    log: &Log,
) -> Arc<Event> {
    deferred_with(registry, parents, name, log, false)
}

fn deferred_with(
    registry: &Arc<EventRegistry>,
    parents: &[&Arc<Event>],
    name: &'static str,
    log: &Log,
    fail: bool,
) -> Arc<Event> {
    let event = registry.insert_with(|id, reg| {
        Event::new(
            id,
            reg,
            EventInit {
                command_type: CommandType::NdRangeKernel,
                csr: None,
                task_level: 1,
                profiling: true,
            },
        )
    });
    event.begin_admission();
    event
        .install_command(Box::new(Recorded {
            name,
            log: log.clone(),
            fail,
        }))
        .unwrap();
    for parent in parents {
        parent.add_child(&event);
    }
    event.release_admission_guard();
    event
}

fn entries(log: &Log) -> Vec<String> {
    lock(log).clone()
}

#[test]
fn status_only_moves_down() {
    let registry = EventRegistry::new();
    let e = user_event(&registry);
    assert_eq!(e.execution_status(), ExecutionStatus::Queued);

    e.set_status(STATUS_RUNNING).unwrap();
    e.set_status(STATUS_QUEUED).unwrap();
    assert_eq!(e.raw_status(), STATUS_RUNNING);

    e.set_status(STATUS_COMPLETE).unwrap();
    assert!(matches!(
        e.set_status(STATUS_COMPLETE),
        Err(RuntimeError::InvalidOperation(_))
    ));
    // Complete -> error is still a decrease.
    e.set_status(-5).unwrap();
    assert_eq!(e.execution_status(), ExecutionStatus::Terminated(-5));
}

#[test]
fn task_count_is_set_once_then_only_grows() {
    let registry = EventRegistry::new();
    let e = user_event(&registry);
    assert_eq!(e.task_count(), TASK_COUNT_NOT_READY);

    e.update_task_count(7).unwrap();
    e.update_task_count(7).unwrap();
    e.update_task_count(9).unwrap();
    assert!(e.update_task_count(8).is_err());
    assert!(e.update_task_count(TASK_COUNT_NOT_READY).is_err());
    assert_eq!(e.task_count(), 9);
}

#[test]
fn callbacks_fire_once_at_their_threshold() {
    let registry = EventRegistry::new();
    let e = user_event(&registry);
    let fired: Arc<Mutex<Vec<(&'static str, i32)>>> = Arc::default();

    let sink = fired.clone();
    e.add_callback(
        ExecutionStatus::Submitted,
        Box::new(move |_, s| lock(&sink).push(("submitted", s))),
    )
    .unwrap();
    let sink = fired.clone();
    e.add_callback(
        ExecutionStatus::Complete,
        Box::new(move |_, s| lock(&sink).push(("complete", s))),
    )
    .unwrap();
    assert!(e
        .add_callback(ExecutionStatus::Queued, Box::new(|_, _| {}))
        .is_err());

    e.set_status(STATUS_SUBMITTED).unwrap();
    assert_eq!(*lock(&fired), vec![("submitted", STATUS_SUBMITTED)]);

    e.set_status(STATUS_COMPLETE).unwrap();
    let sink = fired.clone();
    e.add_callback(
        ExecutionStatus::Running,
        Box::new(move |_, s| lock(&sink).push(("late", s))),
    )
    .unwrap();
    assert_eq!(
        *lock(&fired),
        vec![
            ("submitted", STATUS_SUBMITTED),
            ("complete", STATUS_COMPLETE),
            ("late", STATUS_RUNNING)
        ]
    );
}

#[test]
fn blocked_command_runs_when_last_parent_completes() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let a = user_event(&registry);
    let b = user_event(&registry);
    let child = deferred(&registry, &[&a, &b], "k", &log);

    assert_eq!(child.blocking_parent_count(), 2);
    assert_eq!(child.parents(), vec![a.id(), b.id()]);
    assert!(child.has_pending_command());
    assert!(child.is_blocked());

    a.set_status(STATUS_COMPLETE).unwrap();
    assert!(entries(&log).is_empty());
    assert_eq!(child.execution_status(), ExecutionStatus::Queued);
    assert!(child.is_blocked());

    b.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(entries(&log), vec!["submit k"]);
    assert_eq!(child.execution_status(), ExecutionStatus::Submitted);
    assert_eq!(child.task_count(), 1);
    assert!(!child.has_pending_command());
    assert!(!child.is_blocked());
}

#[test]
fn forcing_completion_before_the_command_runs_is_rejected() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let gate = user_event(&registry);
    let held = deferred(&registry, &[&gate], "held", &log);
    let follower = deferred(&registry, &[&held], "follower", &log);

    for status in [STATUS_COMPLETE, STATUS_RUNNING, STATUS_SUBMITTED] {
        assert!(matches!(
            held.set_status(status),
            Err(RuntimeError::InvalidOperation(_))
        ));
    }
    assert_eq!(held.execution_status(), ExecutionStatus::Queued);
    assert!(held.has_pending_command());
    assert!(follower.is_blocked());
    assert!(entries(&log).is_empty());

    gate.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(entries(&log), vec!["submit held", "submit follower"]);
    held.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(held.execution_status(), ExecutionStatus::Complete);
}

#[test]
fn terminating_a_blocked_command_event_is_allowed() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let gate = user_event(&registry);
    let held = deferred(&registry, &[&gate], "held", &log);

    held.set_status(-5).unwrap();
    assert_eq!(entries(&log), vec!["abort held -5"]);
    assert!(!held.is_blocked());
    assert_eq!(held.blocking_parent_count(), 1);
}

#[test]
fn parent_done_before_edge_submits_at_guard_release() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let a = user_event(&registry);
    a.set_status(STATUS_COMPLETE).unwrap();

    let child = deferred(&registry, &[&a], "k", &log);
    assert_eq!(entries(&log), vec!["submit k"]);
    assert_eq!(child.blocking_parent_count(), 0);
}

#[test]
fn diamond_submits_the_join_once() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let root = user_event(&registry);
    let left = deferred(&registry, &[&root], "left", &log);
    let right = deferred(&registry, &[&root], "right", &log);
    let join = deferred(&registry, &[&left, &right], "join", &log);

    root.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(entries(&log), vec!["submit left", "submit right", "submit join"]);
    assert_eq!(join.execution_status(), ExecutionStatus::Submitted);
}

#[test]
fn error_terminates_the_whole_subtree() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let user = user_event(&registry);
    let other = user_event(&registry);
    let first = deferred(&registry, &[&user], "first", &log);
    let second = deferred(&registry, &[&first, &other], "second", &log);

    let fired: Arc<Mutex<Vec<i32>>> = Arc::default();
    let sink = fired.clone();
    second
        .add_callback(
            ExecutionStatus::Complete,
            Box::new(move |_, s| lock(&sink).push(s)),
        )
        .unwrap();

    assert!(second.is_blocked());
    user.set_status(-14).unwrap();
    assert_eq!(first.raw_status(), -14);
    assert_eq!(second.raw_status(), -14);
    // `other` still holds its edge, but a terminated event no longer counts as blocked.
    assert_eq!(second.blocking_parent_count(), 1);
    assert!(!first.is_blocked());
    assert!(!second.is_blocked());
    assert_eq!(entries(&log), vec!["abort first -14", "abort second -14"]);
    assert_eq!(*lock(&fired), vec![-14]);

    // The remaining parent finishing later changes nothing.
    other.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(second.raw_status(), -14);
    assert_eq!(entries(&log).len(), 2);
}

#[test]
fn failed_deferred_submission_terminates_children() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let user = user_event(&registry);
    let bad = deferred_with(&registry, &[&user], "bad", &log, true);
    let after = deferred(&registry, &[&bad], "after", &log);

    user.set_status(STATUS_COMPLETE).unwrap();
    let code = RuntimeError::Backend(String::new()).code();
    assert_eq!(bad.raw_status(), code);
    assert_eq!(after.raw_status(), code);
    assert_eq!(
        entries(&log),
        vec!["submit bad".to_string(), format!("abort after {code}")]
    );
}

#[test]
fn long_chains_do_not_recurse() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let head = user_event(&registry);
    let mut tail = head.clone();
    for _ in 0..20_000 {
        tail = deferred(&registry, &[&tail], "link", &log);
    }

    head.set_status(STATUS_COMPLETE).unwrap();
    assert_eq!(tail.execution_status(), ExecutionStatus::Submitted);
    assert_eq!(entries(&log).len(), 20_000);
}

#[test]
fn second_install_is_rejected() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let user = user_event(&registry);
    let e = deferred(&registry, &[&user], "k", &log);
    let again = Box::new(Recorded {
        name: "again",
        log: log.clone(),
        fail: false,
    });
    assert!(e.install_command(again).is_err());
}

#[test]
fn profiling_info_requires_completion() {
    let registry = EventRegistry::new();
    let log = Log::default();
    let user = user_event(&registry);
    assert_eq!(
        user.profiling_info(),
        Err(RuntimeError::ProfilingInfoNotAvailable)
    );

    let e = deferred(&registry, &[&user], "k", &log);
    assert_eq!(e.profiling_info(), Err(RuntimeError::ProfilingInfoNotAvailable));
    user.set_status(STATUS_COMPLETE).unwrap();
    e.set_status(STATUS_COMPLETE).unwrap();
    let info = e.profiling_info().unwrap();
    assert!(info.submitted_ns.unwrap() <= info.end_ns.unwrap());
}

#[test]
fn release_reports_the_last_reference() {
    let registry = EventRegistry::new();
    let e = user_event(&registry);
    e.retain();
    assert_eq!(e.reference_count(), 2);
    assert!(!e.release().unwrap());
    assert!(e.release().unwrap());
    assert!(e.release().is_err());
}

#[test]
fn wait_for_events_reports_errors() {
    let registry = EventRegistry::new();
    assert!(matches!(
        Event::wait_for_events(&[], false),
        Err(RuntimeError::InvalidValue(_))
    ));

    let ok = user_event(&registry);
    let bad = user_event(&registry);
    ok.set_status(STATUS_COMPLETE).unwrap();
    Event::wait_for_events(&[ok.clone()], false).unwrap();

    bad.set_status(-5).unwrap();
    assert_eq!(
        Event::wait_for_events(&[ok, bad], false),
        Err(RuntimeError::ExecStatusErrorForEventsInWaitList { status: -5 })
    );
}

#[test]
fn blocking_wait_on_a_user_event_returns_once_it_is_set() {
    let registry = EventRegistry::new();
    let e = user_event(&registry);
    assert!(!e.wait(false, false).unwrap());

    let setter = {
        let e = e.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            e.set_status(STATUS_COMPLETE).unwrap();
        })
    };
    assert!(e.wait(true, false).unwrap());
    setter.join().unwrap();
    assert!(e.is_completed());
}
