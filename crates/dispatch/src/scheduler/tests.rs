#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot, Semaphore};

    use switchyard_core::SwitchyardConfig;

    use crate::cpu::NullProbe;
    use crate::error::{DispatchError, WorkError};
    use crate::metrics::SchedulerSnapshot;
    use crate::observer::{ChannelObserver, LifecycleEvent};
    use crate::process::HousekeepingProcess;
    use crate::scheduler::{Scheduler, SchedulerState};
    use crate::work::{WorkItem, WorkKind, WorkOutcome, WorkReport, WorkRequest};

    fn scheduler(capacity: usize) -> Scheduler {
        Scheduler::builder(&SwitchyardConfig::default())
            .capacity(capacity)
            .idle_tick(Duration::from_millis(10))
            .without_statistics()
            .cpu_probe(NullProbe)
            .build()
            .unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Work that blocks until the gate hands out a permit.
    fn gated(
        priority: i32,
        name: &str,
        gate: &Arc<Semaphore>,
        order: &Arc<Mutex<Vec<String>>>,
    ) -> WorkRequest {
        let gate = gate.clone();
        let order = order.clone();
        let label = name.to_string();
        WorkRequest::new(priority, move |_cancel| async move {
            order.lock().unwrap().push(label);
            let permit = gate
                .acquire()
                .await
                .map_err(|e| WorkError::failed(e.to_string()))?;
            permit.forget();
            Ok(())
        })
        .caller(name)
    }

    fn reporting(request: WorkRequest, tx: &mpsc::UnboundedSender<WorkReport>) -> WorkRequest {
        let tx = tx.clone();
        request.on_complete(move |report| {
            let _ = tx.send(report.clone());
        })
    }

    async fn next_report(rx: &mut mpsc::UnboundedReceiver<WorkReport>) -> WorkReport {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("report in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let scheduler = scheduler(2);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(
            scheduler.submit(WorkRequest::new(0, |_c| async { Ok(()) })),
            Err(DispatchError::NotRunning)
        ));

        scheduler.start().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(matches!(scheduler.start(), Err(DispatchError::AlreadyRunning)));

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        scheduler.stop().await;

        scheduler.start().unwrap();
        scheduler.stop().await;
    }

    #[test]
    fn start_outside_runtime_fails() {
        let scheduler = scheduler(1);
        assert!(matches!(scheduler.start(), Err(DispatchError::Internal(_))));
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_bounds_concurrency_and_completions_admit_one_more() {
        let scheduler = scheduler(4);
        scheduler.start().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..10 {
            let request = gated(1, &format!("w{i}"), &gate, &order);
            scheduler.submit(reporting(request, &tx)).unwrap();
        }

        wait_until(|| order.lock().unwrap().len() == 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_count(), 4);
        assert_eq!(scheduler.queued_len(), 6);
        assert_eq!(order.lock().unwrap().len(), 4);

        gate.add_permits(1);
        assert_eq!(next_report(&mut rx).await.outcome, WorkOutcome::Completed);
        wait_until(|| order.lock().unwrap().len() == 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_count(), 4);
        assert_eq!(scheduler.queued_len(), 5);

        gate.add_permits(9);
        for _ in 0..9 {
            assert_eq!(next_report(&mut rx).await.outcome, WorkOutcome::Completed);
        }
        wait_until(|| scheduler.active_count() == 0).await;

        let started = order.lock().unwrap().clone();
        let expected: Vec<String> = (0..10).map(|i| format!("w{i}")).collect();
        assert_eq!(started, expected, "equal priority starts in FIFO order");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn higher_priority_queued_work_starts_first() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        scheduler.submit(gated(0, "blocker", &gate, &order)).unwrap();
        wait_until(|| order.lock().unwrap().len() == 1).await;

        scheduler.submit(gated(1, "low", &gate, &order)).unwrap();
        scheduler.submit(gated(7, "high", &gate, &order)).unwrap();
        scheduler.submit(gated(4, "mid", &gate, &order)).unwrap();

        gate.add_permits(4);
        wait_until(|| order.lock().unwrap().len() == 4).await;
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "high", "mid", "low"]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn internal_work_bypasses_the_queue() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        scheduler.submit(gated(10, "blocker", &gate, &order)).unwrap();
        wait_until(|| order.lock().unwrap().len() == 1).await;

        scheduler.submit(gated(10, "payload", &gate, &order)).unwrap();
        scheduler
            .submit(gated(-5, "internal", &gate, &order).kind(WorkKind::Internal))
            .unwrap();

        gate.add_permits(3);
        wait_until(|| order.lock().unwrap().len() == 3).await;
        assert_eq!(*order.lock().unwrap(), vec!["blocker", "internal", "payload"]);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn failures_and_panics_are_reported_not_propagated() {
        let scheduler = scheduler(2);
        scheduler.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing = WorkRequest::new(0, |_c| async { Err(WorkError::failed("bad input")) });
        scheduler.submit(reporting(failing, &tx)).unwrap();
        let report = next_report(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::Failed(ref r) if r.contains("bad input")));

        let panicking = WorkRequest::new(0, |_c| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        scheduler.submit(reporting(panicking, &tx)).unwrap();
        let report = next_report(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::Failed(ref r) if r.contains("handler bug")));

        let ok = WorkRequest::new(0, |_c| async { Ok(()) });
        scheduler.submit(reporting(ok, &tx)).unwrap();
        assert_eq!(next_report(&mut rx).await.outcome, WorkOutcome::Completed);

        wait_until(|| scheduler.active_count() == 0).await;
        let counters = scheduler.collect_snapshot().counters;
        assert_eq!(counters.failed, 2);
        assert_eq!(counters.completed, 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn launch_panic_fails_only_that_item() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let broken = WorkRequest::new(0, |_c| {
            if true {
                panic!("cannot build future");
            }
            async { Ok(()) }
        });
        scheduler.submit(reporting(broken, &tx)).unwrap();
        let report = next_report(&mut rx).await;
        assert!(matches!(report.outcome, WorkOutcome::LaunchFailed(ref r) if r.contains("cannot build")));
        assert!(report.started_at.is_some());

        let ok = WorkRequest::new(0, |_c| async { Ok(()) });
        scheduler.submit(reporting(ok, &tx)).unwrap();
        assert_eq!(next_report(&mut rx).await.outcome, WorkOutcome::Completed);
        assert_eq!(scheduler.collect_snapshot().counters.launch_failures, 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn cancel_queued_and_executing_work() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let running = WorkRequest::new(0, |cancel| async move {
            cancel.cancelled().await;
            Err(WorkError::Cancelled)
        })
        .caller("running");
        let running_id = scheduler.submit(reporting(running, &tx)).unwrap();
        wait_until(|| scheduler.active_count() == 1).await;

        let queued = WorkRequest::new(0, |_c| async { Ok(()) }).caller("queued");
        let queued_id = scheduler.submit(reporting(queued, &tx)).unwrap();

        scheduler.cancel(queued_id).unwrap();
        let report = next_report(&mut rx).await;
        assert_eq!(report.caller, "queued");
        assert_eq!(report.outcome, WorkOutcome::Cancelled);
        assert!(report.started_at.is_none());

        scheduler.cancel(running_id).unwrap();
        let report = next_report(&mut rx).await;
        assert_eq!(report.caller, "running");
        assert_eq!(report.outcome, WorkOutcome::Cancelled);

        assert!(matches!(
            scheduler.cancel(queued_id),
            Err(DispatchError::UnknownWork(id)) if id == queued_id
        ));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_queued_and_signals_executing() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let running = WorkRequest::new(0, |cancel| async move {
            cancel.cancelled().await;
            Err(WorkError::Cancelled)
        })
        .caller("running");
        scheduler.submit(reporting(running, &tx)).unwrap();
        wait_until(|| scheduler.active_count() == 1).await;

        for i in 0..3 {
            let queued = WorkRequest::new(0, |_c| async { Ok(()) }).caller(format!("q{i}"));
            scheduler.submit(reporting(queued, &tx)).unwrap();
        }

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        let mut reports = Vec::new();
        for _ in 0..4 {
            reports.push(next_report(&mut rx).await);
        }
        assert!(reports.iter().all(|r| r.outcome == WorkOutcome::Cancelled));
        assert_eq!(
            reports.iter().filter(|r| r.started_at.is_none()).count(),
            3,
            "queued items never started"
        );
        wait_until(|| scheduler.active_count() == 0).await;
        assert_eq!(scheduler.queued_len(), 0);
    }

    #[tokio::test]
    async fn long_running_work_runs_on_its_own_thread() {
        let scheduler = scheduler(1);
        scheduler.start().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let thread_name = Arc::new(Mutex::new(None));
        let seen = thread_name.clone();

        let request = WorkRequest::new(0, move |_c| async move {
            *seen.lock().unwrap() = std::thread::current().name().map(str::to_string);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })
        .long_running(true);
        scheduler.submit(reporting(request, &tx)).unwrap();

        assert_eq!(next_report(&mut rx).await.outcome, WorkOutcome::Completed);
        let name = thread_name.lock().unwrap().clone().unwrap_or_default();
        assert!(name.starts_with("switchyard-work-"), "ran on {name:?}");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn observers_see_lifecycle_events() {
        let (observer, mut events) = ChannelObserver::new();
        let scheduler = Scheduler::builder(&SwitchyardConfig::default())
            .capacity(1)
            .idle_tick(Duration::from_millis(10))
            .without_statistics()
            .cpu_probe(NullProbe)
            .observer(Arc::new(observer))
            .build()
            .unwrap();
        scheduler.start().unwrap();

        let id = scheduler
            .submit(WorkRequest::new(2, |_c| async { Ok(()) }).caller("obs"))
            .unwrap();

        // Queued and Launched may be observed in either order; the final
        // report always comes last.
        let mut kinds = Vec::new();
        while !kinds.contains(&"completed") {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            match event {
                LifecycleEvent::Queued { id: e, .. } if e == id => kinds.push("queued"),
                LifecycleEvent::Launched { id: e, .. } if e == id => kinds.push("launched"),
                LifecycleEvent::Completed(report) if report.id == id => kinds.push("completed"),
                _ => {}
            }
        }
        assert_eq!(kinds.len(), 3);
        assert!(kinds.contains(&"queued"));
        assert!(kinds.contains(&"launched"));
        assert_eq!(kinds.last(), Some(&"completed"));
        scheduler.stop().await;
    }

    struct CountingProcess {
        runs: Arc<AtomicUsize>,
        last_capacity: Arc<AtomicUsize>,
    }

    impl HousekeepingProcess for CountingProcess {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn run(&self, snapshot: &SchedulerSnapshot) -> Result<(), DispatchError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.last_capacity.store(snapshot.capacity, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn housekeeping_processes_run_periodically() {
        let runs = Arc::new(AtomicUsize::new(0));
        let last_capacity = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(3);
        scheduler
            .register_process(Arc::new(CountingProcess {
                runs: runs.clone(),
                last_capacity: last_capacity.clone(),
            }))
            .unwrap();
        assert_eq!(scheduler.process_names(), vec!["counting".to_string()]);

        scheduler.start().unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) >= 2).await;
        assert_eq!(last_capacity.load(Ordering::SeqCst), 3);

        assert!(scheduler.unregister_process("counting"));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn snapshots_are_published_to_subscribers() {
        let scheduler = scheduler(2);
        let mut rx = scheduler.subscribe();
        assert_eq!(scheduler.snapshot().state, SchedulerState::Stopped);

        scheduler.start().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == SchedulerState::Running),
        )
        .await
        .expect("running snapshot in time")
        .expect("sender alive");

        scheduler.stop().await;
        assert_eq!(scheduler.snapshot().state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn set_capacity_never_drops_below_active() {
        let scheduler = scheduler(2);
        scheduler.start().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.submit(gated(0, "a", &gate, &order)).unwrap();
        scheduler.submit(gated(0, "b", &gate, &order)).unwrap();
        wait_until(|| scheduler.active_count() == 2).await;

        assert_eq!(scheduler.set_capacity(1), 2);
        gate.add_permits(2);
        wait_until(|| scheduler.active_count() == 0).await;
        assert_eq!(scheduler.set_capacity(1), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn cancel_between_dequeue_and_launch_is_applied() {
        let scheduler = scheduler(1);
        let shared = scheduler.shared().clone();
        let (tx, rx) = oneshot::channel();
        let request = WorkRequest::new(0, |cancel| async move {
            cancel.cancelled().await;
            Err(WorkError::Cancelled)
        })
        .on_complete(move |r| {
            let _ = tx.send(r.outcome.clone());
        });
        let mut item = WorkItem::from_request(request, None);
        assert!(item.mark_queued());
        let id = item.id();

        // As the dequeue pass leaves it: out of the queue, not yet active.
        shared.launching.insert(id, false);
        scheduler.cancel(id).unwrap();

        assert!(shared.availability.increment(0));
        shared.launch(item);

        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WorkOutcome::Cancelled);
        assert!(shared.launching.is_empty());
        assert_eq!(shared.availability.active(), 0);
    }

    #[test]
    fn builder_keeps_durations_exact() {
        let huge = Duration::from_secs(u64::MAX);
        let scheduler = Scheduler::builder(&SwitchyardConfig::default())
            .capacity(1)
            .kill_grace(huge)
            .idle_tick(Duration::from_micros(1500))
            .without_statistics()
            .cpu_probe(NullProbe)
            .build()
            .unwrap();
        assert_eq!(scheduler.shared().settings.kill_grace, huge);
        assert_eq!(scheduler.shared().settings.idle_tick, Duration::from_micros(1500));

        let zero_tick = Scheduler::builder(&SwitchyardConfig::default())
            .idle_tick(Duration::ZERO)
            .cpu_probe(NullProbe)
            .build();
        assert!(matches!(zero_tick, Err(DispatchError::Core(_))));
    }
}
