#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    use taskq::{
        BlockingHandler, Handler, HandlerError, HandlerRegistry, JsonCodec, SqliteStore, Store,
        StoreOptions, TaskOutcome, TaskQueue, TaskQueueOptions, Worker, WorkerOptions,
    };

    struct Greet;

    #[async_trait]
    impl Handler for Greet {
        async fn call(&self, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            let name = args[0].as_str().unwrap_or_default();
            Ok(json!(format!("Greetings, {name}!")))
        }
    }

    struct SleepFor(Duration);

    #[async_trait]
    impl Handler for SleepFor {
        async fn call(&self, _args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(Value::Null)
        }
    }

    struct DivideByZero;

    #[async_trait]
    impl Handler for DivideByZero {
        async fn call(&self, _args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            Err(HandlerError::with_traceback(
                "division by zero",
                "at DivideByZero::call (src/tests/main.rs)",
            ))
        }
    }

    /// Tracks how many calls are simultaneously inside `call`, for the
    /// bounded-concurrency property test.
    struct ConcurrencyProbe {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold: Duration,
    }

    #[async_trait]
    impl Handler for ConcurrencyProbe {
        async fn call(&self, _args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    /// Records which worker id dispatched a task, for the cross-poller
    /// atomicity scenario.
    struct RecordDispatch {
        worker_id: usize,
        seen: Arc<std::sync::Mutex<Vec<(String, usize)>>>,
    }

    #[async_trait]
    impl Handler for RecordDispatch {
        async fn call(&self, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            let task_tag = args[0].as_str().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push((task_tag, self.worker_id));
            Ok(Value::Null)
        }
    }

    struct PanicsImmediately;

    #[async_trait]
    impl Handler for PanicsImmediately {
        async fn call(&self, _args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            panic!("handler exploded");
        }
    }

    /// A CPU-bound handler that must be offloaded so it never blocks the
    /// polling loop's scheduling context.
    struct BlockingSquare;

    impl BlockingHandler for BlockingSquare {
        fn call(&self, args: Value, _kwargs: Value) -> Result<Value, HandlerError> {
            std::thread::sleep(Duration::from_millis(50));
            let n = args[0].as_i64().unwrap_or_default();
            Ok(json!(n * n))
        }
    }

    async fn memory_queue() -> (TaskQueue, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_memory(StoreOptions::default()));
        let queue = TaskQueue::connect(store.clone(), Arc::new(JsonCodec), TaskQueueOptions::default())
            .await
            .unwrap();
        (queue, store)
    }

    // S1: simple success.
    #[tokio::test]
    async fn simple_success() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register("greet", Arc::new(Greet));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions {
                    max_concurrency: 5,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let id = queue
            .enqueue("greet", json!(["World"]), json!({}), None, None)
            .await
            .unwrap();

        let result = queue
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("task should complete within 2s");

        assert_eq!(result.status, TaskOutcome::Success);
        assert_eq!(
            queue.deserialize_result(&result).unwrap(),
            json!("Greetings, World!")
        );

        worker.stop().await.unwrap();
    }

    // S2: delayed eligibility.
    #[tokio::test]
    async fn delayed_eligibility() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register("greet", Arc::new(Greet));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions {
                    max_concurrency: 5,
                    poll_interval: Duration::from_millis(500),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let eta = Utc::now() + chrono::Duration::seconds(2);
        let id = queue
            .enqueue("greet", json!(["later"]), json!({}), Some(eta), None)
            .await
            .unwrap();

        // Not yet eligible: a zero-timeout probe must not observe it.
        let probe = queue.get_result(&id, Some(Duration::ZERO)).await.unwrap();
        assert!(probe.is_none());

        let result = queue
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("task should complete once eligible");
        assert_eq!(result.status, TaskOutcome::Success);

        worker.stop().await.unwrap();
    }

    // S3: bounded concurrency, and property 2 (peak in-flight == bound).
    #[tokio::test]
    async fn bounded_concurrency() {
        let (queue, store) = memory_queue().await;

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            Arc::new(ConcurrencyProbe {
                current: current.clone(),
                peak: peak.clone(),
                hold: Duration::from_millis(500),
            }),
        );
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions {
                    max_concurrency: 2,
                    poll_interval: Duration::from_millis(50),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                queue
                    .enqueue("slow", Value::Null, json!({}), None, None)
                    .await
                    .unwrap(),
            );
        }

        let start = tokio::time::Instant::now();
        worker.start().unwrap();
        for id in &ids {
            queue
                .get_result(id, Some(Duration::from_secs(3)))
                .await
                .unwrap()
                .expect("every task should eventually complete");
        }
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(1400),
            "five tasks at concurrency 2 should take three serial waves, took {elapsed:?}"
        );
        assert!(elapsed < Duration::from_secs(3), "took too long: {elapsed:?}");
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        worker.stop().await.unwrap();
        assert_eq!(worker.available_permits(), 2);
    }

    // S4: captured failure. The worker survives a handler error.
    #[tokio::test]
    async fn captured_failure_then_recovery() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register("boom", Arc::new(DivideByZero));
        registry.register("greet", Arc::new(Greet));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions::default(),
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let failing = queue
            .enqueue("boom", Value::Null, json!({}), None, None)
            .await
            .unwrap();
        let result = queue
            .get_result(&failing, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("failure should still be a terminal result");

        assert_eq!(result.status, TaskOutcome::Failed);
        assert!(result.error.unwrap().contains("division by zero"));
        assert!(result.traceback.is_some());

        let ok = queue
            .enqueue("greet", json!(["again"]), json!({}), None, None)
            .await
            .unwrap();
        let ok_result = queue
            .get_result(&ok, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("worker should keep processing after a handler failure");
        assert_eq!(ok_result.status, TaskOutcome::Success);

        worker.stop().await.unwrap();
    }

    // S5: graceful drain. stop() only returns once in-flight work is terminal.
    #[tokio::test]
    async fn graceful_drain() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            Arc::new(SleepFor(Duration::from_millis(1000))),
        );
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions {
                    max_concurrency: 3,
                    poll_interval: Duration::from_millis(50),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                queue
                    .enqueue("slow", Value::Null, json!({}), None, None)
                    .await
                    .unwrap(),
            );
        }

        worker.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stop_started = tokio::time::Instant::now();
        worker.stop().await.unwrap();
        let stop_elapsed = stop_started.elapsed();

        assert!(
            stop_elapsed >= Duration::from_millis(700),
            "stop() should block until the in-flight sleep finishes, took {stop_elapsed:?}"
        );

        for id in &ids {
            let result = queue.get_result(id, Some(Duration::ZERO)).await.unwrap();
            assert_eq!(result.unwrap().status, TaskOutcome::Success);
        }
    }

    // S6: cross-poller atomicity. Two Workers sharing one Store never
    // double-dispatch a row.
    #[tokio::test]
    async fn cross_poller_atomicity() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("cross_poller.sqlite");
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::open_file(&file, StoreOptions::default()));
        let queue = TaskQueue::connect(store.clone(), Arc::new(JsonCodec), TaskQueueOptions::default())
            .await
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut registry_a = HandlerRegistry::new();
        registry_a.register(
            "record",
            Arc::new(RecordDispatch {
                worker_id: 1,
                seen: seen.clone(),
            }),
        );
        let worker_a = Arc::new(
            Worker::new(
                store.clone(),
                Arc::new(JsonCodec),
                Arc::new(registry_a),
                WorkerOptions {
                    max_concurrency: 4,
                    batch_size: 10,
                    poll_interval: Duration::from_millis(20),
                },
            )
            .unwrap(),
        );

        let mut registry_b = HandlerRegistry::new();
        registry_b.register(
            "record",
            Arc::new(RecordDispatch {
                worker_id: 2,
                seen: seen.clone(),
            }),
        );
        let worker_b = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry_b),
                WorkerOptions {
                    max_concurrency: 4,
                    batch_size: 10,
                    poll_interval: Duration::from_millis(20),
                },
            )
            .unwrap(),
        );

        let mut ids = Vec::new();
        for i in 0..100 {
            ids.push(
                queue
                    .enqueue("record", json!([format!("task-{i}")]), json!({}), None, None)
                    .await
                    .unwrap(),
            );
        }

        worker_a.start().unwrap();
        worker_b.start().unwrap();

        for id in &ids {
            queue
                .get_result(id, Some(Duration::from_secs(5)))
                .await
                .unwrap()
                .expect("every task should complete exactly once");
        }

        worker_a.stop().await.unwrap();
        worker_b.stop().await.unwrap();

        let records = seen.lock().unwrap();
        assert_eq!(records.len(), 100);
        let distinct: std::collections::HashSet<_> = records.iter().map(|(tag, _)| tag).collect();
        assert_eq!(distinct.len(), 100);
    }

    // Property 8/9: round-trip and result immutability.
    #[tokio::test]
    async fn result_is_immutable_once_terminal() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register("greet", Arc::new(Greet));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions::default(),
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let id = queue
            .enqueue("greet", json!(["Ada"]), json!({}), None, None)
            .await
            .unwrap();
        let first = queue
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        let second = queue.get_result(&id, Some(Duration::ZERO)).await.unwrap().unwrap();

        assert_eq!(first, second);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_ids() {
        let store = SqliteStore::open_memory(StoreOptions::default());
        store.connect().await.unwrap();
        let now = Utc::now();
        store
            .enqueue(&"dup".to_string(), vec![1, 2, 3], now)
            .await
            .unwrap();
        let err = store.enqueue(&"dup".to_string(), vec![4, 5, 6], now).await;
        assert!(matches!(
            err,
            Err(taskq::StoreError::Duplicate(ref id)) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn worker_rejects_nonpositive_concurrency() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_memory(StoreOptions::default()));
        let err = Worker::new(
            store,
            Arc::new(JsonCodec),
            Arc::new(HandlerRegistry::new()),
            WorkerOptions {
                max_concurrency: 0,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, taskq::ValidationError::NonPositiveConcurrency));
    }

    // A panicking handler must still produce a `failed` row, not bring down
    // the worker's polling loop or leak the dispatch's permit.
    #[tokio::test]
    async fn panicking_handler_is_recorded_as_failed() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register("boom", Arc::new(PanicsImmediately));
        registry.register("greet", Arc::new(Greet));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions::default(),
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let id = queue
            .enqueue("boom", Value::Null, json!({}), None, None)
            .await
            .unwrap();
        let result = queue
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("a panicking handler still yields a terminal result");
        assert_eq!(result.status, TaskOutcome::Failed);
        assert!(result.error.unwrap().contains("handler exploded"));

        // The worker is still alive and its permit wasn't leaked.
        let ok = queue
            .enqueue("greet", json!(["still alive"]), json!({}), None, None)
            .await
            .unwrap();
        let ok_result = queue
            .get_result(&ok, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("worker should keep processing after a handler panic");
        assert_eq!(ok_result.status, TaskOutcome::Success);

        worker.stop().await.unwrap();
        assert_eq!(worker.available_permits(), 1);
    }

    // Synchronous handlers registered via `register_blocking` run on a
    // dedicated pool and don't block the polling loop.
    #[tokio::test]
    async fn blocking_handler_runs_to_completion() {
        let (queue, store) = memory_queue().await;

        let mut registry = HandlerRegistry::new();
        registry.register_blocking("square", Arc::new(BlockingSquare));
        let worker = Arc::new(
            Worker::new(
                store,
                Arc::new(JsonCodec),
                Arc::new(registry),
                WorkerOptions {
                    max_concurrency: 4,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        worker.start().unwrap();

        let id = queue
            .enqueue("square", json!([7]), json!({}), None, None)
            .await
            .unwrap();
        let result = queue
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("blocking handler should complete");

        assert_eq!(result.status, TaskOutcome::Success);
        assert_eq!(queue.deserialize_result(&result).unwrap(), json!(49));

        worker.stop().await.unwrap();
    }

    // Open Question decision: stranded `in_progress` rows are swept back to
    // `pending` on `connect()` only when a `lease_horizon` is configured.
    #[tokio::test]
    async fn lease_recovery_resets_stranded_in_progress_rows() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("lease.sqlite");

        let options = StoreOptions {
            lease_horizon: Some(Duration::from_millis(50)),
            ..StoreOptions::default()
        };
        let store = SqliteStore::open_file(&file, options.clone());
        store.connect().await.unwrap();

        let stranded = "stranded-task".to_string();
        store
            .enqueue(&stranded, vec![1, 2, 3], Utc::now())
            .await
            .unwrap();
        let reserved = store.reserve(1, Utc::now()).await.unwrap();
        assert_eq!(reserved.len(), 1, "row should be claimed as in_progress");

        // Simulate the owning worker crashing: nobody ever calls mark_*.
        // Reconnecting after the lease horizon elapses should sweep it back
        // to pending, as if no worker had ever claimed it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.close().await.unwrap();

        let recovered = SqliteStore::open_file(&file, options);
        recovered.connect().await.unwrap();

        let re_reserved = recovered.reserve(1, Utc::now()).await.unwrap();
        assert_eq!(
            re_reserved.len(),
            1,
            "stranded row should have been swept back to pending and be reservable again"
        );
        assert_eq!(re_reserved[0].id, stranded);
    }
}
