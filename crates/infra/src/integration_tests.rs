//! Integration tests for the command pipeline and the job lifecycle.
//!
//! Tests: Command → interceptor chain → CommandContext → entity flush → Store
//!
//! Verifies:
//! - Retryable commit failures re-run the command with a fresh context
//! - Concurrent writers never lose updates (guarded writes)
//! - Unchanged entities are never written
//! - Deferred value fields load lazily and write back only when changed
//! - The ambient context is released on every exit path, panics included
//! - Jobs are acquired, failed, rescheduled with backoff and completed
//! - Exhausted jobs raise incidents and resolve when retries are restored

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use flowforge_core::{
        DbEntity, EngineError, EngineResult, EntityId, EntityKey, EntityType, ManualClock,
    };

    use crate::command::context::{self, CommandContext, CommandContextListener, TransactionState};
    use crate::command::{FnCommand, FnSessionFactory, Session};
    use crate::config::{EngineConfig, JobExecutorConfig};
    use crate::engine::{ProcessEngine, ProcessEngineBuilder};
    use crate::jobs::{BackoffPolicy, JobRunOutcome, NewJob};
    use crate::persistence::{InMemoryStore, Store, StoreError, StoreTransaction};

    struct Fixture {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        engine: ProcessEngine,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig::default().with_job_executor(
            JobExecutorConfig::default()
                .with_lock_owner("node-A")
                .with_lock_duration(Duration::from_secs(30))
                .with_retry_backoff(BackoffPolicy::fixed(Duration::from_secs(10))),
        )
    }

    fn setup_with(
        config: EngineConfig,
        customize: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
    ) -> Fixture {
        flowforge_observability::init_for_tests();
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let builder = ProcessEngine::builder(Arc::new(store.clone()))
            .config(config)
            .clock(clock.clone());
        let engine = customize(builder).build().unwrap();
        Fixture {
            store,
            clock,
            engine,
        }
    }

    fn setup() -> Fixture {
        setup_with(config(), |builder| builder)
    }

    fn serialization_failure() -> StoreError {
        StoreError::database(Some("40001"), "could not serialize access due to concurrent update")
    }

    fn create_counter(engine: &ProcessEngine) -> EntityId {
        engine
            .execute(FnCommand::new("create counter", |ctx| {
                let counter = ctx.byte_array_manager().create("counter", b"0".to_vec())?;
                let id = counter.borrow().id().cloned();
                id.ok_or_else(|| EngineError::command("counter has no id"))
            }))
            .unwrap()
    }

    fn bump(ctx: &CommandContext, id: &EntityId) -> EngineResult<()> {
        let counter = ctx
            .byte_array_manager()
            .find(id)?
            .ok_or_else(|| EngineError::not_found(format!("counter {id}")))?;
        let current: u32 = String::from_utf8_lossy(counter.borrow().bytes())
            .parse()
            .map_err(|_| EngineError::command("counter is not a number"))?;
        counter
            .borrow_mut()
            .set_bytes((current + 1).to_string().into_bytes());
        Ok(())
    }

    fn read_counter(engine: &ProcessEngine, id: &EntityId) -> String {
        engine
            .execute(FnCommand::new("read counter", |ctx| {
                let counter = ctx.byte_array_manager().find(id)?;
                Ok(counter.map(|c| String::from_utf8_lossy(c.borrow().bytes()).into_owned()))
            }))
            .unwrap()
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Command pipeline
    // ---------------------------------------------------------------------

    #[test]
    fn retryable_commit_failure_reruns_the_command() {
        let fx = setup();
        fx.store.fail_next_commits(1, serialization_failure());

        let attempts = Cell::new(0);
        fx.engine
            .execute(FnCommand::new("create payload", |ctx| {
                attempts.set(attempts.get() + 1);
                ctx.byte_array_manager().create("payload", b"hello".to_vec())?;
                Ok(())
            }))
            .unwrap();

        assert_eq!(attempts.get(), 2);
        // The first attempt's insert was discarded with its transaction.
        assert_eq!(fx.store.count(EntityType::ByteArray), 1);
        assert_eq!(fx.store.stats().rollbacks, 1);
    }

    #[test]
    fn exhausted_retries_become_a_fatal_transaction_error() {
        let fx = setup_with(config().with_command_retries(2), |builder| builder);
        fx.store.fail_next_commits(3, serialization_failure());

        let attempts = Cell::new(0);
        let err = fx
            .engine
            .execute(FnCommand::new("always conflicting", |ctx| {
                attempts.set(attempts.get() + 1);
                ctx.byte_array_manager().create("payload", Vec::new())?;
                Ok(())
            }))
            .unwrap_err();

        assert_eq!(attempts.get(), 3);
        match err {
            EngineError::FatalTransaction(message) => {
                assert!(message.contains("retries exhausted after 3 attempts"), "{message}")
            }
            other => panic!("expected fatal transaction error, got {other:?}"),
        }
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    #[test]
    fn non_retryable_commit_failure_is_fatal_without_retry() {
        let fx = setup();
        fx.store
            .fail_next_commits(1, StoreError::database(Some("53100"), "disk full"));

        let attempts = Cell::new(0);
        let err = fx
            .engine
            .execute(FnCommand::new("create payload", |ctx| {
                attempts.set(attempts.get() + 1);
                ctx.byte_array_manager().create("payload", Vec::new())?;
                Ok(())
            }))
            .unwrap_err();

        assert_eq!(attempts.get(), 1);
        assert!(matches!(err, EngineError::FatalTransaction(_)), "{err:?}");
    }

    #[test]
    fn stale_write_is_rejected_with_optimistic_locking() {
        let fx = setup();
        let id = create_counter(&fx.engine);
        let other = fx.engine.clone();

        let err = fx
            .engine
            .execute(FnCommand::new("bump", |ctx| {
                bump(ctx, &id)?;
                // A second node commits its own bump while ours is still in flight.
                let remote_id = id.clone();
                let remote = other.clone();
                std::thread::spawn(move || {
                    remote.execute(FnCommand::new("remote bump", |ctx| bump(ctx, &remote_id)))
                })
                .join()
                .unwrap()
            }))
            .unwrap_err();

        assert!(err.is_optimistic_locking(), "{err:?}");
        assert_eq!(read_counter(&fx.engine, &id), "1");
    }

    #[test]
    fn optimistic_locking_retry_loses_no_updates() {
        let fx = setup();
        let id = create_counter(&fx.engine);
        let other = fx.engine.clone();

        let attempts = Cell::new(0);
        fx.engine
            .execute(
                FnCommand::new("bump", |ctx| {
                    attempts.set(attempts.get() + 1);
                    bump(ctx, &id)?;
                    if attempts.get() == 1 {
                        let remote_id = id.clone();
                        let remote = other.clone();
                        std::thread::spawn(move || {
                            remote.execute(FnCommand::new("remote bump", |ctx| {
                                bump(ctx, &remote_id)
                            }))
                        })
                        .join()
                        .unwrap()?;
                    }
                    Ok(())
                })
                .retrying_on_optimistic_locking(),
            )
            .unwrap();

        assert_eq!(attempts.get(), 2);
        assert_eq!(read_counter(&fx.engine, &id), "2");
    }

    #[test]
    fn flush_skips_unchanged_entities() {
        let fx = setup();
        let id = create_counter(&fx.engine);
        let before = fx.store.stats();

        read_counter(&fx.engine, &id);
        assert_eq!(fx.store.stats().updates, before.updates);

        fx.engine
            .execute(FnCommand::new("bump", |ctx| bump(ctx, &id)))
            .unwrap();
        assert_eq!(fx.store.stats().updates, before.updates + 1);
    }

    #[test]
    fn entities_are_cached_once_per_context() {
        let fx = setup();
        let id = create_counter(&fx.engine);

        let same = fx
            .engine
            .execute(FnCommand::new("lookup twice", |ctx| {
                let first = ctx.byte_array_manager().find(&id)?;
                let second = ctx.byte_array_manager().find(&id)?;
                Ok(match (first, second) {
                    (Some(a), Some(b)) => Rc::ptr_eq(&a, &b),
                    _ => false,
                })
            }))
            .unwrap();
        assert!(same);
    }

    #[test]
    fn nested_commands_join_the_callers_transaction() {
        let fx = setup();
        let commits = fx.store.stats().commits;

        let seen_by_nested = fx
            .engine
            .execute(FnCommand::new("outer", |ctx| {
                let created = ctx.byte_array_manager().create("outer", b"x".to_vec())?;
                let id = created.borrow().id().cloned();
                ctx.execute(FnCommand::new("inner", move |inner| {
                    let outer_ctx = context::current();
                    let same_context = outer_ctx.is_some_and(|c| std::ptr::eq(&*c, inner));
                    let found = match &id {
                        Some(id) => inner.byte_array_manager().find(id)?,
                        None => None,
                    };
                    Ok(same_context && found.is_some_and(|f| Rc::ptr_eq(&f, &created)))
                }))
            }))
            .unwrap();

        assert!(seen_by_nested);
        assert_eq!(fx.store.stats().commits, commits + 1);
        assert_eq!(fx.store.count(EntityType::ByteArray), 1);
    }

    #[test]
    fn failed_nested_command_rolls_back_the_whole_unit() {
        let fx = setup();

        let err = fx
            .engine
            .execute(FnCommand::new("outer", |ctx| {
                ctx.byte_array_manager().create("outer", b"x".to_vec())?;
                ctx.execute(FnCommand::new("inner", |_inner| -> EngineResult<()> {
                    Err(EngineError::command("inner failed"))
                }))
            }))
            .unwrap_err();

        assert_eq!(err, EngineError::command("inner failed"));
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    #[test]
    fn context_is_required_outside_commands() {
        let err = context::require_current("read variable").unwrap_err();
        assert!(matches!(err, EngineError::NoActiveContext(_)));
        assert!(context::current().is_none());
    }

    #[test]
    fn context_is_popped_when_a_command_panics() {
        let fx = setup();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            fx.engine
                .execute(FnCommand::new("explode", |ctx| -> EngineResult<()> {
                    ctx.byte_array_manager().create("doomed", Vec::new())?;
                    panic!("handler exploded")
                }))
        }));

        assert!(result.is_err());
        assert!(context::current().is_none());
        assert_eq!(fx.engine.services().in_flight().current(), 0);
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);

        // The engine stays usable on this thread.
        create_counter(&fx.engine);
        assert_eq!(fx.store.count(EntityType::ByteArray), 1);
    }

    #[derive(Default)]
    struct Recorder {
        closed: Cell<u32>,
        failed: Cell<u32>,
        fail_on_close: bool,
    }

    impl CommandContextListener for Recorder {
        fn on_close(&self, _ctx: &CommandContext) -> EngineResult<()> {
            self.closed.set(self.closed.get() + 1);
            if self.fail_on_close {
                return Err(EngineError::command("listener rejected close"));
            }
            Ok(())
        }

        fn on_failure(&self, _ctx: &CommandContext, _error: &EngineError) {
            self.failed.set(self.failed.get() + 1);
        }
    }

    /// Registers another listener while the context is closing.
    struct Chained {
        next: Rc<Recorder>,
    }

    impl CommandContextListener for Chained {
        fn on_close(&self, ctx: &CommandContext) -> EngineResult<()> {
            ctx.add_listener(self.next.clone());
            Ok(())
        }
    }

    #[test]
    fn close_listeners_may_register_further_listeners() {
        let fx = setup();
        let late = Rc::new(Recorder::default());

        fx.engine
            .execute(FnCommand::new("chained", |ctx| {
                ctx.add_listener(Rc::new(Chained { next: late.clone() }));
                Ok(())
            }))
            .unwrap();

        assert_eq!(late.closed.get(), 1);
        assert_eq!(late.failed.get(), 0);
    }

    #[test]
    fn failure_listeners_fire_exactly_once() {
        let fx = setup_with(config().with_command_retries(0), |builder| builder);

        let recorder = Rc::new(Recorder::default());
        let err = fx
            .engine
            .execute(FnCommand::new("failing", |ctx| -> EngineResult<()> {
                ctx.add_listener(recorder.clone());
                Err(EngineError::command("business rule violated"))
            }))
            .unwrap_err();
        assert_eq!(err, EngineError::command("business rule violated"));
        assert_eq!(recorder.closed.get(), 0);
        assert_eq!(recorder.failed.get(), 1);

        let rejecting = Rc::new(Recorder {
            fail_on_close: true,
            ..Recorder::default()
        });
        let err = fx
            .engine
            .execute(FnCommand::new("rejected on close", |ctx| {
                ctx.add_listener(rejecting.clone());
                ctx.byte_array_manager().create("never stored", Vec::new())?;
                Ok(())
            }))
            .unwrap_err();
        assert_eq!(err, EngineError::command("listener rejected close"));
        assert_eq!(rejecting.closed.get(), 1);
        assert_eq!(rejecting.failed.get(), 1);
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    #[test]
    fn commit_failures_reach_transaction_listeners_only() {
        let fx = setup();
        fx.store
            .fail_next_commits(1, StoreError::database(Some("23505"), "duplicate key"));

        let recorder = Rc::new(Recorder::default());
        let committed = Rc::new(Cell::new(0));
        let rolled_back = Rc::new(Cell::new(0));
        let err = fx
            .engine
            .execute(FnCommand::new("doomed commit", |ctx| {
                ctx.add_listener(recorder.clone());
                let committed = committed.clone();
                ctx.add_transaction_listener(TransactionState::Committed, move || {
                    committed.set(committed.get() + 1)
                });
                let rolled_back = rolled_back.clone();
                ctx.add_transaction_listener(TransactionState::RolledBack, move || {
                    rolled_back.set(rolled_back.get() + 1)
                });
                ctx.byte_array_manager().create("payload", Vec::new())?;
                Ok(())
            }))
            .unwrap_err();

        assert!(matches!(err, EngineError::FatalTransaction(_)), "{err:?}");
        // The context closed cleanly before the store rejected the commit.
        assert_eq!(recorder.closed.get(), 1);
        assert_eq!(recorder.failed.get(), 0);
        assert_eq!(committed.get(), 0);
        assert_eq!(rolled_back.get(), 1);
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    // ---------------------------------------------------------------------
    // Deferred value fields
    // ---------------------------------------------------------------------

    fn create_variable(fx: &Fixture, value: serde_json::Value) -> EntityId {
        fx.engine
            .execute(FnCommand::new("create variable", |ctx| {
                let variable = ctx
                    .variable_manager()
                    .create("order-1", "payload", value.clone())?;
                let id = variable.borrow().id().cloned();
                id.ok_or_else(|| EngineError::command("variable has no id"))
            }))
            .unwrap()
    }

    fn read_variable(fx: &Fixture) -> Option<serde_json::Value> {
        fx.engine
            .execute(FnCommand::new("read variable", |ctx| {
                match ctx.variable_manager().find_by_name("order-1", "payload")? {
                    Some(variable) => variable.borrow().value.get(),
                    None => Ok(None),
                }
            }))
            .unwrap()
    }

    #[test]
    fn variables_round_trip_through_deferred_fields() {
        let fx = setup();
        create_variable(&fx, json!({"amount": 120, "currency": "EUR"}));

        assert_eq!(fx.store.count(EntityType::VariableInstance), 1);
        assert_eq!(fx.store.count(EntityType::ByteArray), 1);
        assert_eq!(
            read_variable(&fx),
            Some(json!({"amount": 120, "currency": "EUR"}))
        );
    }

    #[test]
    fn mutated_values_are_written_back_only_when_bytes_change() {
        let fx = setup();
        create_variable(&fx, json!({"count": 1}));
        let before = fx.store.stats().updates;

        let update = |f: fn(&mut serde_json::Value)| {
            fx.engine
                .execute(FnCommand::new("update variable", |ctx| {
                    let variable = ctx
                        .variable_manager()
                        .find_by_name("order-1", "payload")?
                        .ok_or_else(|| EngineError::not_found("variable payload"))?;
                    let value = variable.borrow().value.clone();
                    value.update(f)
                }))
                .unwrap()
        };

        update(|v| v["count"] = json!(2));
        assert_eq!(fx.store.stats().updates, before + 1);
        assert_eq!(read_variable(&fx), Some(json!({"count": 2})));

        // Touched but identical: nothing to write.
        update(|v| v["count"] = json!(2));
        assert_eq!(fx.store.stats().updates, before + 1);
    }

    #[test]
    fn values_cannot_be_read_outside_a_command() {
        let fx = setup();
        let id = create_variable(&fx, json!("pending"));

        let variable = fx
            .engine
            .execute(FnCommand::new("load variable", |ctx| {
                ctx.variable_manager()
                    .find_by_id(&id)?
                    .ok_or_else(|| EngineError::not_found("variable"))
            }))
            .unwrap();

        let err = variable.borrow().value.get().unwrap_err();
        assert!(matches!(err, EngineError::NoActiveContext(_)), "{err:?}");
    }

    #[test]
    fn dangling_value_reference_is_reported() {
        let fx = setup();
        create_variable(&fx, json!([1, 2, 3]));

        fx.engine
            .execute(FnCommand::new("drop value row", |ctx| {
                let variable = ctx
                    .variable_manager()
                    .find_by_name("order-1", "payload")?
                    .ok_or_else(|| EngineError::not_found("variable payload"))?;
                let value_id = variable.borrow().value.id();
                match value_id {
                    Some(id) => ctx.byte_array_manager().delete(&id).map(|_| ()),
                    None => Ok(()),
                }
            }))
            .unwrap();

        let err = fx
            .engine
            .execute(FnCommand::new("read variable", |ctx| {
                match ctx.variable_manager().find_by_name("order-1", "payload")? {
                    Some(variable) => variable.borrow().value.get(),
                    None => Ok(None),
                }
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingReference(_)), "{err:?}");
    }

    #[test]
    fn deleting_a_variable_removes_its_value_row() {
        let fx = setup();
        create_variable(&fx, json!(true));

        fx.engine
            .execute(FnCommand::new("delete variable", |ctx| {
                let variables = ctx.variable_manager();
                if let Some(variable) = variables.find_by_name("order-1", "payload")? {
                    variables.delete(&variable)?;
                }
                Ok(())
            }))
            .unwrap();

        assert_eq!(fx.store.count(EntityType::VariableInstance), 0);
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    struct Outbox {
        messages: Vec<String>,
        closed: Arc<AtomicUsize>,
    }

    impl Session for Outbox {
        fn flush(&mut self, ctx: &CommandContext) -> EngineResult<()> {
            if self.messages.is_empty() {
                return Ok(());
            }
            let payload = serde_json::to_vec(&self.messages)?;
            ctx.byte_array_manager().create("outbox", payload)?;
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn sessions_open_lazily_and_flush_before_entities() {
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let fx = {
            let opened = opened.clone();
            let closed = closed.clone();
            setup_with(config(), move |builder| {
                builder.session_factory(Arc::new(FnSessionFactory::new(move || {
                    opened.fetch_add(1, Ordering::SeqCst);
                    Outbox {
                        messages: Vec::new(),
                        closed: closed.clone(),
                    }
                })))
            })
        };

        create_counter(&fx.engine);
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        fx.engine
            .execute(FnCommand::new("publish", |ctx| {
                ctx.with_session(|outbox: &mut Outbox| outbox.messages.push("order placed".into()))?;
                ctx.with_session(|outbox: &mut Outbox| outbox.messages.push("order paid".into()))
            }))
            .unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.count(EntityType::ByteArray), 2);

        let err = fx
            .engine
            .execute(FnCommand::new("publish then fail", |ctx| -> EngineResult<()> {
                ctx.with_session(|outbox: &mut Outbox| outbox.messages.push("lost".into()))?;
                Err(EngineError::command("payment rejected"))
            }))
            .unwrap_err();
        assert_eq!(err, EngineError::command("payment rejected"));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(fx.store.count(EntityType::ByteArray), 2);
    }

    #[test]
    fn unregistered_session_type_is_rejected() {
        let fx = setup();
        let err = fx
            .engine
            .execute(FnCommand::new("no outbox", |ctx| {
                ctx.with_session(|outbox: &mut Outbox| outbox.messages.len())
            }))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{err:?}");
    }

    // ---------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------

    #[test]
    fn failed_job_is_rescheduled_with_backoff_then_completes() {
        let fx = setup_with(config(), |builder| {
            builder.job_handler("payment", |ctx, invocation| {
                ctx.variable_manager().create(
                    invocation.job_id.as_str(),
                    "receipt",
                    json!({"attempt": invocation.attempt}),
                )?;
                if invocation.attempt == 1 {
                    anyhow::bail!("card declined");
                }
                Ok(())
            })
        });
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();

        let job = management
            .schedule_job(NewJob::new("payment").due_at(t0() - chrono::Duration::seconds(1)))
            .unwrap();
        assert_eq!(job.retries, 3);

        let acquired = executor.run_acquisition_cycle().unwrap();
        assert_eq!(acquired.job_ids, vec![job.id.clone()]);
        let locked = management.job(&job.id).unwrap().unwrap();
        assert_eq!(locked.lock_owner.as_deref(), Some("node-A"));
        assert_eq!(
            locked.lock_expiration_time,
            Some(t0() + chrono::Duration::seconds(30))
        );

        let outcomes = executor.execute_acquired(&acquired);
        assert_eq!(outcomes, vec![(job.id.clone(), JobRunOutcome::Rescheduled)]);

        let failed = management.job(&job.id).unwrap().unwrap();
        assert_eq!(failed.retries, 2);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.lock_owner, None);
        assert_eq!(failed.due_date, Some(t0() + chrono::Duration::seconds(10)));
        assert_eq!(failed.exception_message.as_deref(), Some("card declined"));
        let stacktrace = management.job_exception_stacktrace(&job.id).unwrap().unwrap();
        assert!(stacktrace.contains("card declined"));
        // The handler's writes from the failed attempt were rolled back.
        assert_eq!(fx.store.count(EntityType::VariableInstance), 0);

        // Not due yet.
        assert!(executor.run_acquisition_cycle().unwrap().job_ids.is_empty());

        fx.clock.advance(Duration::from_secs(10));
        let acquired = executor.run_acquisition_cycle().unwrap();
        let outcomes = executor.execute_acquired(&acquired);
        assert_eq!(outcomes, vec![(job.id.clone(), JobRunOutcome::Succeeded)]);

        assert_eq!(management.job(&job.id).unwrap(), None);
        assert_eq!(fx.store.count(EntityType::Job), 0);
        assert_eq!(fx.store.count(EntityType::VariableInstance), 1);
        // Only the receipt's value row is left; the stacktrace went with the job.
        assert_eq!(fx.store.count(EntityType::ByteArray), 1);

        let stats = executor.stats();
        assert_eq!(stats.jobs_succeeded, 1);
        assert_eq!(stats.jobs_failed, 1);
        assert_eq!(stats.jobs_acquired, 2);
    }

    #[test]
    fn exhausted_job_raises_incident_and_stays_locked() {
        let fx = setup_with(config(), |builder| {
            builder.job_handler("sync.*", |_ctx, _invocation| {
                Err(anyhow::anyhow!("ledger offline"))
            })
        });
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();

        let job = management
            .schedule_job(NewJob::new("sync.ledger").with_retries(2))
            .unwrap();

        let acquired = executor.run_acquisition_cycle().unwrap();
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Rescheduled)]
        );
        assert!(management.incidents().unwrap().is_empty());

        fx.clock.advance(Duration::from_secs(10));
        let acquired = executor.run_acquisition_cycle().unwrap();
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Exhausted)]
        );

        let exhausted = management.job(&job.id).unwrap().unwrap();
        assert_eq!(exhausted.retries, 0);
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.lock_owner.as_deref(), Some("node-A"));

        let incidents = management.incidents().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].job_id, job.id);
        assert_eq!(incidents[0].message.as_deref(), Some("ledger offline"));

        // Never picked up again, not even after the lock expires.
        fx.clock.advance(Duration::from_secs(3600));
        assert!(executor.run_acquisition_cycle().unwrap().job_ids.is_empty());

        management.set_job_retries(&job.id, 1).unwrap();
        assert!(management.incidents().unwrap().is_empty());
        let restored = management.job(&job.id).unwrap().unwrap();
        assert_eq!(restored.retries, 1);
        assert_eq!(restored.lock_owner, None);
        assert_eq!(executor.run_acquisition_cycle().unwrap().job_ids, vec![job.id]);
        assert_eq!(executor.stats().incidents_created, 1);
    }

    fn duplicate_key() -> StoreError {
        StoreError::database(Some("23505"), "duplicate key value violates unique constraint")
    }

    #[test]
    fn fatal_commit_during_job_execution_consumes_a_retry() {
        let fx = setup_with(config(), |builder| builder.job_handler("import", |_, _| Ok(())));
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();
        let job = management
            .schedule_job(NewJob::new("import").with_retries(2))
            .unwrap();

        let acquired = executor.run_acquisition_cycle().unwrap();
        fx.store.fail_next_commits(1, duplicate_key());
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Rescheduled)]
        );

        let failed = management.job(&job.id).unwrap().unwrap();
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.lock_owner, None);
        assert!(failed
            .exception_message
            .as_deref()
            .is_some_and(|message| message.contains("duplicate key")));

        fx.clock.advance(Duration::from_secs(10));
        let acquired = executor.run_acquisition_cycle().unwrap();
        fx.store.fail_next_commits(1, duplicate_key());
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Exhausted)]
        );
        assert_eq!(management.incidents().unwrap().len(), 1);

        fx.clock.advance(Duration::from_secs(3600));
        assert!(executor.run_acquisition_cycle().unwrap().job_ids.is_empty());
        let stats = executor.stats();
        assert_eq!(stats.conflicts, 0);
        assert_eq!(stats.incidents_created, 1);
    }

    #[test]
    fn retryable_commit_failure_reruns_the_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = setup_with(config(), |builder| {
            let calls = calls.clone();
            builder.job_handler("import", move |ctx, invocation| {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.variable_manager()
                    .create(invocation.job_id.as_str(), "imported", json!(true))?;
                Ok(())
            })
        });
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();
        let job = management.schedule_job(NewJob::new("import")).unwrap();

        let acquired = executor.run_acquisition_cycle().unwrap();
        fx.store.fail_next_commits(1, serialization_failure());
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Succeeded)]
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.store.count(EntityType::Job), 0);
        // The first run's variable went with its rolled back transaction.
        assert_eq!(fx.store.count(EntityType::VariableInstance), 1);
    }

    #[test]
    fn job_transaction_retries_running_out_consume_a_job_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fx = setup_with(config().with_command_retries(1), |builder| {
            let calls = calls.clone();
            builder.job_handler("import", move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();
        let job = management.schedule_job(NewJob::new("import")).unwrap();

        let acquired = executor.run_acquisition_cycle().unwrap();
        fx.store.fail_next_commits(2, serialization_failure());
        assert_eq!(
            executor.execute_acquired(&acquired),
            vec![(job.id.clone(), JobRunOutcome::Rescheduled)]
        );

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let failed = management.job(&job.id).unwrap().unwrap();
        assert_eq!(failed.retries, 2);
        assert!(failed
            .exception_message
            .as_deref()
            .is_some_and(|message| message.contains("retries exhausted")));
    }

    #[test]
    fn acquisition_prefers_higher_priority_jobs() {
        let fx = setup();
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();

        let overdue = management
            .schedule_job(NewJob::new("report").due_at(t0() - chrono::Duration::hours(1)))
            .unwrap();
        let fresh = management.schedule_job(NewJob::new("report")).unwrap();
        let urgent = management
            .schedule_job(
                NewJob::new("report")
                    .with_priority(10)
                    .due_at(t0() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        let background = management
            .schedule_job(NewJob::new("report").with_priority(-1))
            .unwrap();
        assert_eq!(urgent.priority, 10);

        management.set_job_priority(&background.id, 20).unwrap();
        assert_eq!(management.job(&background.id).unwrap().unwrap().priority, 20);

        // Three per cycle: priority first, then undated before dated.
        let acquired = executor.run_acquisition_cycle().unwrap();
        assert_eq!(acquired.job_ids, vec![background.id, urgent.id, fresh.id]);
        assert_eq!(executor.run_acquisition_cycle().unwrap().job_ids, vec![overdue.id]);

        assert!(matches!(
            management.set_job_priority(&EntityId::from("missing"), 1),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn set_job_duedate_reschedules_without_touching_the_lock() {
        let fx = setup();
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();
        let signal = fx.engine.services().acquisition_signal();

        let later = management
            .schedule_job(NewJob::new("report").due_at(t0() + chrono::Duration::hours(1)))
            .unwrap();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        assert!(executor.run_acquisition_cycle().unwrap().job_ids.is_empty());

        management.set_job_duedate(&later.id, None).unwrap();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        assert_eq!(management.job(&later.id).unwrap().unwrap().due_date, None);
        assert_eq!(
            executor.run_acquisition_cycle().unwrap().job_ids,
            vec![later.id.clone()]
        );

        let postponed = t0() + chrono::Duration::days(1);
        management.set_job_duedate(&later.id, Some(postponed)).unwrap();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
        let moved = management.job(&later.id).unwrap().unwrap();
        assert_eq!(moved.due_date, Some(postponed));
        assert_eq!(moved.lock_owner.as_deref(), Some("node-A"));

        assert!(matches!(
            management.set_job_duedate(&EntityId::from("missing"), None),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn acquisition_skips_rows_locked_by_another_transaction() {
        let fx = setup_with(config(), |builder| builder.job_handler("*", |_, _| Ok(())));
        let executor = fx.engine.job_executor();
        let job = fx
            .engine
            .management_service()
            .schedule_job(NewJob::new("cleanup"))
            .unwrap();

        // Another node has written the row but not committed yet.
        let key = EntityKey::new(EntityType::Job, job.id.clone());
        let mut competing = fx.store.begin().unwrap();
        let row = competing.select_by_id(&key).unwrap().unwrap();
        let mut claimed = row.clone();
        claimed.revision += 1;
        claimed.data["lock_owner"] = json!("node-B");
        assert_eq!(competing.update(&claimed, row.revision).unwrap(), 1);

        let acquired = executor.run_acquisition_cycle().unwrap();
        assert!(acquired.job_ids.is_empty());
        assert_eq!(acquired.selected, 1);
        assert_eq!(executor.stats().conflicts, 1);

        competing.rollback().unwrap();
        let acquired = executor.run_acquisition_cycle().unwrap();
        assert_eq!(acquired.job_ids, vec![job.id]);
    }

    #[test]
    fn second_node_cannot_acquire_locked_jobs() {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let node = |owner: &str| {
            ProcessEngine::builder(Arc::new(store.clone()))
                .config(EngineConfig::default().with_job_executor(
                    JobExecutorConfig::default()
                        .with_lock_owner(owner)
                        .with_max_jobs_per_acquisition(10),
                ))
                .clock(clock.clone())
                .build()
                .unwrap()
        };
        let node_a = node("node-A");
        let node_b = node("node-B");

        let management = node_a.management_service();
        for _ in 0..4 {
            management.schedule_job(NewJob::new("report")).unwrap();
        }

        let first = node_a.job_executor().run_acquisition_cycle().unwrap();
        let second = node_b.job_executor().run_acquisition_cycle().unwrap();
        assert_eq!(first.job_ids.len(), 4);
        assert!(second.job_ids.is_empty());
    }

    #[test]
    fn management_service_controls_jobs() {
        let fx = setup_with(config(), |builder| {
            builder
                .job_handler("billing.*", |_, _| Ok(()))
                .job_handler("flaky", |_, _| Err(anyhow::anyhow!("gateway timeout")))
        });
        let management = fx.engine.management_service();
        let executor = fx.engine.job_executor();

        let invoice = management
            .schedule_job(
                NewJob::new("billing.invoice").with_configuration(json!({"order": "o-17"})),
            )
            .unwrap();
        assert_eq!(invoice.handler_configuration, json!({"order": "o-17"}));
        assert_eq!(management.jobs().unwrap().len(), 1);

        management.suspend_job(&invoice.id).unwrap();
        assert!(executor.run_acquisition_cycle().unwrap().job_ids.is_empty());
        management.activate_job(&invoice.id).unwrap();
        assert_eq!(
            executor.run_acquisition_cycle().unwrap().job_ids,
            vec![invoice.id.clone()]
        );

        // Direct execution ignores the lock.
        management.execute_job(&invoice.id).unwrap();
        assert_eq!(management.job(&invoice.id).unwrap(), None);
        assert!(matches!(
            management.execute_job(&invoice.id),
            Err(EngineError::NotFound(_))
        ));

        let flaky = management.schedule_job(NewJob::new("flaky")).unwrap();
        let err = management.execute_job(&flaky.id).unwrap_err();
        assert_eq!(err.message(), "gateway timeout");
        let recorded = management.job(&flaky.id).unwrap().unwrap();
        assert_eq!(recorded.retries, 2);
        assert!(management
            .job_exception_stacktrace(&flaky.id)
            .unwrap()
            .is_some_and(|trace| trace.contains("gateway timeout")));

        assert!(matches!(
            management.set_job_retries(&flaky.id, -1),
            Err(EngineError::InvalidArgument(_))
        ));
        management.set_job_retries(&flaky.id, 0).unwrap();
        assert_eq!(management.incidents().unwrap().len(), 1);

        assert!(management.delete_job(&flaky.id).unwrap());
        assert!(!management.delete_job(&flaky.id).unwrap());
        assert!(management.incidents().unwrap().is_empty());
        assert_eq!(fx.store.count(EntityType::ByteArray), 0);
    }

    #[test]
    fn job_without_handler_fails_like_a_handler_error() {
        let fx = setup();
        let management = fx.engine.management_service();
        let job = management.schedule_job(NewJob::new("unknown.type")).unwrap();

        let err = management.execute_job(&job.id).unwrap_err();
        assert!(
            err.message().contains("no handler registered for job type unknown.type"),
            "{err:?}"
        );
        assert_eq!(management.job(&job.id).unwrap().unwrap().retries, 2);
    }

    #[test]
    fn scheduling_a_due_job_wakes_the_acquisition_thread() {
        let fx = setup();
        let signal = fx.engine.services().acquisition_signal();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));

        fx.engine
            .management_service()
            .schedule_job(NewJob::new("later").due_at(t0() + chrono::Duration::hours(1)))
            .unwrap();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));

        fx.engine
            .management_service()
            .schedule_job(NewJob::new("now"))
            .unwrap();
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }
}
