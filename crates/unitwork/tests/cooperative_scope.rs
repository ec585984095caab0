use std::future::Future;
use std::pin::{Pin, pin};
use std::task::{Context as TaskContext, Poll, Waker};

use asupersync::CancelReason;
use asupersync::runtime::RuntimeBuilder;

use unitwork::{AsyncScopedSessionMaker, ConfigErrorKind, ScopeKey, UsageErrorKind};
use unitwork::prelude::*;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn order_type() -> ResourceType {
    ResourceType::new("Order", "orders")
}

fn app_context(engine: &MemoryEngine) -> Context {
    Context::with_app(
        Application::new("shop")
            .with_async_session_factory(AsyncSessionMaker::new().bind(engine.handle())),
    )
}

#[test]
fn cooperative_scope_commits_on_success() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let options = AsyncScopeOptions::new().on_exit(OnExit::Commit);
        let id = unwrap_outcome(
            cooperative_scope(&ctx, &cx, options, |session| {
                let order = order.clone();
                async move {
                    match session.add(&order, Row::new().with("id", 42).with("total", 10)) {
                        Ok(()) => Outcome::Ok(session.id()),
                        Err(e) => Outcome::Err(e),
                    }
                }
            })
            .await,
        );
        assert!(id > 0);
    });

    assert_eq!(engine.stats().commits, 1);
    assert_eq!(engine.rows(&order).len(), 1);
    assert!(ctx.session().is_none());
}

#[test]
fn cooperative_scope_rolls_back_before_wrapping() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let cx_ref = &cx;
        let options = AsyncScopeOptions::new().on_exit(OnExit::Commit);
        let outcome = cooperative_scope(&ctx, &cx, options, |session| {
            let order = order.clone();
            async move {
                if let Err(e) = session.add(&order, Row::new().with("id", 42).with("total", 10)) {
                    return Outcome::Err(e);
                }
                match session.flush(cx_ref).await {
                    Outcome::Ok(()) => {}
                    other => return other,
                }
                Outcome::Err(Error::custom("out of stock"))
            }
        })
        .await;

        match outcome {
            Outcome::Err(Error::Operation(op)) => match op.cause() {
                Error::Custom(custom) => assert_eq!(custom.message, "out of stock"),
                other => panic!("unexpected cause: {other}"),
            },
            Outcome::Err(other) => panic!("unexpected error: {other}"),
            _ => panic!("expected an error outcome"),
        }
    });

    assert_eq!(engine.stats().rollbacks, 1);
    assert_eq!(engine.stats().commits, 0);
    assert!(engine.rows(&order).is_empty());
    assert!(ctx.session().is_none());
}

#[test]
fn cooperative_raise_on_missing_creates_no_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let options = AsyncScopeOptions::new().on_missing(OnMissing::Raise);
        match cooperative_scope(&ctx, &cx, options, |_| async { Outcome::Ok(()) }).await {
            Outcome::Err(e) => assert_eq!(e.config_kind(), Some(ConfigErrorKind::NoSession)),
            _ => panic!("expected a configuration error"),
        }
    });

    assert_eq!(engine.stats().connects, 0);
}

#[test]
fn blocking_ambient_session_is_a_mode_mismatch() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);
    let blocking = Session::builder().bind(engine.handle()).build();
    let _guard = ctx.enter_session(blocking);

    rt.block_on(async {
        match cooperative_scope(&ctx, &cx, AsyncScopeOptions::new(), |_| async { Outcome::Ok(()) })
            .await
        {
            Outcome::Err(e) => {
                assert_eq!(e.usage_kind(), Some(UsageErrorKind::ModeMismatch));
                assert!(e.to_string().contains("Expected a cooperative session"));
            }
            _ => panic!("expected a mode mismatch"),
        }
    });
}

#[test]
fn cooperative_bulk_resolves_reference_and_value_together() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    engine.seed(&order, [Row::new().with("id", 42).with("total", 10)]);
    let ctx = app_context(&engine);

    rt.block_on(async {
        let cx_ref = &cx;
        let ctx_ref = &ctx;
        let order_ref = &order;
        unwrap_outcome(
            cooperative_scope(&ctx, &cx, AsyncScopeOptions::new(), |session| async move {
                let bulk = session.bulk(ctx_ref, true);
                let reference = match bulk.register_reference(order_ref, 42) {
                    Ok(r) => r,
                    Err(e) => return Outcome::Err(e),
                };
                let stale = match bulk.register_value(order_ref, Row::new().with("id", 42)) {
                    Ok(r) => r,
                    Err(e) => return Outcome::Err(e),
                };

                let options = ResolveOptions::new().strategy(ResolveStrategy::Hydrate);
                let report = match bulk.resolve(cx_ref, options).await {
                    Outcome::Ok(report) => report,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                assert_eq!(report.queries, 1);
                assert_eq!(report.resolved, 2);
                assert_eq!(reference.fields(), stale.fields());
                assert_eq!(stale.get("total"), Some(Value::from(10)));
                Outcome::Ok(())
            })
            .await,
        );
    });

    assert_eq!(engine.select_count(), 1);
}

#[test]
fn async_scoped_maker_keeps_one_session_per_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let engine = MemoryEngine::new("primary");
    let scoped = AsyncScopedSessionMaker::new(
        AsyncSessionMaker::new().bind(engine.handle()),
        Arc::new(|| ScopeKey::of("request-1")),
    );
    let ctx = Context::with_app(
        Application::new("shop").with_async_session_factory(scoped.clone()),
    );

    rt.block_on(async {
        let first = unwrap_outcome(
            cooperative_scope(&ctx, &cx, AsyncScopeOptions::new(), |session| async move {
                Outcome::Ok(session.id())
            })
            .await,
        );
        // Released through the removal hook on exit
        assert!(!scoped.has_session());

        let held = scoped.get();
        assert_ne!(held.id(), first);
        assert!(held.ptr_eq(&scoped.get()));
        unwrap_outcome(scoped.remove(&cx).await);
        assert!(held.is_closed());
    });
}

#[test]
fn async_dependency_runs_inside_the_open_scope() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let cx_ref = &cx;
        let ctx_ref = &ctx;
        unwrap_outcome(
            cooperative_scope(&ctx, &cx, AsyncScopeOptions::new(), |outer| async move {
                let inner = async_session_dependency(ctx_ref, cx_ref, |session| async move {
                    Outcome::Ok(session.id())
                })
                .await;
                match inner {
                    Outcome::Ok(id) => assert_eq!(id, outer.id()),
                    _ => panic!("expected the scope session"),
                }
                Outcome::Ok(())
            })
            .await,
        );
    });
}

#[test]
fn cancelled_body_rolls_back_and_propagates() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let cx_ref = &cx;
        let options = AsyncScopeOptions::new().on_exit(OnExit::Commit);
        let outcome = cooperative_scope(&ctx, &cx, options, |session| {
            let order = order.clone();
            async move {
                if let Err(e) = session.add(&order, Row::new().with("id", 42).with("total", 10)) {
                    return Outcome::Err(e);
                }
                match session.flush(cx_ref).await {
                    Outcome::Ok(()) => {}
                    other => return other,
                }
                Outcome::Cancelled(CancelReason::timeout())
            }
        })
        .await;
        assert!(matches!(outcome, Outcome::Cancelled(_)));
    });

    let stats = engine.stats();
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.rollbacks, 1);
    assert!(engine.rows(&order).is_empty());
    assert!(ctx.session().is_none());
}

#[test]
fn dropped_scope_future_releases_without_commit() {
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    {
        let cx_ref = &cx;
        let options = AsyncScopeOptions::new().on_exit(OnExit::Commit);
        let scope = cooperative_scope(&ctx, &cx, options, |session| {
            let order = order.clone();
            async move {
                if let Err(e) = session.add(&order, Row::new().with("id", 42).with("total", 10)) {
                    return Outcome::Err(e);
                }
                match session.flush(cx_ref).await {
                    Outcome::Ok(()) => {}
                    other => return other,
                }
                // Never resumed: the caller gives up here
                std::future::pending::<()>().await;
                Outcome::Ok(())
            }
        });
        let mut scope = pin!(scope);
        let mut task = TaskContext::from_waker(Waker::noop());
        assert!(scope.as_mut().poll(&mut task).is_pending());
        assert!(ctx.session().is_some());
    }

    let stats = engine.stats();
    assert_eq!(engine.write_count(), 1);
    assert_eq!(stats.commits, 0);
    // Dropped, not rolled back
    assert_eq!(stats.rollbacks, 0);
    assert!(engine.rows(&order).is_empty());
    assert!(ctx.session().is_none());
}

#[test]
fn flush_on_exit_writes_without_committing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    rt.block_on(async {
        let options = AsyncScopeOptions::new().on_exit(OnExit::Flush);
        unwrap_outcome(
            cooperative_scope(&ctx, &cx, options, |session| {
                let order = order.clone();
                async move {
                    match session.add(&order, Row::new().with("id", 42).with("total", 10)) {
                        Ok(()) => Outcome::Ok(()),
                        Err(e) => Outcome::Err(e),
                    }
                }
            })
            .await,
        );
    });

    assert_eq!(engine.write_count(), 1);
    assert_eq!(engine.stats().commits, 0);
    // Released by closing, which discards the flushed transaction
    assert!(engine.rows(&order).is_empty());
    assert!(ctx.session().is_none());
}

/// Suspends once, then completes.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut TaskContext<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[test]
fn forked_units_keep_their_own_sessions_when_interleaved() {
    let cx = Cx::for_testing();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);
    let unit_a = ctx.fork();
    let unit_b = ctx.fork();

    let body = |session: CooperativeSession| async move {
        YieldOnce(false).await;
        Outcome::Ok(session.id())
    };
    let mut first = pin!(cooperative_scope(&unit_a, &cx, AsyncScopeOptions::new(), body));
    let mut second = pin!(cooperative_scope(&unit_b, &cx, AsyncScopeOptions::new(), body));
    let mut task = TaskContext::from_waker(Waker::noop());

    assert!(first.as_mut().poll(&mut task).is_pending());
    assert!(second.as_mut().poll(&mut task).is_pending());
    let a = unit_a.session().expect("first unit session").sync_session().id();
    let b = unit_b.session().expect("second unit session").sync_session().id();
    assert_ne!(a, b);

    // The first unit exits while the second is still suspended
    let first_id = match first.as_mut().poll(&mut task) {
        Poll::Ready(outcome) => unwrap_outcome(outcome),
        Poll::Pending => panic!("first unit should finish"),
    };
    assert_eq!(first_id, a);
    assert!(unit_a.session().is_none());
    let still = unit_b.session().expect("second unit keeps its session");
    assert_eq!(still.sync_session().id(), b);
    assert!(!still.is_closed());

    let second_id = match second.as_mut().poll(&mut task) {
        Poll::Ready(outcome) => unwrap_outcome(outcome),
        Poll::Pending => panic!("second unit should finish"),
    };
    assert_eq!(second_id, b);
    assert!(unit_b.session().is_none());
    assert!(ctx.session().is_none());
}
