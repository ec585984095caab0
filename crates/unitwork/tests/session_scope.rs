use unitwork::{ConfigErrorKind, ObjectState, UsageErrorKind};
use unitwork::prelude::*;

fn order_type() -> ResourceType {
    ResourceType::new("Order", "orders")
}

fn app_context(engine: &MemoryEngine) -> Context {
    Context::with_app(
        Application::new("shop").with_session_factory(SessionMaker::new().bind(engine.handle())),
    )
}

#[test]
fn commit_on_exit_commits_exactly_once() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    let id = session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |session| {
        session.add(&order, Row::new().with("id", 42).with("total", 10))?;
        Ok(session.id())
    })
    .expect("scope");

    assert_eq!(engine.stats().commits, 1);
    assert_eq!(engine.stats().rollbacks, 0);
    assert_eq!(engine.rows(&order).len(), 1);
    // Released on exit
    assert!(ctx.session().is_none());
    assert!(id > 0);
}

#[test]
fn failing_body_commits_nothing_and_wraps_cause() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    let err = session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |session| {
        session.add(&order, Row::new().with("id", 42).with("total", 10))?;
        session.flush()?;
        Err::<(), _>(Error::custom("payment declined"))
    })
    .expect_err("scope fails");

    assert_eq!(engine.stats().commits, 0);
    assert_eq!(engine.stats().rollbacks, 1);
    assert!(engine.rows(&order).is_empty());

    match err {
        Error::Operation(op) => match op.cause() {
            Error::Custom(custom) => assert_eq!(custom.message, "payment declined"),
            other => panic!("unexpected cause: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(ctx.session().is_none());
}

#[test]
fn raise_on_missing_creates_no_session() {
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    let mut ran = false;
    let err = session_scope(&ctx, ScopeOptions::new().on_missing(OnMissing::Raise), |_| {
        ran = true;
        Ok(())
    })
    .expect_err("no ambient session");

    assert!(!ran);
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::NoSession));
    assert_eq!(engine.stats().connects, 0);
    assert!(ctx.session().is_none());
}

#[test]
fn missing_factory_is_a_config_error() {
    let ctx = Context::new();
    let err = session_scope(&ctx, ScopeOptions::new(), |_| Ok(())).expect_err("no factory");
    assert_eq!(err.config_kind(), Some(ConfigErrorKind::NoFactory));
}

#[test]
fn nested_scope_reuses_the_ambient_session() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |outer| {
        let inner_id = session_scope(&ctx, ScopeOptions::new(), |inner| {
            inner.add(&order, Row::new().with("id", 1).with("total", 3))?;
            Ok(inner.id())
        })?;
        assert_eq!(inner_id, outer.id());
        // The inner scope does not own the session and must leave it open
        assert!(!outer.is_closed());
        assert_eq!(outer.pending_new_count(), 1);
        Ok(())
    })
    .expect("scope");

    assert_eq!(engine.stats().commits, 1);
    assert_eq!(engine.rows(&order).len(), 1);
}

#[test]
fn nested_failure_propagates_unwrapped_until_owner() {
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    let err = session_scope(&ctx, ScopeOptions::new(), |_| {
        let inner = session_scope(&ctx, ScopeOptions::new(), |_| {
            Err::<(), _>(Error::custom("inner"))
        });
        match &inner {
            Err(Error::Custom(custom)) => assert_eq!(custom.message, "inner"),
            other => panic!("unexpected inner result: {other:?}"),
        }
        inner
    })
    .expect_err("outer fails");

    // Wrapped exactly once, by the scope that opened the session
    match err {
        Error::Operation(op) => assert!(matches!(op.cause(), Error::Custom(_))),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn new_session_opens_an_independent_session() {
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    session_scope(&ctx, ScopeOptions::new(), |outer| {
        let inner_id = session_scope(&ctx, ScopeOptions::new().new_session(true), |inner| {
            Ok(inner.id())
        })?;
        assert_ne!(inner_id, outer.id());
        // The outer session is published again after the inner scope exits
        let ambient = ctx.session().expect("ambient session");
        assert!(ambient.sync_session().ptr_eq(outer));
        Ok(())
    })
    .expect("scope");
}

#[test]
fn cooperative_ambient_session_is_a_mode_mismatch() {
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);
    let cooperative = Session::builder().bind(engine.handle()).build_cooperative();
    let _guard = ctx.enter_session(cooperative);

    let err = session_scope(&ctx, ScopeOptions::new(), |_| Ok(())).expect_err("mode mismatch");
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::ModeMismatch));
    assert!(err.to_string().contains("Expected a blocking session"));
}

#[test]
fn scope_with_expire_override_keeps_rows_fresh() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();
    let _guard = ctx.enter_session(session.clone());

    session_scope(
        &ctx,
        ScopeOptions::new().on_exit(OnExit::Commit).expire(Some(false)),
        |s| s.add(&order, Row::new().with("id", 7).with("total", 1)),
    )
    .expect("scope");

    assert_eq!(session.object_state(&order, 7), Some(ObjectState::Persistent));
    assert!(session.expire_on_commit());

    session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Commit), |_| Ok(()))
        .expect("second scope");
    assert_eq!(session.object_state(&order, 7), Some(ObjectState::Expired));
}

#[test]
fn scoped_maker_recycles_the_session_on_exit() {
    let engine = MemoryEngine::new("primary");
    let scoped = ScopedSessionMaker::new(SessionMaker::new().bind(engine.handle()));
    let ctx = Context::with_app(Application::new("shop").with_session_factory(scoped.clone()));

    session_scope(&ctx, ScopeOptions::new(), |session| {
        assert!(scoped.has_session());
        assert!(scoped.get().ptr_eq(session));
        Ok(())
    })
    .expect("scope");

    assert!(!scoped.has_session());
}

#[test]
fn config_from_json_drives_scope_sessions() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let config = SessionConfig::from_json(r#"{"auto_flush": false}"#).expect("parse config");
    let ctx = Context::with_app(
        Application::new("shop").with_session_factory(
            SessionMaker::new().bind(engine.handle()).config(config),
        ),
    );

    session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Rollback), |session| {
        assert!(!session.config().auto_flush);
        session.add(&order, Row::new().with("id", 1).with("total", 2))?;
        let rows = session.execute(&Statement::select_all(order.clone()))?;
        assert!(rows.is_empty());
        Ok(())
    })
    .expect("scope");

    assert_eq!(engine.write_count(), 0);
}

#[test]
fn flush_on_exit_writes_without_committing() {
    let order = order_type();
    let engine = MemoryEngine::new("primary");
    let ctx = app_context(&engine);

    session_scope(&ctx, ScopeOptions::new().on_exit(OnExit::Flush), |session| {
        session.add(&order, Row::new().with("id", 3).with("total", 4))
    })
    .expect("scope");

    assert_eq!(engine.write_count(), 1);
    assert_eq!(engine.stats().commits, 0);
    assert!(engine.rows(&order).is_empty());
    assert!(ctx.session().is_none());
}
