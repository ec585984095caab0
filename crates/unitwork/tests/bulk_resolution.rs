use unitwork::{Projection, ResolverStep, UsageErrorKind};
use unitwork::prelude::*;

fn order_type() -> ResourceType {
    ResourceType::new("Order", "orders")
}

fn seeded_engine(order: &ResourceType) -> MemoryEngine {
    let engine = MemoryEngine::new("primary");
    engine.seed(
        order,
        [
            Row::new().with("id", 1).with("total", 5).with("status", "open"),
            Row::new().with("id", 2).with("total", 8).with("status", "open"),
            Row::new().with("id", 42).with("total", 10).with("status", "paid"),
        ],
    );
    engine
}

fn app_context(engine: &MemoryEngine) -> Context {
    Context::with_app(
        Application::new("shop").with_session_factory(SessionMaker::new().bind(engine.handle())),
    )
}

#[test]
fn reference_and_stale_value_resolve_with_one_query() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let ctx = app_context(&engine);
    assert!(ctx.session().is_none());

    session_scope(&ctx, ScopeOptions::new().on_missing(OnMissing::Create), |session| {
        let bulk = session.bulk(&ctx, true);
        let reference = bulk.register_reference(&order, 42)?;
        let stale = bulk.register_value(&order, Row::new().with("id", 42).with("total", 1))?;

        let report = bulk.resolve(ResolveOptions::new().strategy(ResolveStrategy::Hydrate))?;
        assert_eq!(report.queries, 1);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(engine.select_count(), 1);

        assert_eq!(reference.status(), EntryStatus::Resolved);
        assert_eq!(stale.status(), EntryStatus::Resolved);
        assert_eq!(reference.fields(), stale.fields());
        assert_eq!(stale.get("total"), Some(Value::from(10)));
        assert_eq!(reference.state(), InstanceState::Persistent);
        Ok(())
    })
    .expect("scope");
}

#[test]
fn bind_strategy_populates_identity_only() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    let first = bulk.register_reference(&order, 1).expect("register");
    let second = bulk.register_reference(&order, 2).expect("register");

    let report = bulk.resolve(ResolveOptions::new()).expect("resolve");
    assert_eq!(report.queries, 1);
    assert_eq!(report.resolved, 2);

    assert_eq!(first.fields(), Row::new().with("id", 1));
    assert_eq!(second.get("total"), None);
    assert_eq!(first.state(), InstanceState::Detached);

    match engine.statements().last() {
        Some(Statement::Select { projection, .. }) => {
            assert_eq!(projection, &Projection::Fields(vec!["id".to_string()]));
        }
        other => panic!("unexpected statement: {other:?}"),
    }
}

#[test]
fn hydrate_strategy_populates_every_field() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    let first = bulk.register_reference(&order, 1).expect("register");

    bulk.resolve(ResolveOptions::new().strategy(ResolveStrategy::Hydrate))
        .expect("resolve");
    assert_eq!(first.get("total"), Some(Value::from(5)));
    assert_eq!(first.get("status"), Some(Value::from("open")));
    assert_eq!(first.state(), InstanceState::Persistent);
}

#[test]
fn proxied_references_share_one_instance() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, true);
    let a = bulk.register_reference(&order, 42).expect("register");
    let b = bulk.register_reference(&order, 42).expect("register");
    assert!(a.same_instance(&b));
    assert_eq!(bulk.len(), 2);
    assert_eq!(bulk.instance_count(), 1);

    bulk.resolve(ResolveOptions::new().strategy(ResolveStrategy::Hydrate))
        .expect("resolve");
    a.set("status", "refunded");
    assert_eq!(b.get("status"), Some(Value::from("refunded")));
    assert_eq!(b.status(), EntryStatus::Resolved);
}

#[test]
fn unproxied_references_stay_distinct() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    let a = bulk.register_reference(&order, 42).expect("register");
    let b = bulk.register_reference(&order, 42).expect("register");
    assert!(!a.same_instance(&b));

    a.set("status", "refunded");
    assert_eq!(b.get("status"), None);
}

#[test]
fn missing_rows_raise_by_default() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    bulk.register_reference(&order, 1).expect("register");
    let missing = bulk.register_reference(&order, 99).expect("register");

    match bulk.resolve(ResolveOptions::new()) {
        Err(Error::Resolution(resolution)) => {
            assert_eq!(resolution.failures.len(), 1);
            assert_eq!(resolution.failures[0].entry, missing.entry_id().index());
            assert_eq!(resolution.failures[0].resource, "Order");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(missing.status(), EntryStatus::Failed);
    assert_eq!(bulk.resolved_count(), 1);
}

#[test]
fn failed_entries_are_not_retried() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    bulk.register_reference(&order, 99).expect("register");

    let report = bulk
        .resolve(ResolveOptions::new().raise_errors(false))
        .expect("resolve");
    assert_eq!(report.failed, 1);
    assert_eq!(bulk.failed().len(), 1);

    let report = bulk
        .resolve(ResolveOptions::new().raise_errors(false))
        .expect("resolve again");
    assert_eq!(report.queries, 0);
    assert_eq!(engine.select_count(), 1);
}

#[test]
fn scope_filter_limits_resolution_to_references() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    let reference = bulk.register_reference(&order, 1).expect("register");
    let value = bulk
        .register_value(&order, Row::new().with("id", 2).with("total", 0))
        .expect("register");

    bulk.resolve(ResolveOptions::new().scope(ResolveScope::References))
        .expect("resolve");
    assert_eq!(reference.status(), EntryStatus::Resolved);
    assert_eq!(value.status(), EntryStatus::Pending);
    assert_eq!(bulk.pending_count(), 1);
}

#[test]
fn resolver_can_be_driven_without_a_session() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    let reference = bulk.register_reference(&order, 2).expect("register");

    let mut resolver = bulk
        .registry()
        .resolver(ResolveOptions::new().strategy(ResolveStrategy::Hydrate))
        .expect("resolver");
    let query = match resolver.start().expect("start") {
        ResolverStep::Query(query) => query,
        ResolverStep::Done(_) => panic!("expected a query"),
    };
    assert_eq!(query.resource, order);
    assert_eq!(query.targets, vec![reference.entry_id()]);

    // Rows fetched by hand, straight from storage
    let rows = vec![Row::new().with("id", 2).with("total", 8)];
    match resolver.feed(rows).expect("feed") {
        ResolverStep::Done(report) => assert_eq!(report.resolved, 1),
        ResolverStep::Query(_) => panic!("expected completion"),
    }
    assert_eq!(reference.get("total"), Some(Value::from(8)));
    assert_eq!(engine.select_count(), 0);
}

#[test]
fn bulk_is_published_while_its_scope_lives() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    {
        let bulk = session.bulk(&ctx, true);
        bulk.register_reference(&order, 1).expect("register");
        let ambient = ctx.bulk().expect("ambient bulk");
        assert_eq!(ambient.registry().len(), 1);
    }
    assert!(ctx.bulk().is_none());
}

#[test]
fn registry_is_invalid_after_session_closes() {
    let order = order_type();
    let engine = seeded_engine(&order);
    let ctx = app_context(&engine);

    let bulk = session_scope(&ctx, ScopeOptions::new(), |session| {
        Ok(session.bulk(&ctx, false).into_inner())
    })
    .expect("scope");

    assert!(!bulk.is_valid());
    let err = bulk.register_reference(&order, 1).expect_err("closed session");
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::SessionClosed));
}

#[test]
fn missing_rows_across_resources_fail_together() {
    let order = order_type();
    let customer = ResourceType::new("Customer", "customers");
    let engine = seeded_engine(&order);
    let session = Session::builder().bind(engine.handle()).build();
    let ctx = Context::new();

    let bulk = session.bulk(&ctx, false);
    bulk.register_reference(&order, 1).expect("register");
    let missing_order = bulk.register_reference(&order, 99).expect("register");
    let missing_customer = bulk.register_reference(&customer, 7).expect("register");

    match bulk.resolve(ResolveOptions::new()) {
        Err(Error::Resolution(resolution)) => {
            let failed: Vec<_> = resolution
                .failures
                .iter()
                .map(|f| (f.entry, f.resource.as_str()))
                .collect();
            assert_eq!(
                failed,
                vec![
                    (missing_order.entry_id().index(), "Order"),
                    (missing_customer.entry_id().index(), "Customer"),
                ]
            );
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // Both batches were issued before the error surfaced
    assert_eq!(engine.select_count(), 2);
    assert_eq!(bulk.pending_count(), 0);
    assert_eq!(bulk.resolved_count(), 1);
}
