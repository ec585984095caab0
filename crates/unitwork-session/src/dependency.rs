//! Ready-made scopes for request handlers.
//!
//! Both helpers require an outer session to be open already: a request
//! handler runs inside the transaction its caller opened and fails fast with
//! a configuration error when there is none.

use std::future::Future;

use asupersync::{Cx, Outcome};
use unitwork_core::{Error, Result};

use crate::context::Context;
use crate::cooperative::CooperativeSession;
use crate::scope::{cooperative_scope, session_scope, AsyncScopeOptions, OnMissing, ScopeOptions};
use crate::session::Session;

/// Run `body` with the ambient blocking session.
pub fn session_dependency<T, B>(ctx: &Context, body: B) -> Result<T>
where
    B: FnOnce(&Session) -> Result<T>,
{
    session_scope(ctx, ScopeOptions::new().on_missing(OnMissing::Raise), body)
}

/// Run `body` with the ambient cooperative session.
pub async fn async_session_dependency<T, B, Fut>(ctx: &Context, cx: &Cx, body: B) -> Outcome<T, Error>
where
    B: FnOnce(CooperativeSession) -> Fut,
    Fut: Future<Output = Outcome<T, Error>>,
{
    cooperative_scope(
        ctx,
        cx,
        AsyncScopeOptions::new().on_missing(OnMissing::Raise),
        body,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use unitwork_core::ConfigErrorKind;

    #[test]
    fn test_dependency_requires_open_session() {
        let ctx = Context::new();
        let err = session_dependency(&ctx, |_| Ok(())).expect_err("no session");
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::NoSession));

        let session = Session::builder().build();
        let _guard = ctx.enter_session(session.clone());
        let id = session_dependency(&ctx, |s| Ok(s.id())).expect("dependency");
        assert_eq!(id, session.id());
        assert!(!session.is_closed());
    }

    #[test]
    fn test_async_dependency_requires_open_session() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ctx = Context::new();

        rt.block_on(async {
            match async_session_dependency(&ctx, &cx, |_| async { Outcome::Ok(()) }).await {
                Outcome::Err(e) => assert_eq!(e.config_kind(), Some(ConfigErrorKind::NoSession)),
                _ => panic!("expected a configuration error"),
            }

            let session = Session::builder().build_cooperative();
            let _guard = ctx.enter_session(session.clone());
            match async_session_dependency(&ctx, &cx, |s| async move { Outcome::Ok(s.id()) }).await {
                Outcome::Ok(id) => assert_eq!(id, session.id()),
                _ => panic!("expected the ambient session"),
            }
            assert!(!session.is_closed());
        });
    }
}
