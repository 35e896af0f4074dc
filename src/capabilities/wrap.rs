//! Uniform call wrapping for shell-exposed methods.
//!
//! Every exposed method body runs inside a [`CallSite`]. The wrapper emits a
//! telemetry event, checks the session interrupt at entry and exit, races
//! asynchronous bodies against the interrupt, and routes failures through
//! the session's error-transform hook. Without a session the body runs
//! unwrapped.

use std::future::Future;

use tracing::Instrument;

use super::registry::is_deprecated;
use crate::error::{ShellError, ShellResult};
use crate::events::{ApiCallEvent, ShellEvent};
use crate::session::{SessionContext, SessionRef};

/// Decrements the session call depth when a wrapped call ends, including
/// when its future is dropped.
struct DepthGuard<'a> {
    session: &'a dyn SessionContext,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.session.exit_call();
    }
}

/// One invocation of a wrapped method.
#[derive(Clone, Copy)]
pub struct CallSite<'a> {
    session: Option<&'a SessionRef>,
    class: &'a str,
    method: &'a str,
}

impl<'a> CallSite<'a> {
    pub fn new(session: Option<&'a SessionRef>, class: &'a str, method: &'a str) -> Self {
        Self {
            session,
            class,
            method,
        }
    }

    fn enter(&self, session: &'a SessionRef, is_async: bool) -> (usize, DepthGuard<'a>) {
        let depth = session.enter_call();
        let guard = DepthGuard {
            session: session.as_ref(),
        };
        session.emit_api_call(ApiCallEvent::new(
            self.class,
            self.method,
            is_deprecated(self.class, self.method),
            is_async,
            depth,
        ));
        (depth, guard)
    }

    /// Failures are transformed once, by the outermost wrapped call.
    fn finish_error(&self, session: &SessionRef, depth: usize, err: ShellError) -> ShellError {
        if err.is_interrupted() {
            session.emit_event(ShellEvent::interrupted(self.class, self.method));
        }
        if depth == 0 {
            session.transform_error(err)
        } else {
            err
        }
    }

    /// Run a synchronous method body.
    pub fn run_sync<T>(&self, body: impl FnOnce() -> ShellResult<T>) -> ShellResult<T> {
        let Some(session) = self.session else {
            return body();
        };
        let span = tracing::debug_span!(
            "shell_api_call",
            class = self.class,
            method = self.method,
            is_async = false
        );
        let _entered = span.enter();
        let (depth, _guard) = self.enter(session, false);
        let interrupt = session.interrupt_flag();

        let result = interrupt.checkpoint().and_then(|_| body()).and_then(|value| {
            interrupt.checkpoint()?;
            Ok(value)
        });
        result.map_err(|e| self.finish_error(session, depth, e))
    }

    /// Run an asynchronous method body, racing it against the interrupt.
    ///
    /// The race is biased toward the interrupt: if it is raised by the time
    /// the race is polled, the call fails even when the body is also ready.
    /// A losing body is dropped, not awaited.
    pub async fn run_async<T, F>(&self, body: F) -> ShellResult<T>
    where
        F: Future<Output = ShellResult<T>>,
    {
        let Some(session) = self.session else {
            return body.await;
        };
        let span = tracing::debug_span!(
            "shell_api_call",
            class = self.class,
            method = self.method,
            is_async = true
        );
        let (depth, _guard) = self.enter(session, true);
        let interrupt = session.interrupt_flag();

        let result = async {
            interrupt.checkpoint()?;
            let value = tokio::select! {
                biased;
                _ = interrupt.interrupted() => Err(ShellError::Interrupted),
                result = body => result,
            }?;
            interrupt.checkpoint()?;
            Ok(value)
        }
        .instrument(span)
        .await;
        result.map_err(|e| self.finish_error(session, depth, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus::drain;
    use crate::provider::memory::MemoryProvider;
    use crate::session::{ShellPlugin, ShellSession};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> Arc<ShellSession> {
        ShellSession::with_provider(Arc::new(MemoryProvider::new()))
    }

    struct CountTransforms(Arc<AtomicUsize>);

    impl ShellPlugin for CountTransforms {
        fn transform_error(&self, err: ShellError) -> ShellError {
            self.0.fetch_add(1, Ordering::SeqCst);
            err.annotate("transformed")
        }
    }

    #[test]
    fn test_without_session_runs_body() {
        let site = CallSite::new(None, "Cursor", "limit");
        assert_eq!(site.run_sync(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn test_sync_emits_telemetry() {
        let s = session();
        let ctx = s.context();
        let mut rx = s.events().subscribe();
        CallSite::new(Some(&ctx), "Cursor", "oplogReplay")
            .run_sync(|| Ok(()))
            .unwrap();
        let events = drain(&mut rx);
        match &events[0] {
            ShellEvent::ApiCall(call) => {
                assert_eq!(call.class, "Cursor");
                assert_eq!(call.method, "oplogReplay");
                assert!(call.deprecated);
                assert!(!call.is_async);
                assert_eq!(call.call_depth, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(s.call_depth(), 0);
    }

    #[test]
    fn test_sync_checks_interrupt_before_body() {
        let s = session();
        let ctx = s.context();
        s.interrupt().set();
        let ran = AtomicBool::new(false);
        let err = CallSite::new(Some(&ctx), "Cursor", "limit")
            .run_sync(|| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sync_checks_interrupt_after_body() {
        let s = session();
        let ctx = s.context();
        let flag = s.interrupt().clone();
        let err = CallSite::new(Some(&ctx), "Cursor", "limit")
            .run_sync(|| {
                flag.set();
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_errors_transformed_once_at_top_level() {
        let s = session();
        let count = Arc::new(AtomicUsize::new(0));
        s.register_plugin(CountTransforms(count.clone()));
        let ctx = s.context();
        let err = CallSite::new(Some(&ctx), "Collection", "find")
            .run_sync(|| {
                CallSite::new(Some(&ctx), "Cursor", "limit")
                    .run_sync(|| -> ShellResult<()> { Err(ShellError::resource("boom")) })
            })
            .unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "boom (transformed)");
    }

    #[tokio::test]
    async fn test_async_interrupt_wins_race() {
        let s = session();
        let ctx = s.context();
        let completed = Arc::new(AtomicBool::new(false));
        let done = completed.clone();
        let flag = s.interrupt().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.set();
        });
        let err = CallSite::new(Some(&ctx), "Cursor", "toArray")
            .run_async(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert!(!completed.load(Ordering::SeqCst));
        assert_eq!(s.call_depth(), 0);
    }

    #[tokio::test]
    async fn test_async_interrupt_wins_tie() {
        let s = session();
        let ctx = s.context();
        let flag = s.interrupt().clone();
        let err = CallSite::new(Some(&ctx), "Cursor", "next")
            .run_async(async move {
                // Settles on first poll, after raising the signal.
                flag.set();
                Ok(1)
            })
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    #[tokio::test]
    async fn test_async_success_and_reset() {
        let s = session();
        let ctx = s.context();
        s.interrupt().set();
        assert!(CallSite::new(Some(&ctx), "Cursor", "next")
            .run_async(async { Ok(1) })
            .await
            .is_err());
        s.interrupt().reset();
        let v = CallSite::new(Some(&ctx), "Cursor", "next")
            .run_async(async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn test_interrupt_event_published() {
        let s = session();
        let ctx = s.context();
        let mut rx = s.events().subscribe();
        s.interrupt().set();
        let _ = CallSite::new(Some(&ctx), "Cursor", "tryNext")
            .run_async(async { Ok(()) })
            .await;
        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert!(kinds.contains(&"interrupted"));
        assert!(kinds.contains(&"error_transformed"));
    }
}
