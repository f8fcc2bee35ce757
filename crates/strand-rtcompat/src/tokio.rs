//! Entry points for use with Tokio runtimes.

use crate::traits::{SleepProvider, SpawnBlocking};
use futures::task::{FutureObj, Spawn, SpawnError};
use futures::Future;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A [`crate::Runtime`] backed by a Tokio executor.
///
/// Generally you should call [`create_runtime`] only once, and then use
/// [`Clone::clone()`] to create additional references to that runtime.
#[derive(Clone)]
pub struct TokioRuntimeHandle {
    /// The handle used to spawn tasks.
    handle: tokio_crate::runtime::Handle,
    /// If we built the runtime ourselves, we own it here so it outlives
    /// every handle cloned from us.
    owned: Option<Arc<tokio_crate::runtime::Runtime>>,
}

/// Create a new Tokio-based [`crate::Runtime`].
pub fn create_runtime() -> IoResult<TokioRuntimeHandle> {
    let runtime = tokio_crate::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();
    Ok(TokioRuntimeHandle {
        handle,
        owned: Some(Arc::new(runtime)),
    })
}

impl TokioRuntimeHandle {
    /// Wrap an existing tokio runtime handle as a [`crate::Runtime`].
    pub fn new(handle: tokio_crate::runtime::Handle) -> Self {
        TokioRuntimeHandle {
            handle,
            owned: None,
        }
    }
}

impl Spawn for TokioRuntimeHandle {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.handle.spawn(future);
        Ok(())
    }
}

impl SpawnBlocking for TokioRuntimeHandle {
    fn block_on<F: Future>(&self, f: F) -> F::Output {
        match &self.owned {
            Some(rt) => rt.block_on(f),
            None => self.handle.block_on(f),
        }
    }
}

impl SleepProvider for TokioRuntimeHandle {
    type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        // The Sleep object is created lazily inside the async block, so
        // that it is constructed within the runtime's timer context.
        Box::pin(async move { tokio_crate::time::sleep(duration).await })
    }
}

/// Run a test function using a freshly created tokio runtime.
pub fn test_with_runtime<P, F, O>(func: P) -> O
where
    P: FnOnce(TokioRuntimeHandle) -> F,
    F: futures::Future<Output = O>,
{
    let runtime = create_runtime().expect("couldn't create runtime");
    runtime.clone().block_on(func(runtime))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SleepProviderExt;
    use std::time::Instant;

    #[test]
    fn small_delay() {
        test_with_runtime(|rt| async move {
            let i1 = Instant::now();
            let one_msec = Duration::from_millis(1);
            rt.sleep(one_msec).await;
            let i2 = Instant::now();
            assert!(i2 >= i1 + one_msec);
        });
    }

    #[test]
    fn small_timeout_ok() {
        test_with_runtime(|rt| async move {
            let one_day = Duration::from_secs(86400);
            let outcome = rt.timeout(one_day, async { 413_u32 }).await;
            assert_eq!(outcome, Ok(413));
        });
    }

    #[test]
    fn small_timeout_expire() {
        use futures::future::pending;

        test_with_runtime(|rt| async move {
            let one_micros = Duration::from_micros(1);
            let outcome = rt.timeout(one_micros, pending::<()>()).await;
            assert_eq!(outcome, Err(crate::TimeoutError));
            assert_eq!(
                outcome.err().unwrap().to_string(),
                "Timeout expired".to_string()
            );
        });
    }
}
