use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Completes on its second poll, asking to be re-polled after the first.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.0 {
            self.0 = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        Poll::Ready(())
    }
}

/// Yields back to the engine once.
///
/// The current task is re-queued behind the work already waiting on the
/// loop, so other tasks and handlers get to run before it continues.
///
/// # Examples
///
/// ```rust
/// use cqloop::{Engine, yield_now};
///
/// let engine = Engine::new();
///
/// let output = engine.block_on(async {
///     yield_now().await;
///     7
/// });
///
/// assert_eq!(output.unwrap(), 7);
/// ```
pub async fn yield_now() {
    YieldOnce(false).await
}
