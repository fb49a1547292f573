//! Runtime abstraction for the async reactor driver.
//!
//! [`Reactor::run_with`](super::Reactor::run_with) hands control back to the
//! executor between loop iterations so that coroutines woken by event handlers
//! get to run before the next blocking poll.

use std::future::Future;

/// Trait for abstracting async runtime operations.
///
/// # Example
///
/// ```rust
/// use spindle::reactor::Runtime;
///
/// struct MyRuntime;
///
/// impl Runtime for MyRuntime {
///     async fn yield_now() {
///         // Your runtime's yield implementation
///     }
/// }
/// ```
pub trait Runtime {
    /// Yield control back to the runtime scheduler.
    fn yield_now() -> impl Future<Output = ()>;
}

/// Tokio runtime implementation.
///
/// Intended for a current-thread runtime with a `LocalSet`, which is how
/// every worker thread is set up.
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn yield_now() -> impl Future<Output = ()> {
        tokio::task::yield_now()
    }
}
