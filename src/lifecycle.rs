use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::RunError;
use crate::sync::*;

/// The start state of a component which may only be started once.
///
/// ```text
///   ┌────────────┐  first run   ┌──────────┐  handle built  ┌─────────────────┐
///   │ NotStarted │ ───────────▶ │ Starting │ ─────────────▶ │ Started(handle) │
///   └────────────┘              └──────────┘                └─────────────────┘
/// ```
enum State<H> {
    NotStarted,
    Starting,
    Started(H),
}

/// Guards a single start of a component and caches the handle it produced.
///
/// Both transitions happen under one exclusive lock, so concurrent callers can neither start the
/// component twice nor observe a handle which is still being built: every caller gets a clone of
/// the same handle.
pub(crate) struct RunOnce<H> {
    state: sync::Mutex<State<H>>,
}

impl<H: Clone> RunOnce<H> {
    pub(crate) fn new() -> Self {
        Self { state: sync::Mutex::new(State::NotStarted) }
    }

    /// Returns the cached handle, calling `start` to produce it if this is the first call.
    pub(crate) fn get_or_start(&self, start: impl FnOnce() -> H) -> H {
        let mut state = lock(&self.state);
        if let State::Started(handle) = &*state {
            return handle.clone();
        }

        // `Starting` can only be observed here if a previous `start` unwound while holding the lock,
        // in which case nothing was published and we start from scratch.
        *state = State::Starting;
        let handle = start();
        *state = State::Started(handle.clone());
        handle
    }

    pub(crate) fn is_started(&self) -> bool {
        matches!(&*lock(&self.state), State::Started(_))
    }
}

/// A cloneable handle to the joint completion of one or more running tasks.
///
/// Resolves to `Ok(())` once everything it tracks has finished cleanly, including after a
/// cancellation. Clones share one underlying future: polling any of them drives all of them, and
/// [`ptr_eq`] tells whether two handles come from the same start.
///
/// [`ptr_eq`]: Self::ptr_eq
#[derive(Clone)]
#[must_use]
pub struct Completion {
    inner: Shared<BoxFuture<'static, Result<(), RunError>>>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("result", &self.peek()).finish()
    }
}

impl Completion {
    pub(crate) fn new(fut: impl Future<Output = Result<(), RunError>> + Send + 'static) -> Self {
        Self { inner: fut.boxed().shared() }
    }

    pub(crate) fn ready(res: Result<(), RunError>) -> Self {
        Self::new(futures::future::ready(res))
    }

    /// Spawns `fut` onto the current tokio runtime and tracks it.
    pub(crate) fn spawn(
        name: impl Into<String>,
        fut: impl Future<Output = Result<(), RunError>> + Send + 'static,
    ) -> Self {
        let name = name.into();
        let handle = tokio::spawn(fut);
        Self::new(async move {
            match handle.await {
                Ok(res) => res,
                Err(e) if e.is_panic() => {
                    tracing::error!(task = %name, "Task panicked");
                    Err(RunError::Panicked(name))
                }
                Err(_) => Err(RunError::Aborted(name)),
            }
        })
    }

    /// Waits for every completion, then resolves with the first failure among them in the order
    /// they were given. A failure does not stop the others from running.
    pub(crate) fn join_all(completions: Vec<Completion>) -> Self {
        Self::new(async move {
            futures::future::join_all(completions).await.into_iter().find(Result::is_err).unwrap_or(Ok(()))
        })
    }

    /// Whether `self` and `other` are clones of the same handle.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Shared::ptr_eq(&self.inner, &other.inner)
    }

    /// The result, if the tracked work has already been awaited to completion through some clone.
    pub fn peek(&self) -> Option<Result<(), RunError>> {
        self.inner.peek().cloned()
    }
}

impl Future for Completion {
    type Output = Result<(), RunError>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}
