//! Contains the [`Decider`]: the application-facing surface of the crate,
//! running decisions against stream state under optimistic concurrency with
//! bounded conflict retries.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{ready, BoxFuture};
use futures::FutureExt;

use crate::category::{Category, Fold, StreamName, SyncOutcome};
use crate::store::Backend;
use crate::telemetry::{Noop, Observer, ResyncMetric};
use crate::token::StreamToken;
use crate::Error;

/// Governs how the initial `(token, state)` pair of a decision is obtained.
#[derive(Debug, Clone)]
pub enum LoadOption<S> {
    /// Fetch from the backend; a cached entry may only shortcut the load to
    /// a tail replay, never serve stale state.
    RequireLoad,

    /// Serve a cached entry as-is when one exists, without contacting the
    /// backend; fall back to a full load otherwise.
    AllowStale,

    /// Synthesize the empty stream without any I/O.
    AssumeEmpty,

    /// Seed from a memento previously captured through
    /// [`SyncContext::create_memento`]. Equivalent to
    /// [`AllowStale`][LoadOption::AllowStale] with a caller-supplied seed.
    FromMemento(StreamToken, S),
}

impl<S> Default for LoadOption<S> {
    fn default() -> Self {
        LoadOption::RequireLoad
    }
}

/// The `(token, state)` pair a decision runs against.
///
/// Exposes the stream position alongside the folded state, and can capture a
/// serialisable memento to seed a later load via
/// [`LoadOption::FromMemento`].
#[derive(Debug, Clone)]
pub struct SyncContext<S> {
    token: StreamToken,
    state: S,
}

impl<S> SyncContext<S> {
    pub(crate) fn new(token: StreamToken, state: S) -> Self {
        Self { token, state }
    }

    /// The monotonic count of events persisted in the stream.
    pub fn version(&self) -> u64 {
        self.token.version()
    }

    /// Size of the stream in bytes, when the backend measures it.
    pub fn stream_event_bytes(&self) -> Option<i64> {
        self.token.stream_bytes()
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S> SyncContext<S>
where
    S: Clone,
{
    /// Captures the `(token, state)` pair for a later
    /// [`LoadOption::FromMemento`] load.
    pub fn create_memento(&self) -> (StreamToken, S) {
        (self.token, self.state.clone())
    }
}

/// Hook transforming the conflict-driven reload of each retry attempt.
///
/// The policy receives the 1-based attempt number and the reload future; it
/// may delay it, race it, or replace its outcome. Dropping the future
/// cancels the reload.
#[async_trait]
pub trait ResyncPolicy<S>: Send + Sync
where
    S: Send,
{
    async fn resync<'a>(
        &self,
        attempt: u32,
        reload: BoxFuture<'a, Result<(StreamToken, S), Error>>,
    ) -> Result<(StreamToken, S), Error>
    where
        S: 'async_trait;
}

/// The default [`ResyncPolicy`]: runs the reload as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

#[async_trait]
impl<S> ResyncPolicy<S> for Immediate
where
    S: Send,
{
    async fn resync<'a>(
        &self,
        _attempt: u32,
        reload: BoxFuture<'a, Result<(StreamToken, S), Error>>,
    ) -> Result<(StreamToken, S), Error>
    where
        S: 'async_trait,
    {
        reload.await
    }
}

/// [`ResyncPolicy`] that sleeps `delay * attempt` before reloading, spacing
/// out contending writers.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    delay: Duration,
}

impl LinearBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl<S> ResyncPolicy<S> for LinearBackoff
where
    S: Send,
{
    async fn resync<'a>(
        &self,
        attempt: u32,
        reload: BoxFuture<'a, Result<(StreamToken, S), Error>>,
    ) -> Result<(StreamToken, S), Error>
    where
        S: 'async_trait,
    {
        tokio::time::sleep(self.delay * attempt).await;
        reload.await
    }
}

/// Runs decisions against one stream of a [`Category`].
///
/// Every `transact` call loads the stream state (honouring its
/// [`LoadOption`]), invokes the decision, and appends the produced events
/// under the loaded token's version precondition. A conflicting writer costs
/// one attempt: the decider reloads the stream tail and re-invokes the
/// decision, up to `max_attempts` times.
///
/// Decisions must be pure functions of the supplied state: the loop calls
/// them once per attempt.
pub struct Decider<F, B>
where
    F: Fold,
    B: Backend,
{
    category: Arc<Category<F, B>>,
    stream: StreamName,
    max_attempts: u32,
    resync_policy: Arc<dyn ResyncPolicy<F::State>>,
    on_exhausted: Arc<dyn Fn(u32) -> Error + Send + Sync>,
    observer: Arc<dyn Observer>,
}

impl<F, B> Decider<F, B>
where
    F: Fold,
    B: Backend,
{
    /// Creates a decider for `stream` with 3 attempts, an immediate resync
    /// policy and no telemetry.
    pub fn new(category: Arc<Category<F, B>>, stream: StreamName) -> Self {
        Self {
            category,
            stream,
            max_attempts: 3,
            resync_policy: Arc::new(Immediate),
            on_exhausted: Arc::new(|attempts| Error::MaxResyncsExhausted { attempts }),
            observer: Arc::new(Noop),
        }
    }

    /// Bounds the number of sync attempts per transaction.
    ///
    /// # Errors
    ///
    /// Rejects `max_attempts` below 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, Error> {
        if max_attempts < 1 {
            return Err(Error::InvalidConfig {
                reason: "max_attempts must be at least 1".to_owned(),
            });
        }

        self.max_attempts = max_attempts;
        Ok(self)
    }

    #[must_use]
    pub fn with_resync_policy(mut self, policy: Arc<dyn ResyncPolicy<F::State>>) -> Self {
        self.resync_policy = policy;
        self
    }

    /// Replaces the error raised when every attempt has conflicted.
    #[must_use]
    pub fn with_attempts_exhausted_error(
        mut self,
        factory: impl Fn(u32) -> Error + Send + Sync + 'static,
    ) -> Self {
        self.on_exhausted = Arc::new(factory);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    async fn load_for(
        &self,
        option: LoadOption<F::State>,
    ) -> Result<(StreamToken, F::State), Error> {
        match option {
            LoadOption::RequireLoad => self.category.load(self.stream.as_str(), false).await,
            LoadOption::AllowStale => self.category.load(self.stream.as_str(), true).await,
            LoadOption::AssumeEmpty => Ok((
                self.category.empty_token(),
                self.category.initial_state(),
            )),
            LoadOption::FromMemento(token, state) => Ok((token, state)),
        }
    }

    /// The decision loop every public operation runs through.
    #[tracing::instrument(level = "debug", skip_all, fields(stream = %self.stream))]
    async fn run<D, Fut, R>(
        &self,
        decide: D,
        option: LoadOption<F::State>,
    ) -> Result<(R, SyncContext<F::State>), Error>
    where
        D: Fn(SyncContext<F::State>) -> Fut + Send + Sync,
        Fut: Future<Output = (R, Vec<F::Event>)> + Send,
        R: Send,
    {
        let (mut token, mut state) = self.load_for(option).await?;
        let mut attempt: u32 = 1;

        loop {
            let (result, events) = decide(SyncContext::new(token, state.clone())).await;

            if events.is_empty() {
                return Ok((result, SyncContext::new(token, state)));
            }

            match self
                .category
                .sync(self.stream.as_str(), token, state.clone(), events)
                .await?
            {
                SyncOutcome::Written { token, state } => {
                    return Ok((result, SyncContext::new(token, state)));
                },
                SyncOutcome::Conflict { .. } => {
                    if attempt >= self.max_attempts {
                        return Err((*self.on_exhausted)(attempt));
                    }

                    let started = Instant::now();
                    let reload = self
                        .category
                        .load_from_token(true, self.stream.as_str(), token, state)
                        .boxed();

                    let (resynced_token, resynced_state) =
                        self.resync_policy.resync(attempt, reload).await?;

                    self.observer.resync(&ResyncMetric {
                        stream: self.stream.as_str(),
                        elapsed: started.elapsed(),
                        attempt,
                    });

                    token = resynced_token;
                    state = resynced_state;
                    attempt += 1;
                },
            }
        }
    }

    /// Runs a decision producing events only.
    pub async fn transact<I>(
        &self,
        interpret: I,
        option: LoadOption<F::State>,
    ) -> Result<(), Error>
    where
        I: Fn(&F::State) -> Vec<F::Event> + Send + Sync,
    {
        self.run(move |ctx| ready(((), interpret(ctx.state()))), option)
            .await
            .map(|_| ())
    }

    /// Runs a decision producing events only, then renders a view of the
    /// final state.
    pub async fn transact_project<I, P, V>(
        &self,
        interpret: I,
        render: P,
        option: LoadOption<F::State>,
    ) -> Result<V, Error>
    where
        I: Fn(&F::State) -> Vec<F::Event> + Send + Sync,
        P: FnOnce(&F::State) -> V,
    {
        let ((), ctx) = self
            .run(move |ctx| ready(((), interpret(ctx.state()))), option)
            .await?;

        Ok(render(ctx.state()))
    }

    /// Runs a decision producing a result alongside its events.
    pub async fn transact_result<D, R>(
        &self,
        decide: D,
        option: LoadOption<F::State>,
    ) -> Result<R, Error>
    where
        D: Fn(&F::State) -> (R, Vec<F::Event>) + Send + Sync,
        R: Send,
    {
        self.run(move |ctx| ready(decide(ctx.state())), option)
            .await
            .map(|(result, _)| result)
    }

    /// Runs a decision producing a result, then maps it together with the
    /// final state.
    pub async fn transact_result_project<D, M, R, V>(
        &self,
        decide: D,
        map_result: M,
        option: LoadOption<F::State>,
    ) -> Result<V, Error>
    where
        D: Fn(&F::State) -> (R, Vec<F::Event>) + Send + Sync,
        M: FnOnce(R, &F::State) -> V,
        R: Send,
    {
        let (result, ctx) = self
            .run(move |ctx| ready(decide(ctx.state())), option)
            .await?;

        Ok(map_result(result, ctx.state()))
    }

    /// Runs a decision against the full [`SyncContext`], surfacing version,
    /// size and memento access.
    pub async fn transact_ex<D, R>(
        &self,
        decide: D,
        option: LoadOption<F::State>,
    ) -> Result<R, Error>
    where
        D: Fn(&SyncContext<F::State>) -> (R, Vec<F::Event>) + Send + Sync,
        R: Send,
    {
        self.run(move |ctx| ready(decide(&ctx)), option)
            .await
            .map(|(result, _)| result)
    }

    /// [`transact_ex`][Decider::transact_ex] with a mapping over the final
    /// context.
    pub async fn transact_ex_project<D, M, R, V>(
        &self,
        decide: D,
        map_result: M,
        option: LoadOption<F::State>,
    ) -> Result<V, Error>
    where
        D: Fn(&SyncContext<F::State>) -> (R, Vec<F::Event>) + Send + Sync,
        M: FnOnce(R, &SyncContext<F::State>) -> V,
        R: Send,
    {
        let (result, ctx) = self.run(move |ctx| ready(decide(&ctx)), option).await?;

        Ok(map_result(result, &ctx))
    }

    /// Runs a suspendable decision against the full [`SyncContext`].
    pub async fn transact_async<D, Fut, R>(
        &self,
        decide: D,
        option: LoadOption<F::State>,
    ) -> Result<R, Error>
    where
        D: Fn(SyncContext<F::State>) -> Fut + Send + Sync,
        Fut: Future<Output = (R, Vec<F::Event>)> + Send,
        R: Send,
    {
        self.run(decide, option).await.map(|(result, _)| result)
    }

    /// Renders a view of the stream state; never writes.
    pub async fn query<P, V>(&self, render: P, option: LoadOption<F::State>) -> Result<V, Error>
    where
        P: FnOnce(&F::State) -> V,
    {
        let (_, state) = self.load_for(option).await?;

        Ok(render(&state))
    }

    /// Renders a view of the full [`SyncContext`]; never writes.
    pub async fn query_ex<P, V>(&self, render: P, option: LoadOption<F::State>) -> Result<V, Error>
    where
        P: FnOnce(&SyncContext<F::State>) -> V,
    {
        let (token, state) = self.load_for(option).await?;

        Ok(render(&SyncContext::new(token, state)))
    }

    /// Renders a view through a suspendable projection; never writes.
    pub async fn query_async<P, Fut, V>(
        &self,
        render: P,
        option: LoadOption<F::State>,
    ) -> Result<V, Error>
    where
        P: FnOnce(SyncContext<F::State>) -> Fut + Send,
        Fut: Future<Output = V> + Send,
    {
        let (token, state) = self.load_for(option).await?;

        Ok(render(SyncContext::new(token, state)).await)
    }
}
