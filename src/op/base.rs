//! Generic authenticated-operation lifecycle.
//!
//! Every server interaction follows the same shape: check authentication
//! (triggering the session's single-flight login when needed), check the
//! cache, submit, and on failure consult the retry budget. The state table
//! makes the legal control flow explicit; the driver loop performs each
//! state's work and fires the next event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ContractError, Error, OpHandle, StateMachine};
use crate::session::SessionInner;

/// States of the base authenticated operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OpState {
    Init,
    AuthAttempt,
    CheckCache,
    Submit,
    Failed,
    Done,
}

/// Events driving the base authenticated operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OpEvent {
    AuthOk,
    AuthNotOk,
    AuthFailed,
    CacheHit,
    CacheMiss,
    ResponseOk,
    Exception,
    Retry,
    Abort,
}

fn op_machine() -> Result<StateMachine<OpState, OpEvent>, ContractError> {
    use OpEvent as E;
    use OpState as S;
    StateMachine::new(
        S::Init,
        &[S::Done],
        &[
            // Event            Current state        New state
            (E::AuthOk, Some(S::Init), S::CheckCache),
            (E::AuthNotOk, Some(S::Init), S::AuthAttempt),
            (E::AuthOk, Some(S::AuthAttempt), S::CheckCache),
            (E::AuthFailed, Some(S::AuthAttempt), S::Failed),
            (E::CacheHit, Some(S::CheckCache), S::Done),
            (E::CacheMiss, Some(S::CheckCache), S::Submit),
            (E::ResponseOk, Some(S::Submit), S::Done),
            (E::Exception, None, S::Failed),
            (E::Retry, Some(S::Failed), S::Init),
            (E::Abort, Some(S::Failed), S::Done),
        ],
    )
}

/// Outcome of the cache-check hook.
pub(crate) enum CacheOutcome<T> {
    /// Fresh cached value; the operation is already done.
    Hit(T),
    /// Nothing cached (or this operation claimed ownership); submit.
    Miss,
    /// Another in-flight operation owns this cache key; adopt its result.
    Piggyback(OpHandle<T>),
}

/// An operation run under the authenticated lifecycle.
#[async_trait]
pub(crate) trait AuthedOp: Send {
    type Output: Clone + Send + 'static;

    fn session(&self) -> &Arc<SessionInner>;

    /// Short name for tracing.
    fn name(&self) -> &str;

    /// Cache-check hook. The default is an unconditional miss.
    async fn check_cache(
        &mut self,
        own_handle: &OpHandle<Self::Output>,
    ) -> Result<CacheOutcome<Self::Output>, Error> {
        let _ = own_handle;
        Ok(CacheOutcome::Miss)
    }

    /// Perform the network call and produce the result.
    async fn submit(&mut self) -> Result<Self::Output, Error>;
}

/// Backoff schedule applied between failure and retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub backoff_multiplier: f32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero-based), exponential and
    /// capped.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f32;
        let backoff_ms = base_ms * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }
}

/// Spawn the driver task for an operation and hand back its result handle.
pub(crate) fn spawn_op<O>(op: O, retries: u32, policy: RetryPolicy) -> OpHandle<O::Output>
where
    O: AuthedOp + 'static,
{
    let handle = OpHandle::new();
    let driver_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = drive(op, &driver_handle, retries, policy).await {
            // Contract violations escape the state machine; they still
            // surface through the result path exactly once.
            driver_handle.complete(Err(err));
        }
    });
    handle
}

async fn drive<O: AuthedOp>(
    mut op: O,
    handle: &OpHandle<O::Output>,
    retries: u32,
    policy: RetryPolicy,
) -> Result<(), Error> {
    let mut machine = op_machine()?;
    let mut budget = retries;
    let mut value: Option<O::Output> = None;
    let mut failure: Option<Error> = None;

    loop {
        match machine.current() {
            OpState::Init => {
                if op.session().is_authenticated() {
                    machine.fire(OpEvent::AuthOk)?;
                } else {
                    machine.fire(OpEvent::AuthNotOk)?;
                }
            }
            OpState::AuthAttempt => {
                let auth = Arc::clone(op.session()).authenticate();
                auth.done().await;
                if !auth.is_failed() && op.session().is_authenticated() {
                    tracing::debug!(op = op.name(), "authenticated, trying again");
                    machine.fire(OpEvent::AuthOk)?;
                } else {
                    let reason = match auth.outcome() {
                        Some(Err(e)) => e.to_string(),
                        _ => "authentication did not establish a session".to_string(),
                    };
                    failure = Some(Error::auth(reason));
                    machine.fire(OpEvent::AuthFailed)?;
                }
            }
            OpState::CheckCache => match op.check_cache(handle).await {
                Ok(CacheOutcome::Hit(v)) => {
                    value = Some(v);
                    machine.fire(OpEvent::CacheHit)?;
                }
                Ok(CacheOutcome::Miss) => {
                    machine.fire(OpEvent::CacheMiss)?;
                }
                Ok(CacheOutcome::Piggyback(owner)) => {
                    tracing::debug!(op = op.name(), "piggy-backing on in-flight operation");
                    owner.done().await;
                    match owner.outcome() {
                        Some(Ok(v)) => {
                            value = Some(v);
                            machine.fire(OpEvent::CacheHit)?;
                        }
                        Some(Err(e)) => {
                            failure = Some(e);
                            machine.fire(OpEvent::Exception)?;
                        }
                        None => {
                            return Err(ContractError::NotReady.into());
                        }
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    machine.fire(OpEvent::Exception)?;
                }
            },
            OpState::Submit => match op.submit().await {
                Ok(v) => {
                    value = Some(v);
                    machine.fire(OpEvent::ResponseOk)?;
                }
                Err(e) => {
                    failure = Some(e);
                    machine.fire(OpEvent::Exception)?;
                }
            },
            OpState::Failed => {
                let err = failure.take().ok_or(ContractError::NotReady)?;
                if err.is_retryable() && budget > 0 {
                    let attempt = retries - budget;
                    budget -= 1;
                    tracing::warn!(
                        op = op.name(),
                        attempt = attempt + 1,
                        remaining = budget,
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                    machine.fire(OpEvent::Retry)?;
                } else {
                    failure = Some(err);
                    machine.fire(OpEvent::Abort)?;
                }
            }
            OpState::Done => {
                let result = match failure.take() {
                    Some(err) => Err(err),
                    None => value.take().ok_or(ContractError::NotReady).map_err(Error::from),
                };
                handle.complete(result);
                return Ok(());
            }
        }
    }
}
