//! Retry and failover loop.
//!
//! [`RetryExecutor::run`] drives attempts explicitly: each attempt allocates
//! its own target, the previous attempt (and its lease) is dropped before the
//! backoff sleep, and [`RetryExecutor::classify`] decides what happens next.
//! Only response heads are retried; once a response is returned its body is
//! streamed to the client as-is.

use std::future::Future;
use std::time::Duration;

use http::StatusCode;
use tracing::debug;

use edgeway_resources::{RetrySpec, StatusCodeSpec};

use crate::error::BuildError;

/// Backoff stops growing after this many base intervals.
const MAX_BACKOFF_MULTIPLIER: u32 = 10;

/// Set of status codes in `100..=599`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StatusSet {
    bits: [u64; 10],
}

impl StatusSet {
    fn insert(&mut self, code: u16) {
        let code = usize::from(code);
        if code < 640 {
            self.bits[code / 64] |= 1 << (code % 64);
        }
    }

    fn contains(&self, code: u16) -> bool {
        let code = usize::from(code);
        code < 640 && self.bits[code / 64] & (1 << (code % 64)) != 0
    }
}

/// Compiled retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    num_retries: u32,
    retry_on: StatusSet,
    backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_spec(spec: &RetrySpec) -> Result<Self, BuildError> {
        let mut retry_on = StatusSet::default();
        for entry in &spec.retry_on {
            match entry {
                StatusCodeSpec::Code(code) if (100..=599).contains(code) => retry_on.insert(*code),
                StatusCodeSpec::Code(code) => {
                    return Err(BuildError::InvalidRetryOn(code.to_string()))
                }
                StatusCodeSpec::Pattern(pattern) => {
                    for code in expand_pattern(pattern)? {
                        retry_on.insert(code);
                    }
                }
            }
        }

        let backoff_base = Duration::try_from_secs_f64(spec.backoff_base_interval)
            .unwrap_or(Duration::ZERO);

        Ok(Self {
            num_retries: spec.num_retries,
            retry_on,
            backoff_base,
        })
    }

    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    pub fn should_retry(&self, status: StatusCode) -> bool {
        self.retry_on.contains(status.as_u16())
    }

    /// Delay before retry number `retries` (1-based).
    pub fn backoff(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(31);
        let multiplier = (1u32 << exponent).min(MAX_BACKOFF_MULTIPLIER);
        self.backoff_base * multiplier
    }
}

/// `"503"` is one code; `"5xx"` is the whole class.
fn expand_pattern(pattern: &str) -> Result<Vec<u16>, BuildError> {
    let invalid = || BuildError::InvalidRetryOn(pattern.to_string());
    let pattern = pattern.trim();

    if let Some(class) = pattern
        .strip_suffix("xx")
        .or_else(|| pattern.strip_suffix("XX"))
    {
        let digit: u16 = class.parse().map_err(|_| invalid())?;
        if !(1..=5).contains(&digit) {
            return Err(invalid());
        }
        return Ok((digit * 100..digit * 100 + 100).collect());
    }

    let code: u16 = pattern.parse().map_err(|_| invalid())?;
    if !(100..=599).contains(&code) {
        return Err(invalid());
    }
    Ok(vec![code])
}

/// Balancer tier an attempt runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Failover,
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Failover,
    Conclude,
}

/// Result of one attempt as seen by the loop.
///
/// `status` is `None` when no response head was received: no target was
/// available, or the upstream failed at the transport level.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: T,
    pub status: Option<StatusCode>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub target: Option<String>,
    pub succeeded: bool,
}

/// Per-request retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryContext {
    pub attempts: u32,
    pub retries: u32,
    pub total_backoff: Duration,
    pub outcomes: Vec<AttemptOutcome>,
    pub limit_exceeded: bool,
    pub failed_over: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor<'a> {
    policy: Option<&'a RetryPolicy>,
    has_failover: bool,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: Option<&'a RetryPolicy>, has_failover: bool) -> Self {
        Self {
            policy,
            has_failover,
        }
    }

    /// Whether any attempt beyond the first can happen. Request bodies are
    /// only buffered for replay when this holds.
    pub fn may_replay(&self) -> bool {
        self.has_failover || self.policy.is_some_and(|p| p.num_retries > 0)
    }

    fn is_retryable(&self, status: Option<StatusCode>) -> bool {
        match (self.policy, status) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(policy), Some(status)) => policy.should_retry(status),
        }
    }

    pub fn classify(&self, status: Option<StatusCode>, ctx: &RetryContext) -> RetryDecision {
        if ctx.failed_over {
            return RetryDecision::Conclude;
        }
        if let Some(policy) = self.policy {
            if self.is_retryable(status) && ctx.retries < policy.num_retries {
                return RetryDecision::Retry;
            }
        }
        let upstream_failed = status.is_none_or(|s| s.as_u16() > 499);
        if self.has_failover && upstream_failed {
            return RetryDecision::Failover;
        }
        RetryDecision::Conclude
    }

    /// Run attempts until one concludes. The concluding attempt is returned
    /// unchanged; every earlier attempt is dropped before the next starts.
    pub async fn run<T, F, Fut>(&self, ctx: &mut RetryContext, mut attempt: F) -> Attempted<T>
    where
        F: FnMut(Tier) -> Fut,
        Fut: Future<Output = Attempted<T>>,
    {
        let mut tier = Tier::Primary;
        loop {
            ctx.attempts += 1;
            let outcome = attempt(tier).await;
            ctx.outcomes.push(AttemptOutcome {
                target: outcome.target.clone(),
                succeeded: outcome.status.is_some_and(|s| !s.is_server_error()),
            });

            let decision = self.classify(outcome.status, ctx);
            if decision != RetryDecision::Retry && self.is_retryable(outcome.status) {
                ctx.limit_exceeded = true;
            }

            match decision {
                RetryDecision::Retry => {
                    drop(outcome);
                    ctx.retries += 1;
                    let delay = self
                        .policy
                        .map(|p| p.backoff(ctx.retries))
                        .unwrap_or(Duration::ZERO);
                    ctx.total_backoff += delay;
                    debug!(
                        attempt = ctx.attempts,
                        retries = ctx.retries,
                        backoff_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Failover => {
                    drop(outcome);
                    debug!(attempt = ctx.attempts, "Failing over");
                    ctx.failed_over = true;
                    tier = Tier::Failover;
                }
                RetryDecision::Conclude => return outcome,
            }
        }
    }
}
