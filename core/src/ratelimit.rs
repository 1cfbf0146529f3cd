//! Rate-limit bookkeeping for the two upstream budgets.
//!
//! The upstream meters single-entity REST calls and Sync-style command
//! batches separately. [`RateLimitTracker`] keeps one [`RateLimitBudget`] per
//! class behind its own lock, so consuming or observing one class can never
//! touch the other. The tracker only reports state; callers decide whether
//! to wait.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::http::HttpResponse;

/// Default `remaining` threshold below which a budget counts as low.
pub const DEFAULT_LOW_WATER_MARK: u32 = 10;

/// Longest wait or window the tracker will accept from upstream metadata.
pub const MAX_UPSTREAM_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Endpoint class an upstream call is metered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetClass {
    /// Single-entity REST calls (per-task bulk mutations).
    Rest,
    /// Batched command submissions.
    Sync,
}

impl fmt::Display for BudgetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetClass::Rest => write!(f, "rest"),
            BudgetClass::Sync => write!(f, "sync"),
        }
    }
}

/// Last known state of one budget class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitBudget {
    /// Calls left in the current window, if the upstream told us.
    pub remaining: Option<u32>,
    /// When the window (or the current 429 back-off) ends.
    pub reset_time: Option<Instant>,
    /// Set by a 429 until `reset_time` passes.
    pub is_limited: bool,
}

impl RateLimitBudget {
    fn expire(&mut self, now: Instant) {
        if self.reset_time.is_some_and(|reset| reset <= now) {
            *self = RateLimitBudget::default();
        }
    }

    fn wait_from(&self, now: Instant) -> Option<Duration> {
        self.reset_time.map(|reset| reset.saturating_duration_since(now))
    }
}

/// Outcome of [`RateLimitTracker::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// How long until the budget is expected to allow calls again.
    pub wait_hint: Option<Duration>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            wait_hint: None,
        }
    }

    fn wait(hint: Option<Duration>) -> Self {
        Self {
            allowed: false,
            wait_hint: hint,
        }
    }
}

/// Rate-limit values parsed from one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &[(String, String)]) -> Self {
        let find = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        };
        Self {
            remaining: find(REMAINING_HEADER).and_then(|v| v.parse().ok()),
            reset_after: find(RESET_HEADER).and_then(parse_seconds),
            retry_after: find(RETRY_AFTER_HEADER).and_then(parse_seconds),
        }
    }
}

/// Parses a non-negative, possibly fractional, number of seconds, capped at
/// [`MAX_UPSTREAM_WAIT`].
pub fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs.min(MAX_UPSTREAM_WAIT.as_secs_f64())).ok()
}

/// `now + wait`, with `wait` capped at [`MAX_UPSTREAM_WAIT`].
fn instant_after(now: Instant, wait: Duration) -> Instant {
    let wait = wait.min(MAX_UPSTREAM_WAIT);
    now.checked_add(wait).unwrap_or(now)
}

/// The wait a 429 response advertises: the `retry-after` header, falling back
/// to `error_extra.retry_after` in the JSON body.
pub fn advertised_wait(response: &HttpResponse) -> Option<Duration> {
    if let Some(wait) = response.header(RETRY_AFTER_HEADER).and_then(parse_seconds) {
        return Some(wait);
    }
    let body: serde_json::Value = serde_json::from_str(&response.body).ok()?;
    let secs = body.get("error_extra")?.get("retry_after")?.as_f64()?;
    parse_seconds(&secs.to_string())
}

/// Shared, thread-safe view of both budgets.
///
/// Constructed explicitly and injected into the engine; there is no global
/// instance.
#[derive(Debug)]
pub struct RateLimitTracker {
    rest: Mutex<RateLimitBudget>,
    sync: Mutex<RateLimitBudget>,
    low_water_mark: u32,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_WATER_MARK)
    }
}

impl RateLimitTracker {
    #[must_use]
    pub fn new(low_water_mark: u32) -> Self {
        Self {
            rest: Mutex::new(RateLimitBudget::default()),
            sync: Mutex::new(RateLimitBudget::default()),
            low_water_mark,
        }
    }

    fn budget(&self, class: BudgetClass) -> &Mutex<RateLimitBudget> {
        match class {
            BudgetClass::Rest => &self.rest,
            BudgetClass::Sync => &self.sync,
        }
    }

    /// Asks to spend one call from `class`.
    ///
    /// Refused while a 429 back-off is active or the upstream reported zero
    /// calls left in a window that has not reset yet. With no information
    /// the call is allowed.
    pub fn consume(&self, class: BudgetClass) -> Admission {
        let now = Instant::now();
        let mut budget = self.budget(class).lock();
        budget.expire(now);

        if budget.is_limited {
            return Admission::wait(budget.wait_from(now));
        }
        match budget.remaining {
            Some(0) if budget.reset_time.is_some() => Admission::wait(budget.wait_from(now)),
            Some(n) => {
                budget.remaining = Some(n.saturating_sub(1));
                Admission::allowed()
            }
            None => Admission::allowed(),
        }
    }

    /// Folds the rate-limit metadata of a response into `class`.
    ///
    /// Called after every upstream call, successful or not.
    pub fn observe(&self, class: BudgetClass, status: u16, headers: &[(String, String)]) {
        let parsed = RateLimitHeaders::parse(headers);
        let now = Instant::now();
        let mut budget = self.budget(class).lock();
        budget.expire(now);

        if let Some(remaining) = parsed.remaining {
            budget.remaining = Some(remaining);
        }
        // A sibling's late success must not move an active back-off window.
        if status != 429 && budget.is_limited {
            return;
        }
        if let Some(reset) = parsed.reset_after {
            budget.reset_time = Some(instant_after(now, reset));
        }
        if status == 429 {
            if let Some(wait) = parsed.retry_after {
                budget.reset_time = Some(instant_after(now, wait));
            }
            // Without a known end the back-off is left to `mark_limited`.
            budget.is_limited = budget.reset_time.is_some();
        }
    }

    /// Holds every caller of `class` back for `wait`. Never shortens an
    /// existing back-off.
    pub fn mark_limited(&self, class: BudgetClass, wait: Duration) {
        let until = instant_after(Instant::now(), wait);
        let mut budget = self.budget(class).lock();
        budget.is_limited = true;
        budget.reset_time = Some(budget.reset_time.map_or(until, |t| t.max(until)));
    }

    /// Whether `remaining` is known and below the low-water mark.
    pub fn is_low(&self, class: BudgetClass) -> bool {
        self.budget(class)
            .lock()
            .remaining
            .is_some_and(|r| r < self.low_water_mark)
    }

    pub fn snapshot(&self, class: BudgetClass) -> RateLimitBudget {
        let mut budget = self.budget(class).lock();
        budget.expire(Instant::now());
        budget.clone()
    }
}
