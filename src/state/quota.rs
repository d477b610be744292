use crate::config::RateLimitConfig;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Length of the local burst-control window, in seconds
const WINDOW_SECS: i64 = 60;

/// Requests in the window above which the pace drops to one per second
const BUSY_WINDOW_REQUESTS: usize = 60;

/// Requests in the window above which the pace drops to two per second
const ACTIVE_WINDOW_REQUESTS: usize = 30;

/// Floor for the proportional spread of the remaining quota
const MIN_SPREAD_DELAY: Duration = Duration::from_millis(500);

/// Quota state as last reported by the API
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub consecutive_failure_count: u32,
    /// Sticky for the lifetime of the gate once switched on
    pub conservative_mode_enabled: bool,
}

impl QuotaStatus {
    fn initial(now: DateTime<Utc>) -> Self {
        Self {
            limit: 5000,
            remaining: 5000,
            reset_at: now + ChronoDuration::hours(1),
            consecutive_failure_count: 0,
            conservative_mode_enabled: false,
        }
    }

    /// Time left until the quota window resets, never negative
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Authoritative quota values extracted from response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaHeaders {
    /// Reads `x-ratelimit-limit`, `x-ratelimit-remaining` and `x-ratelimit-reset`
    ///
    /// Returns None unless all three are present and parse; a partial set is
    /// not trusted over the current status.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let number = |name: &str| -> Option<i64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        };

        let limit = u64::try_from(number("x-ratelimit-limit")?).ok()?;
        let remaining = u64::try_from(number("x-ratelimit-remaining")?).ok()?;
        let reset_at = Utc.timestamp_opt(number("x-ratelimit-reset")?, 0).single()?;

        Some(Self {
            limit,
            remaining,
            reset_at,
        })
    }
}

/// Snapshot of the quota pushed to the progress collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSummary {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub seconds_until_reset: u64,
    pub conservative_mode: bool,
    pub usage_percentage: f64,
}

/// Tunables of the gate, taken from `[rate-limit]`
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub buffer: u64,
    pub min_delay: Duration,
    pub exhausted_padding: Duration,
    pub rejection_padding: Duration,
    pub conservative_after: u32,
}

impl From<&RateLimitConfig> for QuotaPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            buffer: config.buffer,
            min_delay: Duration::from_millis(config.min_delay_ms),
            exhausted_padding: Duration::from_secs(config.exhausted_padding_secs),
            rejection_padding: Duration::from_secs(config.rejection_padding_secs),
            conservative_after: config.conservative_after,
        }
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

#[derive(Debug)]
struct GateState {
    status: QuotaStatus,
    recent_requests: VecDeque<DateTime<Utc>>,
}

impl GateState {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.recent_requests.front() {
            if now - *oldest >= ChronoDuration::seconds(WINDOW_SECS) {
                self.recent_requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Tracks the remaining request allowance and paces outbound calls
///
/// One gate is shared by every request of a run. All state sits behind a
/// single mutex; methods never block on I/O while holding it.
///
/// Methods ending in `_at` take the current time explicitly so the pacing
/// rules can be exercised without sleeping.
#[derive(Debug)]
pub struct QuotaGate {
    policy: QuotaPolicy,
    state: Mutex<GateState>,
}

impl QuotaGate {
    /// Creates a gate with the default starting allowance
    pub fn new(policy: QuotaPolicy) -> Self {
        Self::new_at(policy, Utc::now())
    }

    pub fn new_at(policy: QuotaPolicy, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            state: Mutex::new(GateState {
                status: QuotaStatus::initial(now),
                recent_requests: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Returns a copy of the current status
    pub fn status(&self) -> QuotaStatus {
        self.lock().status.clone()
    }

    /// Overwrites the status with server-reported values
    ///
    /// A successful authoritative update also clears the rejection streak.
    pub fn update_from_authoritative_headers(&self, headers: QuotaHeaders) {
        let mut state = self.lock();
        state.status.limit = headers.limit;
        state.status.remaining = headers.remaining;
        state.status.reset_at = headers.reset_at;
        state.status.consecutive_failure_count = 0;
    }

    fn buffer(&self, status: &QuotaStatus) -> u64 {
        if status.conservative_mode_enabled {
            self.policy.buffer.saturating_mul(2)
        } else {
            self.policy.buffer
        }
    }

    /// True when `n` more requests still leave the buffer untouched
    pub fn is_safe(&self, n: u64) -> bool {
        let state = self.lock();
        state.status.remaining > n.saturating_add(self.buffer(&state.status))
    }

    /// Computes how long to wait before issuing the next `n` requests
    pub fn delay_before_next(&self, n: u64) -> Duration {
        self.delay_before_next_at(n, Utc::now())
    }

    pub fn delay_before_next_at(&self, n: u64, now: DateTime<Utc>) -> Duration {
        let mut state = self.lock();
        let status = state.status.clone();
        let buffer = self.buffer(&status);

        if status.remaining > n.saturating_add(buffer) {
            state.prune(now);
            return match state.recent_requests.len() {
                count if count > BUSY_WINDOW_REQUESTS => Duration::from_secs(1),
                count if count > ACTIVE_WINDOW_REQUESTS => Duration::from_millis(500),
                _ => self.policy.min_delay,
            };
        }

        let until_reset = status.until_reset(now);

        // Not enough allowance left for the request plus the base reserve:
        // sit out the window.
        if status.is_exhausted() || n.saturating_add(self.policy.buffer) >= status.remaining {
            return until_reset + self.policy.exhausted_padding;
        }

        // Only reachable in conservative mode, where the doubled buffer opens
        // a band between the base reserve and the conservative one.
        let spread = until_reset.div_f64(status.remaining as f64);
        spread.max(MIN_SPREAD_DELAY)
    }

    /// Records an explicit quota rejection and returns how long to back off
    ///
    /// Repeated rejections switch conservative mode on for the rest of the
    /// gate's lifetime.
    pub fn on_rate_limit_rejection(&self, headers: Option<QuotaHeaders>) -> Duration {
        self.on_rate_limit_rejection_at(headers, Utc::now())
    }

    pub fn on_rate_limit_rejection_at(
        &self,
        headers: Option<QuotaHeaders>,
        now: DateTime<Utc>,
    ) -> Duration {
        let mut state = self.lock();
        if let Some(headers) = headers {
            state.status.limit = headers.limit;
            state.status.remaining = headers.remaining;
            state.status.reset_at = headers.reset_at;
        }

        state.status.consecutive_failure_count += 1;
        if state.status.consecutive_failure_count >= self.policy.conservative_after
            && !state.status.conservative_mode_enabled
        {
            state.status.conservative_mode_enabled = true;
            tracing::warn!(
                rejections = state.status.consecutive_failure_count,
                "Enabling conservative mode after repeated quota rejections"
            );
        }

        state.status.until_reset(now) + self.policy.rejection_padding
    }

    /// Notes that a request is about to leave
    pub fn record_issued(&self) {
        self.record_issued_at(Utc::now());
    }

    pub fn record_issued_at(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.prune(now);
        state.recent_requests.push_back(now);
    }

    /// Number of requests issued within the last minute
    pub fn recent_request_count_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        state.prune(now);
        state.recent_requests.len()
    }

    /// Produces the summary pushed to progress listeners
    pub fn summary(&self) -> QuotaSummary {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> QuotaSummary {
        let status = self.status();
        let usage_percentage = if status.limit == 0 {
            0.0
        } else {
            status.limit.saturating_sub(status.remaining) as f64 / status.limit as f64 * 100.0
        };

        QuotaSummary {
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
            seconds_until_reset: status.until_reset(now).as_secs(),
            conservative_mode: status.conservative_mode_enabled,
            usage_percentage,
        }
    }
}

impl Default for QuotaGate {
    fn default() -> Self {
        Self::new(QuotaPolicy::default())
    }
}
