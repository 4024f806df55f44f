//! Rate-limit accounting (spec §4.4): Redis-first cost/RPM/concurrency
//! accounting with SQL warm-up, Lua scripts for atomic rolling windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::limits::{DailyResetMode, KeyLimits, SpendLimits, UserLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Key,
    User,
    Provider,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Key => "key",
            Scope::User => "user",
            Scope::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Total,
    FiveHour,
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    fn as_str(&self) -> &'static str {
        match self {
            Period::Total => "total",
            Period::FiveHour => "5h",
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }

    fn window(&self) -> Option<TimeDuration> {
        match self {
            Period::FiveHour => Some(TimeDuration::hours(5)),
            Period::Daily => Some(TimeDuration::days(1)),
            Period::Weekly => Some(TimeDuration::days(7)),
            Period::Monthly => Some(TimeDuration::days(30)),
            Period::Total => None,
        }
    }

    /// Whether this period is stored as a Redis rolling window (sorted set)
    /// rather than a fixed wall-clock counter, given the owner's reset mode.
    fn is_rolling(&self, mode: DailyResetMode) -> bool {
        match self {
            Period::FiveHour => true,
            Period::Daily => mode == DailyResetMode::Rolling,
            Period::Weekly | Period::Monthly | Period::Total => false,
        }
    }
}

/// Surfaced to callers as a typed variant, never as an exception — only the
/// outermost HTTP handler converts this into a response (spec §9).
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: String,
    pub current_usage: f64,
    pub limit_value: f64,
    pub reset_time: String,
}

impl RateLimitError {
    /// `429` for `rpm`/`concurrent_sessions`, `402` for spend limits (spec §4.2h).
    pub fn status_code(&self) -> u16 {
        match self.limit_type.as_str() {
            "rpm" | "concurrent_sessions" => 429,
            _ => 402,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostSample {
    pub cost: f64,
    pub at: OffsetDateTime,
}

/// Backing store for cost/RPM/concurrency accounting. `RedisRateLimitStore`
/// is the production implementation; `InMemoryRateLimitStore` is the
/// single-process fallback used when `redis_url` is unset, so the gateway
/// still enforces limits (just without cross-process sharing).
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Sum of cost recorded for `(scope, id, period)` within the live window
    /// (rolling) or since the current fixed-window boundary (fixed).
    /// `daily_reset_time` (`HH:mm`) only matters for a fixed-window `Daily`
    /// lookup; every other period ignores it.
    async fn cost_sum(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
    ) -> f64;

    /// Requests in the last 60s for `(scope, id)`.
    async fn rpm_count(&self, scope: Scope, id: &str) -> u32;

    /// Atomic admission check against `limit_concurrent_sessions`. Returns
    /// `(allowed, count_after)`.
    async fn try_admit_concurrent(&self, owner_key: &str, session_id: &str, limit: u32) -> (bool, u32);

    async fn release_concurrent(&self, owner_key: &str, session_id: &str);

    /// Records a successful request's cost against every period family for
    /// the given scope/id, plus a timestamp for RPM accounting.
    async fn track_success(
        &self,
        scope: Scope,
        id: &str,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
        cost: f64,
    );

    /// Called once by the rate-limit guard when a key is absent from the hot
    /// store (vs. present-and-zero) so the engine can rebuild it from SQL.
    async fn warm_from_sql(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        daily_reset_time: Option<&str>,
        samples: Vec<CostSample>,
    );

    /// Binds a session to the provider that served it (spec §4.3 "Session
    /// reuse": `sess:<id>:provider`), so a later request in the same session
    /// can skip full selection via `ProviderSelector::validate_reuse`.
    async fn bind_session_provider(&self, session_id: &str, provider_id: i64);

    /// Looks up the provider bound to a session, if any and not expired.
    async fn get_session_provider(&self, session_id: &str) -> Option<i64>;
}

/// Session->provider bindings expire with the session; there is no explicit
/// session-close signal, so this bounds staleness instead (spec §4.3 notes
/// reuse only matters within a single multi-turn conversation).
const SESSION_PROVIDER_TTL_SECS: i64 = 6 * 3600;

fn owner_redis_key(scope: Scope, id: &str, period: Period, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{}:{}:cost_{}_{}", scope.as_str(), id, period.as_str(), s),
        None => format!("{}:{}:cost_{}", scope.as_str(), id, period.as_str()),
    }
}

/// Parses a `HH:mm` reset time. Returns `None` on anything malformed so
/// callers can fall back to UTC midnight rather than fail the request.
fn parse_hhmm(raw: &str) -> Option<(u8, u8)> {
    let (h, m) = raw.split_once(':')?;
    let hour: u8 = h.trim().parse().ok()?;
    let minute: u8 = m.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// `_{HHMM}` suffix spec §4.4 appends to a `Daily` fixed-window key so
/// owners configured with different `dailyResetTime`s never share a
/// counter or TTL.
fn daily_reset_suffix(daily_reset_time: Option<&str>) -> String {
    let (hour, minute) = parse_hhmm(daily_reset_time.unwrap_or("00:00")).unwrap_or((0, 0));
    format!("{hour:02}{minute:02}")
}

/// Next wall-clock occurrence of `daily_reset_time` (`HH:mm`, UTC), i.e. the
/// boundary a `Daily`/Fixed counter resets at.
fn next_daily_reset_utc(now: OffsetDateTime, daily_reset_time: Option<&str>) -> OffsetDateTime {
    let (hour, minute) = parse_hhmm(daily_reset_time.unwrap_or("00:00")).unwrap_or((0, 0));
    let today = now
        .date()
        .with_hms(hour, minute, 0)
        .map(|dt| dt.assume_utc())
        .unwrap_or_else(|_| now.date().midnight().assume_utc());
    if today > now {
        today
    } else {
        today + TimeDuration::days(1)
    }
}

/// The twelve-step check (spec §4.4), short-circuiting on first failure.
/// Callers pass `key_id`/`user_id` as opaque store identifiers (typically
/// the numeric row id formatted as a string) along with the decoded limits.
pub async fn check_twelve_steps(
    store: &dyn RateLimitStore,
    key_id: &str,
    key_limits: &KeyLimits,
    user_id: &str,
    user_limits: &UserLimits,
    session_id: &str,
) -> Result<(), RateLimitError> {
    check_spend(store, Scope::Key, key_id, &key_limits.spend, Period::Total, DailyResetMode::Fixed, None).await?;
    check_spend(store, Scope::User, user_id, &user_limits.spend, Period::Total, DailyResetMode::Fixed, None).await?;

    if let Some(limit) = key_limits.limit_concurrent_sessions {
        let owner_key = format!("key:{key_id}:concurrent");
        let (allowed, count) = store.try_admit_concurrent(&owner_key, session_id, limit).await;
        if !allowed {
            return Err(RateLimitError {
                limit_type: "concurrent_sessions".to_string(),
                current_usage: count as f64,
                limit_value: limit as f64,
                reset_time: far_future_reset(),
            });
        }
    }

    if let Some(limit) = user_limits.rpm {
        let current = store.rpm_count(Scope::User, user_id).await;
        if current >= limit {
            return Err(RateLimitError {
                limit_type: "rpm".to_string(),
                current_usage: current as f64,
                limit_value: limit as f64,
                reset_time: next_minute_reset(),
            });
        }
    }

    check_spend(store, Scope::Key, key_id, &key_limits.spend, Period::FiveHour, DailyResetMode::Fixed, None).await?;
    check_spend(store, Scope::User, user_id, &user_limits.spend, Period::FiveHour, DailyResetMode::Fixed, None).await?;
    check_spend(
        store,
        Scope::Key,
        key_id,
        &key_limits.spend,
        Period::Daily,
        user_limits.daily_reset_mode,
        Some(user_limits.daily_reset_time.as_str()),
    )
    .await?;
    check_spend(
        store,
        Scope::User,
        user_id,
        &user_limits.spend,
        Period::Daily,
        user_limits.daily_reset_mode,
        Some(user_limits.daily_reset_time.as_str()),
    )
    .await?;
    check_spend(store, Scope::Key, key_id, &key_limits.spend, Period::Weekly, DailyResetMode::Fixed, None).await?;
    check_spend(store, Scope::User, user_id, &user_limits.spend, Period::Weekly, DailyResetMode::Fixed, None).await?;
    check_spend(store, Scope::Key, key_id, &key_limits.spend, Period::Monthly, DailyResetMode::Fixed, None).await?;
    check_spend(store, Scope::User, user_id, &user_limits.spend, Period::Monthly, DailyResetMode::Fixed, None).await?;

    Ok(())
}

async fn check_spend(
    store: &dyn RateLimitStore,
    scope: Scope,
    id: &str,
    spend: &SpendLimits,
    period: Period,
    mode: DailyResetMode,
    daily_reset_time: Option<&str>,
) -> Result<(), RateLimitError> {
    let Some(limit) = spend_limit_for(spend, period) else {
        return Ok(());
    };
    let current = store.cost_sum(scope, id, period, mode, daily_reset_time).await;
    if current > limit {
        return Err(RateLimitError {
            limit_type: spend_limit_type(period),
            current_usage: current,
            limit_value: limit,
            reset_time: reset_time_for(period, mode, daily_reset_time),
        });
    }
    Ok(())
}

fn spend_limit_for(spend: &SpendLimits, period: Period) -> Option<f64> {
    match period {
        Period::Total => spend.total,
        Period::FiveHour => spend.five_hour,
        Period::Daily => spend.daily,
        Period::Weekly => spend.weekly,
        Period::Monthly => spend.monthly,
    }
}

fn spend_limit_type(period: Period) -> String {
    match period {
        Period::Total => "usd_total".to_string(),
        Period::FiveHour => "usd_5h".to_string(),
        Period::Daily => "usd_daily".to_string(),
        Period::Weekly => "usd_weekly".to_string(),
        Period::Monthly => "usd_monthly".to_string(),
    }
}

fn far_future_reset() -> String {
    "9999-12-31T23:59:59.999Z".to_string()
}

fn next_minute_reset() -> String {
    let next = OffsetDateTime::now_utc() + TimeDuration::minutes(1);
    next.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| far_future_reset())
}

fn reset_time_for(period: Period, mode: DailyResetMode, daily_reset_time: Option<&str>) -> String {
    let now = OffsetDateTime::now_utc();
    let next = match period {
        Period::FiveHour => now + TimeDuration::hours(5),
        Period::Daily if mode == DailyResetMode::Rolling => now + TimeDuration::days(1),
        Period::Daily => next_daily_reset_utc(now, daily_reset_time),
        Period::Weekly => next_monday_midnight_utc(now),
        Period::Monthly => next_month_start_utc(now),
        Period::Total => return far_future_reset(),
    };
    next.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| far_future_reset())
}

fn next_monday_midnight_utc(now: OffsetDateTime) -> OffsetDateTime {
    use time::Weekday;
    let mut date = now.date();
    loop {
        date = date.next_day().unwrap_or(date);
        if date.weekday() == Weekday::Monday {
            break;
        }
    }
    date.midnight().assume_utc()
}

fn next_month_start_utc(now: OffsetDateTime) -> OffsetDateTime {
    let (year, month, _) = (now.year(), now.month(), now.day());
    let (next_year, next_month) = if month as u8 == 12 {
        (year + 1, time::Month::January)
    } else {
        (year, month.next())
    };
    time::Date::from_calendar_date(next_year, next_month, 1)
        .unwrap_or(now.date())
        .midnight()
        .assume_utc()
}

/// Single-process, in-memory fallback used when `redis_url` is unset.
/// Same accounting semantics as the Redis store (rolling sums, fixed
/// counters reset at the next boundary), just not shared across processes.
pub struct InMemoryRateLimitStore {
    rolling: Mutex<HashMap<(Scope, String, Period), Vec<CostSample>>>,
    fixed: Mutex<HashMap<(Scope, String, Period), (f64, OffsetDateTime)>>,
    rpm: Mutex<HashMap<(Scope, String), Vec<OffsetDateTime>>>,
    concurrent: Mutex<HashMap<String, Vec<String>>>,
    session_provider: Mutex<HashMap<String, (i64, OffsetDateTime)>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rolling: Mutex::new(HashMap::new()),
            fixed: Mutex::new(HashMap::new()),
            rpm: Mutex::new(HashMap::new()),
            concurrent: Mutex::new(HashMap::new()),
            session_provider: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self {
            rolling: Mutex::new(HashMap::new()),
            fixed: Mutex::new(HashMap::new()),
            rpm: Mutex::new(HashMap::new()),
            concurrent: Mutex::new(HashMap::new()),
            session_provider: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn cost_sum(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
    ) -> f64 {
        let now = OffsetDateTime::now_utc();
        if period.is_rolling(mode) {
            let window = period.window().unwrap_or(TimeDuration::hours(5));
            let mut guard = self.rolling.lock().await;
            let entry = guard
                .entry((scope, id.to_string(), period))
                .or_default();
            entry.retain(|s| now - s.at <= window);
            entry.iter().map(|s| s.cost).sum()
        } else {
            let mut guard = self.fixed.lock().await;
            let key = (scope, id.to_string(), period);
            match guard.get(&key) {
                Some((sum, reset_at)) if *reset_at > now => *sum,
                _ => {
                    guard.insert(key, (0.0, reset_boundary_after(period, now, daily_reset_time)));
                    0.0
                }
            }
        }
    }

    async fn rpm_count(&self, scope: Scope, id: &str) -> u32 {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.rpm.lock().await;
        let entry = guard.entry((scope, id.to_string())).or_default();
        entry.retain(|t| now - *t <= TimeDuration::seconds(60));
        entry.len() as u32
    }

    async fn try_admit_concurrent(&self, owner_key: &str, session_id: &str, limit: u32) -> (bool, u32) {
        let mut guard = self.concurrent.lock().await;
        let entry = guard.entry(owner_key.to_string()).or_default();
        if entry.contains(&session_id.to_string()) {
            return (true, entry.len() as u32);
        }
        if entry.len() as u32 >= limit {
            return (false, entry.len() as u32);
        }
        entry.push(session_id.to_string());
        (true, entry.len() as u32)
    }

    async fn release_concurrent(&self, owner_key: &str, session_id: &str) {
        let mut guard = self.concurrent.lock().await;
        if let Some(entry) = guard.get_mut(owner_key) {
            entry.retain(|s| s != session_id);
        }
    }

    async fn track_success(
        &self,
        scope: Scope,
        id: &str,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
        cost: f64,
    ) {
        let now = OffsetDateTime::now_utc();
        for period in [
            Period::Total,
            Period::FiveHour,
            Period::Daily,
            Period::Weekly,
            Period::Monthly,
        ] {
            if period.is_rolling(mode) {
                let mut guard = self.rolling.lock().await;
                guard
                    .entry((scope, id.to_string(), period))
                    .or_default()
                    .push(CostSample { cost, at: now });
            } else {
                let mut guard = self.fixed.lock().await;
                let key = (scope, id.to_string(), period);
                let entry = guard
                    .entry(key)
                    .or_insert_with(|| (0.0, reset_boundary_after(period, now, daily_reset_time)));
                if entry.1 <= now {
                    *entry = (0.0, reset_boundary_after(period, now, daily_reset_time));
                }
                entry.0 += cost;
            }
        }
        let mut rpm = self.rpm.lock().await;
        rpm.entry((scope, id.to_string())).or_default().push(now);
    }

    async fn warm_from_sql(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        daily_reset_time: Option<&str>,
        samples: Vec<CostSample>,
    ) {
        if period.is_rolling(DailyResetMode::Rolling) || period == Period::FiveHour {
            let mut guard = self.rolling.lock().await;
            guard.insert((scope, id.to_string(), period), samples);
        } else {
            let sum: f64 = samples.iter().map(|s| s.cost).sum();
            let mut guard = self.fixed.lock().await;
            guard.insert(
                (scope, id.to_string(), period),
                (sum, reset_boundary_after(period, OffsetDateTime::now_utc(), daily_reset_time)),
            );
        }
    }

    async fn bind_session_provider(&self, session_id: &str, provider_id: i64) {
        let expires_at = OffsetDateTime::now_utc() + TimeDuration::seconds(SESSION_PROVIDER_TTL_SECS);
        self.session_provider
            .lock()
            .await
            .insert(session_id.to_string(), (provider_id, expires_at));
    }

    async fn get_session_provider(&self, session_id: &str) -> Option<i64> {
        let mut guard = self.session_provider.lock().await;
        match guard.get(session_id) {
            Some((provider_id, expires_at)) if *expires_at > OffsetDateTime::now_utc() => Some(*provider_id),
            Some(_) => {
                guard.remove(session_id);
                None
            }
            None => None,
        }
    }
}

fn reset_boundary_after(
    period: Period,
    now: OffsetDateTime,
    daily_reset_time: Option<&str>,
) -> OffsetDateTime {
    match period {
        Period::Daily => next_daily_reset_utc(now, daily_reset_time),
        Period::Weekly => next_monday_midnight_utc(now),
        Period::Monthly => next_month_start_utc(now),
        Period::Total | Period::FiveHour => now + TimeDuration::days(3650),
    }
}

/// Redis-backed store (spec §4.4 storage schemes). Rolling windows use a
/// sorted set per owner/period (`{scope}:{id}:cost_{period}_rolling`),
/// cleaned and summed atomically via a Lua script; fixed windows use an
/// `INCRBYFLOAT` counter with a TTL set to the next reset boundary.
pub struct RedisRateLimitStore {
    conn: Mutex<redis::aio::ConnectionManager>,
    rolling_sum_script: redis::Script,
}

const ROLLING_SUM_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local members = redis.call('ZRANGE', key, 0, -1)
local sum = 0.0
for _, m in ipairs(members) do
  local cost = tonumber(string.match(m, ":([^:]+)$"))
  if cost then sum = sum + cost end
end
redis.call('EXPIRE', key, math.floor(window_ms / 1000) + 3600)
return tostring(sum)
"#;

const CONCURRENT_ADMIT_LUA: &str = r#"
local key = KEYS[1]
local session = ARGV[1]
local limit = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl * 1000)
local existing = redis.call('ZSCORE', key, session)
local count = redis.call('ZCARD', key)
if existing then
  redis.call('ZADD', key, now, session)
  return {1, count}
end
if count >= limit then
  return {0, count}
end
redis.call('ZADD', key, now, session)
redis.call('EXPIRE', key, ttl)
return {1, count + 1}
"#;

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            rolling_sum_script: redis::Script::new(ROLLING_SUM_LUA),
        }))
    }

    fn rolling_key(scope: Scope, id: &str, period: Period) -> String {
        format!("{}:{}:cost_{}_rolling", scope.as_str(), id, period.as_str())
    }

    fn fixed_key(scope: Scope, id: &str, period: Period, suffix: Option<&str>) -> String {
        owner_redis_key(scope, id, period, suffix)
    }

    fn rpm_key(scope: Scope, id: &str) -> String {
        format!("{}:{}:rpm", scope.as_str(), id)
    }

    fn session_provider_key(session_id: &str) -> String {
        format!("sess:{session_id}:provider")
    }

    fn fixed_window_ttl_secs(period: Period, daily_reset_time: Option<&str>) -> i64 {
        let now = OffsetDateTime::now_utc();
        let boundary = reset_boundary_after(period, now, daily_reset_time);
        (boundary - now).whole_seconds().max(1)
    }

    /// `_{HHMM}` suffix applied only to `Daily` fixed-window keys (spec §4.4).
    fn daily_suffix(period: Period, daily_reset_time: Option<&str>) -> Option<String> {
        (period == Period::Daily).then(|| daily_reset_suffix(daily_reset_time))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn cost_sum(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
    ) -> f64 {
        if period.is_rolling(mode) {
            let window = period.window().unwrap_or(TimeDuration::hours(5));
            let key = Self::rolling_key(scope, id, period);
            let now_ms = now_millis();
            let mut conn = self.conn.lock().await;
            let result: redis::RedisResult<String> = self
                .rolling_sum_script
                .key(&key)
                .arg(now_ms)
                .arg(window.whole_milliseconds() as i64)
                .invoke_async(&mut *conn)
                .await;
            result.ok().and_then(|s| s.parse().ok()).unwrap_or(0.0)
        } else {
            let suffix = Self::daily_suffix(period, daily_reset_time);
            let key = Self::fixed_key(scope, id, period, suffix.as_deref());
            let mut conn = self.conn.lock().await;
            let value: redis::RedisResult<Option<f64>> =
                redis::cmd("GET").arg(&key).query_async(&mut *conn).await;
            value.ok().flatten().unwrap_or(0.0)
        }
    }

    async fn rpm_count(&self, scope: Scope, id: &str) -> u32 {
        let key = Self::rpm_key(scope, id);
        let now_ms = now_millis();
        let mut conn = self.conn.lock().await;
        let _: redis::RedisResult<()> = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now_ms - 60_000)
            .query_async(&mut *conn)
            .await;
        let count: redis::RedisResult<u32> =
            redis::cmd("ZCARD").arg(&key).query_async(&mut *conn).await;
        count.unwrap_or(0)
    }

    async fn try_admit_concurrent(&self, owner_key: &str, session_id: &str, limit: u32) -> (bool, u32) {
        let now_ms = now_millis();
        let mut conn = self.conn.lock().await;
        let script = redis::Script::new(CONCURRENT_ADMIT_LUA);
        let result: redis::RedisResult<(i64, i64)> = script
            .key(owner_key)
            .arg(session_id)
            .arg(limit)
            .arg(300_i64)
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await;
        match result {
            Ok((allowed, count)) => (allowed == 1, count.max(0) as u32),
            Err(_) => (true, 0),
        }
    }

    async fn release_concurrent(&self, owner_key: &str, session_id: &str) {
        let mut conn = self.conn.lock().await;
        let _: redis::RedisResult<()> = redis::cmd("ZREM")
            .arg(owner_key)
            .arg(session_id)
            .query_async(&mut *conn)
            .await;
    }

    async fn track_success(
        &self,
        scope: Scope,
        id: &str,
        mode: DailyResetMode,
        daily_reset_time: Option<&str>,
        cost: f64,
    ) {
        let now = OffsetDateTime::now_utc();
        let now_ms = now_millis();
        let mut conn = self.conn.lock().await;
        for period in [
            Period::Total,
            Period::FiveHour,
            Period::Daily,
            Period::Weekly,
            Period::Monthly,
        ] {
            if period.is_rolling(mode) {
                let key = Self::rolling_key(scope, id, period);
                let member = format!("{now_ms}:{}:{cost}", uuid::Uuid::new_v4());
                let _: redis::RedisResult<()> = redis::cmd("ZADD")
                    .arg(&key)
                    .arg(now_ms)
                    .arg(&member)
                    .query_async(&mut *conn)
                    .await;
                let window = period.window().unwrap_or(TimeDuration::hours(5));
                let ttl = window.whole_seconds() + 3600;
                let _: redis::RedisResult<()> =
                    redis::cmd("EXPIRE").arg(&key).arg(ttl).query_async(&mut *conn).await;
            } else {
                let suffix = Self::daily_suffix(period, daily_reset_time);
                let key = Self::fixed_key(scope, id, period, suffix.as_deref());
                let _: redis::RedisResult<()> = redis::cmd("INCRBYFLOAT")
                    .arg(&key)
                    .arg(cost)
                    .query_async(&mut *conn)
                    .await;
                let ttl = Self::fixed_window_ttl_secs(period, daily_reset_time);
                let _: redis::RedisResult<()> =
                    redis::cmd("EXPIRE").arg(&key).arg(ttl).query_async(&mut *conn).await;
            }
        }
        let rpm_key = Self::rpm_key(scope, id);
        let _: redis::RedisResult<()> = redis::cmd("ZADD")
            .arg(&rpm_key)
            .arg(now_ms)
            .arg(format!("{now_ms}:{}", uuid::Uuid::new_v4()))
            .query_async(&mut *conn)
            .await;
        let _: redis::RedisResult<()> = redis::cmd("EXPIRE")
            .arg(&rpm_key)
            .arg(120)
            .query_async(&mut *conn)
            .await;
        let _ = now;
    }

    /// Rebuilds the Redis structure from SQL-sourced samples, preserving
    /// real `created_at` scores for rolling windows (spec §4.4 cache-miss
    /// warming; §9 notes this is required for 5h but not for weekly/monthly
    /// fixed windows, which this mirrors by only ZADD-ing rolling periods).
    async fn warm_from_sql(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        daily_reset_time: Option<&str>,
        samples: Vec<CostSample>,
    ) {
        let mut conn = self.conn.lock().await;
        if period == Period::FiveHour || (period == Period::Daily && !samples.is_empty()) {
            let key = Self::rolling_key(scope, id, period);
            for sample in &samples {
                let score = (sample.at - OffsetDateTime::UNIX_EPOCH).whole_milliseconds() as i64;
                let member = format!("{score}:{}:{}", uuid::Uuid::new_v4(), sample.cost);
                let _: redis::RedisResult<()> = redis::cmd("ZADD")
                    .arg(&key)
                    .arg(score)
                    .arg(&member)
                    .query_async(&mut *conn)
                    .await;
            }
        } else {
            let sum: f64 = samples.iter().map(|s| s.cost).sum();
            let suffix = Self::daily_suffix(period, daily_reset_time);
            let key = Self::fixed_key(scope, id, period, suffix.as_deref());
            let ttl = Self::fixed_window_ttl_secs(period, daily_reset_time);
            let _: redis::RedisResult<()> = redis::cmd("SETEX")
                .arg(&key)
                .arg(ttl)
                .arg(sum)
                .query_async(&mut *conn)
                .await;
        }
    }

    async fn bind_session_provider(&self, session_id: &str, provider_id: i64) {
        let key = Self::session_provider_key(session_id);
        let mut conn = self.conn.lock().await;
        let _: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(&key)
            .arg(SESSION_PROVIDER_TTL_SECS)
            .arg(provider_id)
            .query_async(&mut *conn)
            .await;
    }

    async fn get_session_provider(&self, session_id: &str) -> Option<i64> {
        let key = Self::session_provider_key(session_id);
        let mut conn = self.conn.lock().await;
        let value: redis::RedisResult<Option<i64>> =
            redis::cmd("GET").arg(&key).query_async(&mut *conn).await;
        value.ok().flatten()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn twelve_step_short_circuits_on_key_total_first() {
        let store = InMemoryRateLimitStore::new();
        store
            .track_success(Scope::Key, "k1", DailyResetMode::Fixed, None, 11.0)
            .await;
        let key_limits = KeyLimits {
            spend: SpendLimits {
                total: Some(10.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let user_limits = UserLimits::default();
        let err = check_twelve_steps(store.as_ref(), "k1", &key_limits, "u1", &user_limits, "sess1")
            .await
            .unwrap_err();
        assert_eq!(err.limit_type, "usd_total");
        assert_eq!(err.status_code(), 402);
    }

    #[tokio::test]
    async fn concurrent_sessions_admits_up_to_limit() {
        let store = InMemoryRateLimitStore::new();
        let (ok1, _) = store.try_admit_concurrent("key:1:concurrent", "s1", 1).await;
        assert!(ok1);
        let (ok2, _) = store.try_admit_concurrent("key:1:concurrent", "s2", 1).await;
        assert!(!ok2);
        store.release_concurrent("key:1:concurrent", "s1").await;
        let (ok3, _) = store.try_admit_concurrent("key:1:concurrent", "s2", 1).await;
        assert!(ok3);
    }

    #[tokio::test]
    async fn rpm_limit_trips_after_limit_reached() {
        let store = InMemoryRateLimitStore::new();
        for _ in 0..3 {
            store
                .track_success(Scope::User, "u1", DailyResetMode::Fixed, None, 0.0)
                .await;
        }
        let key_limits = KeyLimits::default();
        let user_limits = UserLimits {
            rpm: Some(3),
            ..Default::default()
        };
        let err = check_twelve_steps(store.as_ref(), "k1", &key_limits, "u1", &user_limits, "sess1")
            .await
            .unwrap_err();
        assert_eq!(err.limit_type, "rpm");
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn daily_reset_suffix_encodes_configured_hhmm() {
        assert_eq!(daily_reset_suffix(Some("09:30")), "0930");
        assert_eq!(daily_reset_suffix(None), "0000");
        assert_eq!(daily_reset_suffix(Some("not-a-time")), "0000");
    }

    #[test]
    fn next_daily_reset_rolls_to_tomorrow_once_todays_time_has_passed() {
        let now = OffsetDateTime::now_utc();
        let past = now - TimeDuration::hours(1);
        let past_hhmm = format!("{:02}:{:02}", past.hour(), past.minute());
        let boundary = next_daily_reset_utc(now, Some(&past_hhmm));
        assert!(boundary > now);
        assert!(boundary - now < TimeDuration::hours(25));
    }
}
