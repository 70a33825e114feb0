//! Coarse-window TPS limiting.
//!
//! One [`StatItem`] per service identity holds a token count refilled when
//! the window elapses; admission consumes a token by compare-and-swap. The
//! window is coarse: the reset is not aligned to wall intervals, and the
//! clock is monotonic per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Instant;

use crate::common::Url;
use crate::extension::{Activate, ExtensionProvider};

use super::{Filter, Invocation, Invoker, RpcError, RpcResult};

/// URL parameter holding the admitted calls per window; absent or
/// non-positive disables limiting.
pub const TPS_LIMIT_RATE_KEY: &str = "tps";
/// URL parameter holding the window length in milliseconds.
pub const TPS_LIMIT_INTERVAL_KEY: &str = "tps.interval";
pub const DEFAULT_TPS_LIMIT_INTERVAL: u64 = 60_000;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds on the process-monotonic clock.
fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Token bucket for one service: `rate` tokens per `interval_ms` window.
#[derive(Debug)]
pub struct StatItem {
    name: String,
    rate: i32,
    interval_ms: u64,
    last_reset_ms: AtomicU64,
    token: AtomicI32,
}

impl StatItem {
    pub fn new(name: impl Into<String>, rate: i32, interval_ms: u64, now_ms: u64) -> Self {
        Self {
            name: name.into(),
            rate,
            interval_ms,
            last_reset_ms: AtomicU64::new(now_ms),
            token: AtomicI32::new(rate),
        }
    }

    /// Attempts one admission at `now_ms`: refills the bucket when the
    /// window has elapsed, then consumes one token.
    pub fn is_allowable(&self, now_ms: u64) -> bool {
        if now_ms > self.last_reset_ms.load(Ordering::SeqCst) + self.interval_ms {
            self.token.store(self.rate, Ordering::SeqCst);
            self.last_reset_ms.store(now_ms, Ordering::SeqCst);
        }

        let mut value = self.token.load(Ordering::SeqCst);
        while value > 0 {
            match self
                .token
                .compare_exchange(value, value - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => value = actual,
            }
        }
        false
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> i32 {
        self.rate
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn token(&self) -> i32 {
        self.token.load(Ordering::SeqCst)
    }

    pub fn last_reset_ms(&self) -> u64 {
        self.last_reset_ms.load(Ordering::SeqCst)
    }
}

/// Admission control keyed by service identity.
pub trait TpsLimiter: Send + Sync {
    fn is_allowable(&self, url: &Url, invocation: &Invocation) -> bool;
}

/// Limiter driven entirely by URL parameters: `tps` sets the rate,
/// `tps.interval` the window. Stats are dropped when the rate is removed
/// and rebuilt when the configuration changes.
#[derive(Debug, Default)]
pub struct DefaultTpsLimiter {
    stats: RwLock<HashMap<String, Arc<StatItem>>>,
}

impl DefaultTpsLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allow_at(&self, url: &Url, now_ms: u64) -> bool {
        let rate: i32 = url.parameter_parsed(TPS_LIMIT_RATE_KEY, -1);
        let service_key = url.service_key();
        if rate <= 0 {
            self.stats
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&service_key);
            return true;
        }
        let interval_ms: u64 =
            url.parameter_parsed(TPS_LIMIT_INTERVAL_KEY, DEFAULT_TPS_LIMIT_INTERVAL);

        let item = {
            let stats = self.stats.read().unwrap_or_else(PoisonError::into_inner);
            stats
                .get(&service_key)
                .filter(|item| item.rate() == rate && item.interval_ms() == interval_ms)
                .cloned()
        };
        let item = match item {
            Some(item) => item,
            None => {
                let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
                stats
                    .entry(service_key.clone())
                    .and_modify(|existing| {
                        if existing.rate() != rate || existing.interval_ms() != interval_ms {
                            *existing =
                                Arc::new(StatItem::new(&service_key, rate, interval_ms, now_ms));
                        }
                    })
                    .or_insert_with(|| {
                        Arc::new(StatItem::new(&service_key, rate, interval_ms, now_ms))
                    })
                    .clone()
            }
        };
        item.is_allowable(now_ms)
    }
}

impl TpsLimiter for DefaultTpsLimiter {
    fn is_allowable(&self, url: &Url, _invocation: &Invocation) -> bool {
        self.allow_at(url, monotonic_ms())
    }
}

/// Provider-side filter denying calls past the configured rate.
///
/// Auto-activated for provider URLs carrying a `tps` parameter.
#[derive(Debug, Default)]
pub struct TpsLimitFilter {
    limiter: DefaultTpsLimiter,
}

impl TpsLimitFilter {
    const ACTIVATE: Activate = Activate::new()
        .group(&[super::filter_chain::PROVIDER_GROUP])
        .value(&[TPS_LIMIT_RATE_KEY]);

    /// The provider stub to register under the filter point, typically
    /// bound by a `tps=spindle.rpc.TpsLimitFilter` resource record.
    pub fn provider() -> ExtensionProvider<dyn Filter> {
        ExtensionProvider::named("spindle.rpc.TpsLimitFilter", |_ctx| {
            Ok(std::sync::Arc::new(TpsLimitFilter::default()) as std::sync::Arc<dyn Filter>)
        })
        .with_activate(Self::ACTIVATE)
    }
}

impl Filter for TpsLimitFilter {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        if !self.limiter.is_allowable(next.url(), invocation) {
            return Err(RpcError::Limited(format!(
                "failed to invoke '{}' on service {}: exceeded the allowed tps",
                invocation.method_name(),
                next.url().service_key()
            )));
        }
        next.invoke(invocation)
    }
}
