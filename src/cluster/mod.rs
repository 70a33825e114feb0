//! Cluster collaborator contracts: the load-balance seam and the warmup
//! weight it shares.
//!
//! Concrete balancing strategies live outside this crate. What they share
//! is the weight contract: a provider's configured weight ramps linearly
//! from 1 during its warmup window, so a freshly started instance is not
//! flooded at full weight.

use std::sync::Arc;

use crate::common::Url;
use crate::extension::Spi;
use crate::rpc::{Invocation, Invoker};

pub const WEIGHT_KEY: &str = "weight";
pub const DEFAULT_WEIGHT: i64 = 100;
pub const WARMUP_KEY: &str = "warmup";
/// Ten minutes.
pub const DEFAULT_WARMUP: i64 = 600_000;
/// Provider start timestamp, in epoch milliseconds.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Linear warmup ramp: `uptime / (warmup / weight)`, clamped to
/// `[1, weight]`. Callers apply it only while `0 < uptime < warmup`.
pub fn calculate_warmup_weight(uptime: i64, warmup: i64, weight: i64) -> i64 {
    let ramped = (uptime as f64 / (warmup as f64 / weight as f64)) as i64;
    if ramped < 1 {
        1
    } else if ramped > weight {
        weight
    } else {
        ramped
    }
}

/// The effective weight of a provider URL for one invocation at `now_ms`
/// (epoch milliseconds).
///
/// Reads the method-scoped `weight` parameter, then ramps it by uptime
/// against the `timestamp` and `warmup` parameters. Non-positive configured
/// weights are returned unchanged; callers treat them as disabled.
pub fn effective_weight(url: &Url, invocation: &Invocation, now_ms: i64) -> i64 {
    let weight: i64 =
        url.method_parameter_parsed(invocation.method_name(), WEIGHT_KEY, DEFAULT_WEIGHT);
    if weight <= 0 {
        return weight;
    }
    let timestamp: i64 = url.parameter_parsed(TIMESTAMP_KEY, 0);
    if timestamp <= 0 {
        return weight;
    }
    let uptime = now_ms - timestamp;
    let warmup: i64 = url.parameter_parsed(WARMUP_KEY, DEFAULT_WARMUP);
    if uptime > 0 && uptime < warmup {
        return calculate_warmup_weight(uptime, warmup, weight);
    }
    weight
}

/// Selects one invoker for a call. Strategies implement [`do_select`];
/// the trivial cases are answered here.
///
/// [`do_select`]: LoadBalance::do_select
pub trait LoadBalance: Send + Sync {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>> {
        match invokers {
            [] => None,
            [only] => Some(only.clone()),
            _ => self.do_select(invokers, url, invocation),
        }
    }

    fn do_select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Option<Arc<dyn Invoker>>;
}

impl Spi for dyn LoadBalance {
    const INTERFACE: &'static str = "spindle.cluster.LoadBalance";
}
