use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};
use tracing::warn;

use crate::server::LoopPolicy;

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

fn env_seconds(name: &str, default: f64, minimum: f64) -> Duration {
    let seconds = env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
        .max(minimum);
    Duration::from_secs_f64(seconds)
}

/// How long the server loop may wait in one multiplexer pass, default 100s
pub fn get_default_loop_period() -> Duration {
    env_seconds("ASYNCA_SERVER_LOOP_PERIOD", 100.0, 0.001)
}

/// Whether servers share one event loop thread, from `ASYNCA_SERVER_LOOP`
pub fn get_default_loop_policy() -> LoopPolicy {
    match env::var("ASYNCA_SERVER_LOOP") {
        Ok(v) if v.eq_ignore_ascii_case("per-server") => LoopPolicy::PerServer,
        Ok(v) if v.eq_ignore_ascii_case("shared") || v.is_empty() => LoopPolicy::Shared,
        Ok(v) => {
            warn!("Unrecognised ASYNCA_SERVER_LOOP value '{v}', using shared loop");
            LoopPolicy::Shared
        }
        Err(_) => LoopPolicy::Shared,
    }
}

/// Interval between repeated searches for unresolved loopback channels
pub fn get_default_search_period() -> Duration {
    env_seconds("ASYNCA_LOOPBACK_SEARCH_PERIOD", 0.05, 0.001)
}
