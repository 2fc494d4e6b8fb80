use std::time::Duration;

use engage_core::config::EngineConfig;

/// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`,
/// capped at `max_backoff_ms`. With jitter enabled the delay is scaled by
/// 0.8x to 1.2x, then capped again.
pub fn retry_delay(attempt: u32, config: &EngineConfig) -> Duration {
    let exp = attempt.saturating_sub(1);
    let ms = 2u64
        .checked_pow(exp)
        .and_then(|factor| config.initial_backoff_ms.checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(config.max_backoff_ms);

    let ms = if config.jitter {
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        ((ms as f64 * jitter) as u64).min(config.max_backoff_ms)
    } else {
        ms
    };
    Duration::from_millis(ms)
}
