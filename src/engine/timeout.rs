//! Response deadlines sized by payload.

use crate::config::TransferConfig;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Deadline for a single request: base + per-MB allowance, clamped.
///
/// With defaults: 10s base, 1.5s per MB, bounded to [10s, 60s].
pub fn response_timeout(payload_len: usize, config: &TransferConfig) -> Duration {
    let allowance = config.timeout_per_mb_ms.saturating_mul(payload_len as u64) / MB;
    let ms = config
        .base_timeout_ms
        .saturating_add(allowance)
        .clamp(config.min_timeout_ms, config.max_timeout_ms.max(config.min_timeout_ms));
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_gets_base() {
        let config = TransferConfig::default();
        assert_eq!(response_timeout(0, &config), Duration::from_secs(10));
        assert_eq!(response_timeout(1024, &config), Duration::from_millis(10_001));
    }

    #[test]
    fn test_scales_per_mb() {
        let config = TransferConfig::default();
        assert_eq!(
            response_timeout(4 * 1024 * 1024, &config),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn test_clamped_to_max() {
        let config = TransferConfig::default();
        assert_eq!(
            response_timeout(500 * 1024 * 1024, &config),
            Duration::from_secs(60)
        );
    }
}
