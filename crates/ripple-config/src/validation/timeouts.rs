//! Validation for protocol timers.

use crate::schema::ClientOptions;

use super::helpers::validate_range;

const MAX_TIMER_MS: u64 = 24 * 60 * 60 * 1000;

pub(crate) fn validate_timeouts(errors: &mut Vec<String>, options: &ClientOptions) {
    let t = &options.timeouts;
    validate_range(errors, "timeouts.disconnected_retry_ms", t.disconnected_retry_ms, 1, MAX_TIMER_MS);
    validate_range(errors, "timeouts.suspended_retry_ms", t.suspended_retry_ms, 1, MAX_TIMER_MS);
    validate_range(errors, "timeouts.channel_retry_ms", t.channel_retry_ms, 1, MAX_TIMER_MS);
    validate_range(errors, "timeouts.realtime_request_ms", t.realtime_request_ms, 100, MAX_TIMER_MS);
    validate_range(errors, "timeouts.preference_connect_ms", t.preference_connect_ms, 0, MAX_TIMER_MS);
    validate_range(
        errors,
        "timeouts.connection_state_ttl_ms",
        t.connection_state_ttl_ms,
        1,
        MAX_TIMER_MS,
    );
}
