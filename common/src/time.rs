// Time types used across the project.
//
// The helpers below read the system clock and are NON-DETERMINISTIC:
// they must never decide a consensus outcome. Slot assignment and block
// validation work from block timestamps; the system clock is only an
// input to the forger tick and to pool expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Millis timestamps used to determine it using its type
pub type TimestampMillis = u64;

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    let start = SystemTime::now();

    start
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from get_current_time")
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}

// Return timestamp in milliseconds
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
