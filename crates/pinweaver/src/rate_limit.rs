//! delay schedule evaluation
//!
//! timestamps are seconds since boot tagged with the boot's restart count.
//! after a restart no credit is given for time spent before it: the wait
//! starts counting from the new boot.

use crate::leaf::{DelaySchedule, LeafPublicData, Timestamp, BLOCK_ATTEMPTS};
use crate::{Error, Result};

/// rows must strictly increase in both columns and end in zero filler
///
/// the first row needs a non-zero delay, otherwise it would be useless.
pub fn validate_delay_schedule(schedule: &DelaySchedule) -> Result<()> {
    if schedule[0].time_diff == 0 {
        return Err(Error::DelayScheduleInvalid);
    }

    for pair in schedule.windows(2) {
        let (prev, row) = (&pair[0], &pair[1]);
        if row.attempt_count == 0 {
            if row.time_diff != 0 {
                return Err(Error::DelayScheduleInvalid);
            }
        } else if row.attempt_count <= prev.attempt_count || row.time_diff <= prev.time_diff {
            return Err(Error::DelayScheduleInvalid);
        }
    }
    Ok(())
}

/// delay that applies at the leaf's current attempt count
pub fn current_delay(public: &LeafPublicData) -> u32 {
    public
        .delay_schedule
        .iter()
        .take_while(|row| !row.is_empty() && public.attempt_count >= row.attempt_count)
        .last()
        .map_or(0, |row| row.time_diff)
}

/// ok when another attempt may be made at `now`, otherwise the remaining wait
pub fn test_rate_limit(public: &LeafPublicData, now: &Timestamp) -> Result<()> {
    let delay = current_delay(public);
    if delay == 0 {
        return Ok(());
    }
    if delay == BLOCK_ATTEMPTS {
        return Err(Error::RateLimitReached {
            seconds_to_wait: BLOCK_ATTEMPTS,
        });
    }

    let ready_time = if public.timestamp.boot_count == now.boot_count {
        public.timestamp.timer_value.saturating_add(delay as u64)
    } else {
        delay as u64
    };

    if now.timer_value >= ready_time {
        return Ok(());
    }
    let seconds_to_wait = u32::try_from(ready_time - now.timer_value).unwrap_or(BLOCK_ATTEMPTS);
    Err(Error::RateLimitReached { seconds_to_wait })
}
