use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Wall clock pinned to the local offset captured at startup.
///
/// The offset has to be read before the runtime spawns worker threads;
/// `time` refuses to query it from a multi-threaded process.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    offset: UtcOffset,
}

impl LocalClock {
    /// Capture the local offset now, falling back to UTC.
    pub fn capture() -> Self {
        Self {
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        }
    }

    pub fn utc() -> Self {
        Self {
            offset: UtcOffset::UTC,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    /// `2024-05-01T12:00:00`, local time without offset.
    pub fn timestamp(&self) -> String {
        format_timestamp(self.now())
    }
}

pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    ))
    .unwrap_or_default()
}

/// `HH:MM`, as shown on the clock face.
pub fn format_hhmm(at: OffsetDateTime) -> String {
    format!("{:02}:{:02}", at.hour(), at.minute())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn timestamp_has_no_offset_suffix() {
        let at = datetime!(2024-05-01 07:08:09 UTC);
        assert_eq!(format_timestamp(at), "2024-05-01T07:08:09");
    }

    #[test]
    fn hhmm_is_zero_padded() {
        assert_eq!(format_hhmm(datetime!(2024-05-01 07:05:59 UTC)), "07:05");
    }

    #[test]
    fn utc_clock_has_zero_offset() {
        assert!(LocalClock::utc().now().offset().is_utc());
    }
}
