//! Time-slot gating for batch processing

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// A daily time window during which workers may dispatch tasks.
///
/// The window is half-open `[begin, end)` and may wrap around midnight
/// (e.g. 22:00 to 06:00). Equal begin and end times disable the gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub begin: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(begin: NaiveTime, end: NaiveTime) -> Self {
        Self { begin, end }
    }

    /// Parse "HH:MM" begin/end strings from the configuration
    pub fn parse(begin: &str, end: &str) -> Result<Self, String> {
        let begin = NaiveTime::parse_from_str(begin, "%H:%M")
            .map_err(|e| format!("Invalid time slot begin '{}': {}", begin, e))?;
        let end = NaiveTime::parse_from_str(end, "%H:%M")
            .map_err(|e| format!("Invalid time slot end '{}': {}", end, e))?;
        Ok(Self::new(begin, end))
    }

    /// Whether dispatching is allowed at the given wall-clock time
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.begin == self.end {
            // scheduling window turned off
            return true;
        }
        if self.begin < self.end {
            time >= self.begin && time < self.end
        } else {
            // crosses midnight
            time >= self.begin || time < self.end
        }
    }
}
