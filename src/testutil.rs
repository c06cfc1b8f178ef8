//! Shared fixtures for the colocated test modules.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::schema::{Calendar, EventInstance};

pub(crate) fn instance(id: &str, event_id: &str, start: DateTime<Utc>) -> EventInstance {
    EventInstance {
        instance_id: id.to_string(),
        event_id: event_id.to_string(),
        calendar_id: "cal1".to_string(),
        title: "Standup".to_string(),
        start_at: start,
        end_at: start + Duration::hours(1),
        all_day: false,
        occurrence_key: None,
        temp_event_id: None,
        updated_at: None,
        deleted_at: None,
    }
}

pub(crate) fn calendar(id: &str, name: &str) -> Calendar {
    Calendar {
        calendar_id: id.to_string(),
        name: name.to_string(),
        color: None,
        updated_at: None,
    }
}

pub(crate) fn march(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}
