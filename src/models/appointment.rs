use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// A finalized booking, written exactly once when the user confirms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub user_id: String,
    pub city: String,
    pub center_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub created_at: NaiveDateTime,
}
