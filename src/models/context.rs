use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::intent::{Intent, SlotField};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    AwaitingCity,
    AwaitingCenter,
    AwaitingTime,
    AwaitingConfirmation,
    Booked,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::AwaitingCity => "awaiting_city",
            Stage::AwaitingCenter => "awaiting_center",
            Stage::AwaitingTime => "awaiting_time",
            Stage::AwaitingConfirmation => "awaiting_confirmation",
            Stage::Booked => "booked",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "awaiting_city" => Stage::AwaitingCity,
            "awaiting_center" => Stage::AwaitingCenter,
            "awaiting_time" => Stage::AwaitingTime,
            "awaiting_confirmation" => Stage::AwaitingConfirmation,
            "booked" => Stage::Booked,
            _ => Stage::Greeting,
        }
    }
}

/// The booking form under construction for one user. Dependency order is
/// city -> center -> date -> time -> confirmed; a field is only ever set when
/// everything it depends on is set and consistent.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BookingSlots {
    pub city: Option<String>,
    pub center_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    #[serde(default)]
    pub confirmed: bool,
}

impl BookingSlots {
    pub fn is_complete(&self) -> bool {
        self.city.is_some() && self.center_id.is_some() && self.date.is_some() && self.time.is_some()
    }

    /// Clears a slot together with every slot that depends on it.
    pub fn clear_from(&mut self, field: SlotField) {
        match field {
            SlotField::City => {
                self.city = None;
                self.center_id = None;
                self.date = None;
                self.time = None;
            }
            SlotField::Center => {
                self.center_id = None;
                self.date = None;
                self.time = None;
            }
            SlotField::Date => {
                self.date = None;
                self.time = None;
            }
            SlotField::Time => {
                self.time = None;
            }
        }
        self.confirmed = false;
    }

    /// Dependency invariant. A violation is a bug in the state machine,
    /// never a reachable end-user state.
    pub fn invariants_hold(&self) -> bool {
        if self.center_id.is_some() && self.city.is_none() {
            return false;
        }
        if self.time.is_some() && (self.date.is_none() || self.center_id.is_none()) {
            return false;
        }
        if self.confirmed && !self.is_complete() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: NaiveDateTime,
    pub user_message: String,
    pub bot_response: String,
    pub intent: Intent,
}

/// Per-user conversation record, persisted between deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub stage: Stage,
    pub slots: BookingSlots,
    pub history: Vec<HistoryEntry>,
    /// Center ids in the order last shown to the user; ordinal references
    /// ("the first one") resolve against this, not catalog order.
    pub presented_centers: Vec<String>,
    pub appointment_id: Option<String>,
    pub last_active: NaiveDateTime,
}

impl ConversationContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            stage: Stage::Greeting,
            slots: BookingSlots::default(),
            history: vec![],
            presented_centers: vec![],
            appointment_id: None,
            last_active: Utc::now().naive_utc(),
        }
    }

    /// Appends a turn, evicting the oldest entries beyond `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push(entry);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// Discards booking progress but keeps identity and history for audit.
    pub fn reset_booking(&mut self) {
        self.stage = Stage::Greeting;
        self.slots = BookingSlots::default();
        self.presented_centers.clear();
        self.appointment_id = None;
    }
}

/// Strips a channel prefix from a transport identifier
/// ("whatsapp:+9665..." -> "+9665...").
pub fn normalize_user_id(raw: &str) -> String {
    raw.rsplit(':').next().unwrap_or(raw).trim().to_string()
}
