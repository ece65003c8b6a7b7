use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Book,
    Greeting,
    Confirm,
    Decline,
    Correct,
    Reset,
    Question,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotField {
    City,
    Center,
    Date,
    Time,
}

/// Structured guess produced by the extractor for one user turn. The schema
/// is closed on purpose: the state machine is tested against a fixed set of
/// signal shapes rather than an open-ended dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Extraction {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub city: Option<String>,
    /// Free-text hint for a center ("downtown", "the first one").
    #[serde(default)]
    pub center: Option<String>,
    /// Date as YYYY-MM-DD.
    #[serde(default)]
    pub date: Option<String>,
    /// Time as HH:MM.
    #[serde(default)]
    pub time: Option<String>,
    /// Slot the user is correcting, when the intent names one.
    #[serde(default)]
    pub correction_target: Option<SlotField>,
}

impl Extraction {
    pub fn has_slot_values(&self) -> bool {
        self.city.is_some() || self.center.is_some() || self.date.is_some() || self.time.is_some()
    }
}
