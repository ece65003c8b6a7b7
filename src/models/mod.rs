pub mod appointment;
pub mod catalog;
pub mod context;
pub mod intent;

pub use appointment::Appointment;
pub use catalog::{Catalog, CityEntry, DayHours, ServiceCenter};
pub use context::{
    normalize_user_id, BookingSlots, ConversationContext, HistoryEntry, Stage,
};
pub use intent::{Extraction, Intent, SlotField};
