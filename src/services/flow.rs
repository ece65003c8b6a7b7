use chrono::{NaiveDate, NaiveTime};

use crate::models::{
    BookingSlots, Catalog, CityEntry, ConversationContext, Extraction, Intent, SlotField, Stage,
};

/// Response template chosen by the state machine. Rendering is separate so
/// transitions stay pure and comparable in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Greeting,
    AskCity,
    UnknownCity { input: String },
    ListCenters { city: String },
    AskTime,
    InvalidTime,
    ConfirmPrompt,
    Booked,
    AskWhatToChange,
    Clarify { stage: Stage },
    ResetDone,
    AlreadyBooked,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub stage: Stage,
    pub slots: BookingSlots,
    pub reply: Reply,
    pub presented_centers: Vec<String>,
    pub appointment_id: Option<String>,
    /// True only on the turn that finalized a booking.
    pub newly_booked: bool,
}

/// Earliest still-unfilled slot decides the stage. Pure over the slots so
/// ordering and regression logic is testable without any extraction involved.
pub fn recompute_stage(slots: &BookingSlots) -> Stage {
    if slots.confirmed {
        Stage::Booked
    } else if slots.city.is_none() {
        Stage::AwaitingCity
    } else if slots.center_id.is_none() {
        Stage::AwaitingCenter
    } else if slots.date.is_none() || slots.time.is_none() {
        Stage::AwaitingTime
    } else {
        Stage::AwaitingConfirmation
    }
}

/// When the city has exactly one center there is nothing to ask; select it.
pub fn auto_select_center(slots: &mut BookingSlots, catalog: &Catalog) {
    if slots.center_id.is_some() {
        return;
    }
    let Some(city_name) = &slots.city else { return };
    if let Some(city) = catalog.city(city_name) {
        if city.centers.len() == 1 {
            slots.center_id = Some(city.centers[0].id.clone());
        }
    }
}

#[derive(Debug, Default)]
struct ApplyReport {
    unknown_city: Option<String>,
    unresolved_center: bool,
    invalid_time: bool,
}

/// Merges extracted values into the slots, precedence-ordered. Values that
/// contradict a higher-precedence slot are discarded and reported; a changed
/// city or date clears everything that depended on the old value.
fn apply_extraction(
    slots: &mut BookingSlots,
    extraction: &Extraction,
    catalog: &Catalog,
    presented: &[String],
) -> ApplyReport {
    let mut report = ApplyReport::default();

    if let Some(raw) = &extraction.city {
        match catalog.resolve_city(raw) {
            Some(city) => {
                if slots.city.as_deref() != Some(city.name.as_str()) {
                    slots.clear_from(SlotField::City);
                    slots.city = Some(city.name.clone());
                }
            }
            None => report.unknown_city = Some(raw.clone()),
        }
    }

    if let Some(hint) = &extraction.center {
        // A center hint without a city is ambiguous; drop it and let the
        // stage recomputation ask for the city first.
        if let Some(city) = slots.city.as_deref().and_then(|n| catalog.city(n)) {
            match catalog.resolve_center(city, hint, presented) {
                Some(center) => {
                    if slots.center_id.as_deref() != Some(center.id.as_str()) {
                        slots.clear_from(SlotField::Center);
                        slots.center_id = Some(center.id.clone());
                    }
                }
                None => report.unresolved_center = true,
            }
        }
    }

    auto_select_center(slots, catalog);

    if let Some(raw) = &extraction.date {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            if slots.date != Some(date) {
                slots.clear_from(SlotField::Date);
                slots.date = Some(date);
            }
        }
    }

    if let Some(raw) = &extraction.time {
        if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M") {
            // A time is only meaningful against a concrete (center, date).
            if let (Some(center), Some(date)) = (
                slots.center_id.as_deref().and_then(|id| catalog.center(id)),
                slots.date,
            ) {
                if catalog.available_times(center, date).contains(&time) {
                    slots.time = Some(time);
                } else {
                    report.invalid_time = true;
                }
            }
        }
    }

    report
}

/// One turn of the conversation state machine. Input is the stored context
/// plus the extractor's structured guess; output is the successor state and
/// the reply to render. No I/O happens here.
pub fn transition(
    ctx: &ConversationContext,
    extraction: &Extraction,
    catalog: &Catalog,
    threshold: f64,
) -> Outcome {
    let mut slots = ctx.slots.clone();
    let mut presented = ctx.presented_centers.clone();
    let mut appointment_id = ctx.appointment_id.clone();

    let unchanged = |reply: Reply| Outcome {
        stage: ctx.stage,
        slots: ctx.slots.clone(),
        reply,
        presented_centers: ctx.presented_centers.clone(),
        appointment_id: ctx.appointment_id.clone(),
        newly_booked: false,
    };

    // No confident signal: re-prompt for whatever is being collected.
    if extraction.confidence < threshold {
        return unchanged(Reply::Clarify { stage: ctx.stage });
    }

    // Terminal stage stays terminal until a new booking or an explicit reset.
    if ctx.stage == Stage::Booked {
        match extraction.intent {
            Intent::Reset => {
                slots = BookingSlots::default();
                return Outcome {
                    stage: Stage::Greeting,
                    slots,
                    reply: Reply::ResetDone,
                    presented_centers: vec![],
                    appointment_id: None,
                    newly_booked: false,
                };
            }
            Intent::Book => {
                slots = BookingSlots::default();
                presented.clear();
                appointment_id = None;
            }
            _ => return unchanged(Reply::AlreadyBooked),
        }
    } else {
        match extraction.intent {
            Intent::Reset => {
                return Outcome {
                    stage: Stage::Greeting,
                    slots: BookingSlots::default(),
                    reply: Reply::ResetDone,
                    presented_centers: vec![],
                    appointment_id: None,
                    newly_booked: false,
                };
            }
            Intent::Greeting if !extraction.has_slot_values() => {
                let reply = if ctx.stage == Stage::Greeting {
                    Reply::Greeting
                } else {
                    Reply::Clarify { stage: ctx.stage }
                };
                return unchanged(reply);
            }
            Intent::Confirm => {
                // Confirmation only finalizes a fully-filled, consistent
                // form; there is no shortcut from earlier stages.
                if ctx.stage == Stage::AwaitingConfirmation && slots.is_complete() {
                    slots.confirmed = true;
                    debug_assert!(slots.invariants_hold());
                    let id = uuid::Uuid::new_v4().to_string();
                    return Outcome {
                        stage: Stage::Booked,
                        slots,
                        reply: Reply::Booked,
                        presented_centers: presented,
                        appointment_id: Some(id),
                        newly_booked: true,
                    };
                }
                if !extraction.has_slot_values() {
                    return unchanged(Reply::Clarify { stage: ctx.stage });
                }
            }
            Intent::Decline | Intent::Correct => {
                if let Some(target) = extraction.correction_target {
                    slots.clear_from(target);
                } else if !extraction.has_slot_values() {
                    // Correction with no recognizable target: ask instead of
                    // guessing a regression target.
                    let reply = if ctx.stage == Stage::AwaitingConfirmation {
                        Reply::AskWhatToChange
                    } else {
                        Reply::Clarify { stage: ctx.stage }
                    };
                    return unchanged(reply);
                }
            }
            Intent::Question | Intent::Unknown if !extraction.has_slot_values() => {
                return unchanged(Reply::Clarify { stage: ctx.stage });
            }
            _ => {}
        }
    }

    let report = apply_extraction(&mut slots, extraction, catalog, &presented);
    debug_assert!(slots.invariants_hold());
    let stage = recompute_stage(&slots);

    let reply = if let Some(input) = report.unknown_city {
        Reply::UnknownCity { input }
    } else if report.unresolved_center || stage == Stage::AwaitingCenter {
        // Listing the centers doubles as the clarification; either way the
        // presentation order is (re)recorded for later ordinal references.
        let city = slots.city.clone().unwrap_or_default();
        if let Some(entry) = catalog.city(&city) {
            presented = entry.centers.iter().map(|c| c.id.clone()).collect();
        }
        Reply::ListCenters { city }
    } else if report.invalid_time {
        Reply::InvalidTime
    } else {
        match stage {
            Stage::AwaitingCity => Reply::AskCity,
            Stage::AwaitingTime => Reply::AskTime,
            Stage::AwaitingConfirmation => Reply::ConfirmPrompt,
            // Unfilled-slot recomputation never yields these.
            Stage::Greeting | Stage::AwaitingCenter | Stage::Booked => {
                Reply::Clarify { stage }
            }
        }
    };

    Outcome {
        stage,
        slots,
        reply,
        presented_centers: presented,
        appointment_id,
        newly_booked: false,
    }
}

impl Reply {
    pub fn render(&self, slots: &BookingSlots, catalog: &Catalog) -> String {
        match self {
            Reply::Greeting => "Hello! Welcome to our vehicle service booking. I'm here to \
                 help you schedule a service appointment. How can I assist you today?"
                .to_string(),
            Reply::AskCity => "I'd be happy to help you book a service appointment! Which city \
                 are you in?"
                .to_string(),
            Reply::UnknownCity { input } => format!(
                "I'm sorry, we don't have a service center in {input}. We have centers in: {}. \
                 Which city works for you?",
                catalog.city_names().join(", ")
            ),
            Reply::ListCenters { city } => match catalog.city(city) {
                Some(entry) => {
                    let lines = list_centers(entry);
                    format!(
                        "We have the following service centers in {city}:\n{lines}\n\nWhich one \
                         would you prefer?"
                    )
                }
                None => "Could you tell me which city you'd like to book in?".to_string(),
            },
            Reply::AskTime => {
                let Some(center) = slots.center_id.as_deref().and_then(|id| catalog.center(id))
                else {
                    return "What day and time work for you?".to_string();
                };
                match slots.date {
                    Some(date) => {
                        let times = format_times(&catalog.available_times(center, date));
                        format!(
                            "Available times on {date}: {times}. Which one works best for you?"
                        )
                    }
                    None => format!(
                        "Great, {} it is. Our hours are {}. What day and time work for you?",
                        center.name,
                        catalog.hours_summary(center)
                    ),
                }
            }
            Reply::InvalidTime => {
                let Some(center) = slots.center_id.as_deref().and_then(|id| catalog.center(id))
                else {
                    return "That time isn't available. What other time works for you?".to_string();
                };
                match slots.date {
                    Some(date) => {
                        let times = catalog.available_times(center, date);
                        if times.is_empty() {
                            format!(
                                "We're closed on {date}. Our hours are {}. What other day works \
                                 for you?",
                                catalog.hours_summary(center)
                            )
                        } else {
                            format!(
                                "That time isn't available on {date}. Available times: {}. Which \
                                 one would you like?",
                                format_times(&times)
                            )
                        }
                    }
                    None => format!(
                        "That time isn't available. Our hours are {}. What day and time work for \
                         you?",
                        catalog.hours_summary(center)
                    ),
                }
            }
            Reply::ConfirmPrompt => {
                let center = center_name(slots, catalog);
                let date = slots.date.map(|d| d.to_string()).unwrap_or_default();
                let time = slots.time.map(|t| t.format("%H:%M").to_string()).unwrap_or_default();
                format!(
                    "Please confirm: a service appointment at {center} on {date} at {time}. \
                     Shall I book it? (yes/no)"
                )
            }
            Reply::Booked => {
                let center = center_name(slots, catalog);
                let phone = slots
                    .center_id
                    .as_deref()
                    .and_then(|id| catalog.center(id))
                    .map(|c| c.phone.clone())
                    .unwrap_or_default();
                let date = slots.date.map(|d| d.to_string()).unwrap_or_default();
                let time = slots.time.map(|t| t.format("%H:%M").to_string()).unwrap_or_default();
                format!(
                    "Your service appointment is confirmed at {center} on {date} at {time}. \
                     We'll send you a reminder before your appointment. If you need to \
                     reschedule, please call {phone}. Thank you!"
                )
            }
            Reply::AskWhatToChange => "No problem. What would you like to change - the city, the \
                 center, or the time?"
                .to_string(),
            Reply::Clarify { stage } => match stage {
                Stage::Greeting => "I can help you book a service appointment for your vehicle. \
                     Would you like to schedule one?"
                    .to_string(),
                Stage::AwaitingCity => "Could you please tell me which city you'd like to book \
                     the appointment in?"
                    .to_string(),
                Stage::AwaitingCenter => "Could you please specify which service center you'd \
                     prefer?"
                    .to_string(),
                Stage::AwaitingTime => "Could you tell me what day and time work for you?"
                    .to_string(),
                Stage::AwaitingConfirmation => "Shall I confirm the appointment? A simple yes \
                     works, or tell me what you'd like to change."
                    .to_string(),
                Stage::Booked => Reply::AlreadyBooked.render(slots, catalog),
            },
            Reply::ResetDone => "Your conversation has been reset. How can I help you today?"
                .to_string(),
            Reply::AlreadyBooked => "Your appointment is already booked. Say 'book' if you'd \
                 like to schedule another one."
                .to_string(),
        }
    }
}

fn list_centers(city: &CityEntry) -> String {
    city.centers
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} ({})", i + 1, c.name, c.address))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_times(times: &[NaiveTime]) -> String {
    times
        .iter()
        .map(|t| t.format("%H:%M").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn center_name(slots: &BookingSlots, catalog: &Catalog) -> String {
    slots
        .center_id
        .as_deref()
        .and_then(|id| catalog.center(id))
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "the selected center".to_string())
}
