use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::models::{Catalog, ConversationContext, Extraction, Intent, SlotField, Stage};
use crate::services::ai::{LlmProvider, Message};

const SYSTEM_PROMPT: &str = r#"You are a slot extraction engine for a vehicle-service appointment assistant. Analyze the customer's latest message in the context of the conversation.

Return ONLY valid JSON (no markdown, no explanation) with this exact structure:
{
  "intent": "book|greeting|confirm|decline|correct|reset|question|unknown",
  "confidence": 0.0,
  "city": "mentioned city or null",
  "center": "service center preference as free text or null",
  "date": "resolved date as YYYY-MM-DD or null",
  "time": "resolved time as HH:MM (24h) or null",
  "correction_target": "city|center|date|time|null"
}

Intent rules:
- "book": the customer wants to schedule a service appointment
- "greeting": the customer is greeting or starting the conversation
- "confirm": the customer agrees to a proposed appointment (yes/ok/sounds good)
- "decline": the customer rejects a proposal without saying what to change
- "correct": the customer changes an earlier answer ("actually make it Riyadh");
  set correction_target to the slot being changed
- "reset": the customer wants to start over
- "question": the customer asks about something else
- "unknown": you cannot tell

Extraction rules:
- Only report a city the customer actually mentioned.
- Report center preferences verbatim ("the downtown one", "the first one").
- Resolve relative dates ("next Tuesday", "tomorrow") against today's date.
- confidence is your overall certainty between 0 and 1; use a low value when
  the message is ambiguous."#;

/// Runs the LLM extractor over the latest message, grounded in the current
/// conversation state and the catalog.
pub async fn extract(
    llm: &dyn LlmProvider,
    ctx: &ConversationContext,
    latest_message: &str,
    catalog: &Catalog,
) -> anyhow::Result<Extraction> {
    let mut messages: Vec<Message> = vec![];
    // Recent turns only; the extractor needs context, not the full audit log.
    for entry in ctx.history.iter().rev().take(6).rev() {
        messages.push(Message {
            role: "user".to_string(),
            content: entry.user_message.clone(),
        });
        messages.push(Message {
            role: "assistant".to_string(),
            content: entry.bot_response.clone(),
        });
    }
    messages.push(Message {
        role: "user".to_string(),
        content: latest_message.to_string(),
    });

    let system = format!(
        "{SYSTEM_PROMPT}\n\nToday is {}.\nConversation stage: {}.\nKnown so far: city={}, center={}, date={}, time={}.\nSupported cities: {}.",
        chrono::Utc::now().date_naive(),
        ctx.stage.as_str(),
        ctx.slots.city.as_deref().unwrap_or("-"),
        ctx.slots.center_id.as_deref().unwrap_or("-"),
        ctx.slots.date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
        ctx.slots.time.map(|t| t.format("%H:%M").to_string()).unwrap_or_else(|| "-".into()),
        catalog.city_names().join(", "),
    );

    let response = llm.chat(&system, &messages).await?;
    Ok(parse_extraction(&response))
}

/// LLMs routinely wrap or mangle JSON; recover in layers before giving up.
pub fn parse_extraction(response: &str) -> Extraction {
    if let Ok(extraction) = serde_json::from_str::<Extraction>(response) {
        return extraction;
    }

    // Strip markdown code fences
    let cleaned = response
        .trim()
        .strip_prefix("```json")
        .or_else(|| response.trim().strip_prefix("```"))
        .unwrap_or(response.trim());
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    if let Ok(extraction) = serde_json::from_str::<Extraction>(cleaned) {
        return extraction;
    }

    // Try to find a JSON object embedded in surrounding text
    if let Some(start) = cleaned.find('{') {
        if let Some(end) = cleaned.rfind('}') {
            if let Ok(extraction) = serde_json::from_str::<Extraction>(&cleaned[start..=end]) {
                return extraction;
            }
        }
    }

    tracing::warn!("failed to parse LLM response as extraction JSON");
    Extraction {
        intent: Intent::Unknown,
        confidence: 0.0,
        ..Extraction::default()
    }
}

/// Keyword-based extraction used when the LLM is unreachable, times out, or
/// returns garbage. Deliberately conservative: anything it cannot place ends
/// up as a low-confidence unknown, which the state machine turns into a
/// clarification.
pub fn fallback_extraction(
    message: &str,
    ctx: &ConversationContext,
    catalog: &Catalog,
    today: NaiveDate,
) -> Extraction {
    let lower = message.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != ':')
        .filter(|w| !w.is_empty())
        .collect();

    let city = catalog.resolve_city(&lower).map(|c| c.name.clone());
    let date = scan_date(&words, &lower, today);
    let time = scan_time(&words);

    if words.iter().any(|w| *w == "reset") || lower.contains("start over") {
        return Extraction {
            intent: Intent::Reset,
            confidence: 0.9,
            ..Extraction::default()
        };
    }

    let correction = lower.contains("change")
        || lower.contains("actually")
        || lower.contains("instead")
        || lower.contains("i meant");
    if correction {
        return Extraction {
            intent: Intent::Correct,
            confidence: 0.7,
            city,
            date,
            time,
            correction_target: scan_correction_target(&lower),
            ..Extraction::default()
        };
    }

    const CONFIRM_WORDS: &[&str] = &["yes", "yep", "yeah", "ok", "okay", "sure", "confirm", "confirmed"];
    if words.iter().any(|w| CONFIRM_WORDS.contains(w)) || lower.contains("sounds good") {
        return Extraction {
            intent: Intent::Confirm,
            confidence: 0.8,
            city,
            date,
            time,
            ..Extraction::default()
        };
    }
    if words.first() == Some(&"no") || words.iter().any(|w| *w == "nope") {
        return Extraction {
            intent: Intent::Decline,
            confidence: 0.8,
            ..Extraction::default()
        };
    }

    const BOOKING_WORDS: &[&str] = &[
        "book", "schedule", "appointment", "appt", "service", "servicing", "maintenance",
        "checkup",
    ];
    if words.iter().any(|w| BOOKING_WORDS.contains(w)) {
        return Extraction {
            intent: Intent::Book,
            confidence: 0.8,
            city,
            date,
            time,
            ..Extraction::default()
        };
    }

    const GREETING_WORDS: &[&str] = &["hello", "hi", "hey", "salam"];
    if words.iter().any(|w| GREETING_WORDS.contains(w)) && city.is_none() {
        return Extraction {
            intent: Intent::Greeting,
            confidence: 0.9,
            ..Extraction::default()
        };
    }

    if city.is_some() || date.is_some() || time.is_some() {
        return Extraction {
            intent: Intent::Unknown,
            confidence: 0.7,
            city,
            date,
            time,
            ..Extraction::default()
        };
    }

    // Mid-center-selection, the whole message is a plausible center hint
    // ("the first one", "downtown please").
    if ctx.stage == Stage::AwaitingCenter {
        return Extraction {
            intent: Intent::Unknown,
            confidence: 0.6,
            center: Some(message.trim().to_string()),
            ..Extraction::default()
        };
    }

    Extraction {
        intent: Intent::Unknown,
        confidence: 0.0,
        ..Extraction::default()
    }
}

fn scan_correction_target(lower: &str) -> Option<SlotField> {
    if lower.contains("city") || lower.contains("location") {
        Some(SlotField::City)
    } else if lower.contains("center") || lower.contains("branch") {
        Some(SlotField::Center)
    } else if lower.contains("date") || lower.contains("day") {
        Some(SlotField::Date)
    } else if lower.contains("time") {
        Some(SlotField::Time)
    } else {
        None
    }
}

/// "2025-07-15", "tomorrow", "(next) tuesday".
fn scan_date(words: &[&str], lower: &str, today: NaiveDate) -> Option<String> {
    for word in words {
        if word.len() == 10 {
            if let Ok(date) = NaiveDate::parse_from_str(word, "%Y-%m-%d") {
                return Some(date.to_string());
            }
        }
    }
    if lower.contains("tomorrow") {
        return Some((today + Duration::days(1)).to_string());
    }
    if lower.contains("today") {
        return Some(today.to_string());
    }
    for word in words {
        if let Some(weekday) = parse_weekday_name(word) {
            return Some(next_weekday(today, weekday).to_string());
        }
    }
    None
}

fn parse_weekday_name(word: &str) -> Option<Weekday> {
    match word {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Strictly-future occurrence of the weekday.
fn next_weekday(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (weekday.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
    let ahead = if ahead == 0 { 7 } else { ahead };
    today + Duration::days(ahead as i64)
}

/// "14:00", "11am", "11 am", "2 pm". A bare number is too ambiguous.
fn scan_time(words: &[&str]) -> Option<String> {
    for (i, word) in words.iter().enumerate() {
        if let Some((h, m)) = word.split_once(':') {
            if let (Ok(h), Ok(m)) = (h.parse::<u32>(), m.parse::<u32>()) {
                if h < 24 && m < 60 {
                    return Some(format!("{h:02}:{m:02}"));
                }
            }
        }

        let (digits, suffix) = word
            .strip_suffix("am")
            .map(|d| (d, Some("am")))
            .or_else(|| word.strip_suffix("pm").map(|d| (d, Some("pm"))))
            .unwrap_or((word, None));
        let suffix = suffix.or_else(|| match words.get(i + 1) {
            Some(&"am") => Some("am"),
            Some(&"pm") => Some("pm"),
            _ => None,
        });
        if let (Ok(hour), Some(suffix)) = (digits.parse::<u32>(), suffix) {
            if (1..=12).contains(&hour) {
                let hour = match (hour, suffix) {
                    (12, "am") => 0,
                    (12, "pm") => 12,
                    (h, "pm") => h + 12,
                    (h, _) => h,
                };
                return Some(format!("{hour:02}:00"));
            }
        }
    }
    None
}
