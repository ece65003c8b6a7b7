use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::{normalize_user_id, Appointment, ConversationContext, HistoryEntry};
use crate::services::ai::intent as extractor;
use crate::services::flow;
use crate::state::AppState;

const SAVE_ATTEMPTS: u32 = 3;

/// End-to-end handling of one inbound message: load context, extract, run
/// the state machine, persist, reply. Turns for the same user are serialized
/// by a per-user lock; a replayed delivery id short-circuits to the cached
/// response without re-applying the transition.
pub async fn process_message(
    state: &Arc<AppState>,
    raw_user_id: &str,
    message: &str,
    delivery_id: Option<&str>,
) -> anyhow::Result<String> {
    let user_id = normalize_user_id(raw_user_id);

    let lock = state.user_lock(&user_id);
    let _guard = lock.lock().await;

    if let Some(id) = delivery_id {
        if let Some(cached) = state.store.delivery_response(id)? {
            tracing::info!(user = %user_id, delivery = id, "duplicate delivery, replaying cached response");
            return Ok(cached);
        }
    }

    let mut ctx = state.store.load(&user_id)?;

    let extraction = extract_with_fallback(state, &ctx, message).await;

    tracing::info!(
        user = %user_id,
        intent = ?extraction.intent,
        confidence = extraction.confidence,
        stage = ctx.stage.as_str(),
        "processing message"
    );

    let outcome = flow::transition(
        &ctx,
        &extraction,
        &state.catalog,
        state.config.confidence_threshold,
    );
    let reply = outcome.reply.render(&outcome.slots, &state.catalog);

    let appointment = if outcome.newly_booked {
        build_appointment(&user_id, &outcome)
    } else {
        None
    };

    ctx.stage = outcome.stage;
    ctx.slots = outcome.slots;
    ctx.presented_centers = outcome.presented_centers;
    ctx.appointment_id = outcome.appointment_id;
    ctx.push_history(
        HistoryEntry {
            timestamp: Utc::now().naive_utc(),
            user_message: message.to_string(),
            bot_response: reply.clone(),
            intent: extraction.intent,
        },
        state.config.history_limit,
    );
    ctx.last_active = Utc::now().naive_utc();

    save_with_retry(state, &ctx, appointment.as_ref()).await?;

    if let Some(appointment) = &appointment {
        tracing::info!(user = %user_id, appointment = %appointment.id, "appointment booked");
    }

    if let Some(id) = delivery_id {
        // Best effort; a lost guard record only risks a repeated reply.
        if let Err(e) = state.store.record_delivery(id, &user_id, &reply) {
            tracing::error!(error = %e, delivery = id, "failed to record delivery id");
        }
    }

    Ok(reply)
}

/// Extraction is the only unbounded external call; cap it and degrade to the
/// keyword fallback so a slow or broken NLU backend reads as "no confident
/// signal", never as a failed turn.
async fn extract_with_fallback(
    state: &Arc<AppState>,
    ctx: &ConversationContext,
    message: &str,
) -> crate::models::Extraction {
    let timeout = Duration::from_secs(state.config.extract_timeout_secs);
    match tokio::time::timeout(
        timeout,
        extractor::extract(state.llm.as_ref(), ctx, message, &state.catalog),
    )
    .await
    {
        Ok(Ok(extraction)) => extraction,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "extractor failed, using keyword fallback");
            extractor::fallback_extraction(message, ctx, &state.catalog, Utc::now().date_naive())
        }
        Err(_) => {
            tracing::warn!(timeout_secs = state.config.extract_timeout_secs, "extractor timed out, using keyword fallback");
            extractor::fallback_extraction(message, ctx, &state.catalog, Utc::now().date_naive())
        }
    }
}

fn build_appointment(user_id: &str, outcome: &flow::Outcome) -> Option<Appointment> {
    // A finalized booking always carries a complete form; anything else is a
    // state machine bug.
    match (
        &outcome.appointment_id,
        &outcome.slots.city,
        &outcome.slots.center_id,
        outcome.slots.date,
        outcome.slots.time,
    ) {
        (Some(id), Some(city), Some(center_id), Some(date), Some(time)) => Some(Appointment {
            id: id.clone(),
            user_id: user_id.to_string(),
            city: city.clone(),
            center_id: center_id.clone(),
            date,
            time,
            created_at: Utc::now().naive_utc(),
        }),
        _ => {
            tracing::error!(user = user_id, "booking finalized with incomplete slots");
            None
        }
    }
}

/// A turn that finalized a booking commits the context and the appointment
/// row in one store transaction; either both land or the turn stays fully
/// retryable.
async fn save_with_retry(
    state: &Arc<AppState>,
    ctx: &ConversationContext,
    appointment: Option<&Appointment>,
) -> anyhow::Result<()> {
    let mut backoff = Duration::from_millis(100);
    let mut last_err = None;
    for attempt in 1..=SAVE_ATTEMPTS {
        let result = match appointment {
            Some(appt) => state.store.save_booking(ctx, appt),
            None => state.store.save(ctx),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, attempt, "context save failed");
                last_err = Some(e);
                if attempt < SAVE_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("context save failed"))
        .context("failed to persist conversation context"))
}
