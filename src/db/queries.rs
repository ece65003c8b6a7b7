use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection};

use crate::models::{Appointment, ConversationContext, Stage};

const TS_FMT: &str = "%Y-%m-%d %H:%M:%S";

// ── Contexts ──

pub fn get_context(conn: &Connection, user_id: &str) -> anyhow::Result<Option<ConversationContext>> {
    let mut stmt = conn.prepare(
        "SELECT stage, slots, history, presented_centers, appointment_id, last_active
         FROM contexts WHERE user_id = ?1",
    )?;

    let result = stmt.query_row(params![user_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
        ))
    });

    match result {
        Ok((stage_str, slots_json, history_json, presented_json, appointment_id, last_active_str)) => {
            let last_active = NaiveDateTime::parse_from_str(&last_active_str, TS_FMT)
                .unwrap_or_else(|_| Utc::now().naive_utc());
            Ok(Some(ConversationContext {
                user_id: user_id.to_string(),
                stage: Stage::parse(&stage_str),
                slots: serde_json::from_str(&slots_json).unwrap_or_default(),
                history: serde_json::from_str(&history_json).unwrap_or_default(),
                presented_centers: serde_json::from_str(&presented_json).unwrap_or_default(),
                appointment_id,
                last_active,
            }))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn upsert_context(conn: &Connection, ctx: &ConversationContext) -> anyhow::Result<()> {
    let slots_json = serde_json::to_string(&ctx.slots)?;
    let history_json = serde_json::to_string(&ctx.history)?;
    let presented_json = serde_json::to_string(&ctx.presented_centers)?;
    let last_active = ctx.last_active.format(TS_FMT).to_string();

    conn.execute(
        "INSERT INTO contexts (user_id, stage, slots, history, presented_centers, appointment_id, last_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
           stage = excluded.stage,
           slots = excluded.slots,
           history = excluded.history,
           presented_centers = excluded.presented_centers,
           appointment_id = excluded.appointment_id,
           last_active = excluded.last_active",
        params![
            ctx.user_id,
            ctx.stage.as_str(),
            slots_json,
            history_json,
            presented_json,
            ctx.appointment_id,
            last_active,
        ],
    )?;
    Ok(())
}

/// Deletes contexts whose `last_active` precedes the cutoff (strictly).
pub fn sweep_contexts(conn: &Connection, older_than: &NaiveDateTime) -> anyhow::Result<usize> {
    let cutoff = older_than.format(TS_FMT).to_string();
    let count = conn.execute(
        "DELETE FROM contexts WHERE last_active < ?1",
        params![cutoff],
    )?;
    Ok(count)
}

// ── Appointments ──

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO appointments (id, user_id, city, center_id, date, time, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            appt.id,
            appt.user_id,
            appt.city,
            appt.center_id,
            appt.date.to_string(),
            appt.time.format("%H:%M").to_string(),
            appt.created_at.format(TS_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn count_appointments_for_user(conn: &Connection, user_id: &str) -> anyhow::Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM appointments WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ── Deliveries (idempotency guard) ──

pub fn get_delivery_response(
    conn: &Connection,
    delivery_id: &str,
) -> anyhow::Result<Option<String>> {
    let result = conn.query_row(
        "SELECT response FROM deliveries WHERE delivery_id = ?1",
        params![delivery_id],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(response) => Ok(Some(response)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn insert_delivery(
    conn: &Connection,
    delivery_id: &str,
    user_id: &str,
    response: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO deliveries (delivery_id, user_id, response, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            delivery_id,
            user_id,
            response,
            Utc::now().naive_utc().format(TS_FMT).to_string(),
        ],
    )?;
    Ok(())
}

pub fn sweep_deliveries(conn: &Connection, older_than: &NaiveDateTime) -> anyhow::Result<usize> {
    let cutoff = older_than.format(TS_FMT).to_string();
    let count = conn.execute(
        "DELETE FROM deliveries WHERE created_at < ?1",
        params![cutoff],
    )?;
    Ok(count)
}
