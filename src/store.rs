use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{Appointment, ConversationContext};

/// Durable per-user conversation state. The persistence medium is an
/// implementation detail behind this trait; the orchestrator only relies on
/// the contract below.
pub trait ContextStore: Send + Sync {
    /// Existing context, or a fresh greeting-stage one for an unseen user.
    fn load(&self, user_id: &str) -> anyhow::Result<ConversationContext>;

    /// Read-only lookup; `None` when the user has no context.
    fn get(&self, user_id: &str) -> anyhow::Result<Option<ConversationContext>>;

    /// Atomic full-context upsert.
    fn save(&self, ctx: &ConversationContext) -> anyhow::Result<()>;

    /// Clears booking progress; history is kept when `keep_history`.
    /// Returns false when no context existed.
    fn reset(&self, user_id: &str, keep_history: bool) -> anyhow::Result<bool>;

    /// Purges contexts (and delivery records) last active strictly before
    /// the cutoff. Returns the number of contexts removed.
    fn sweep(&self, older_than: NaiveDateTime) -> anyhow::Result<usize>;

    /// Commits the context together with its newly finalized appointment in
    /// one transaction. A booked context must never become durable without
    /// its appointment row; on failure neither is written and the whole turn
    /// stays retryable.
    fn save_booking(
        &self,
        ctx: &ConversationContext,
        appointment: &Appointment,
    ) -> anyhow::Result<()>;

    /// Cached response for an already-processed delivery, if any.
    fn delivery_response(&self, delivery_id: &str) -> anyhow::Result<Option<String>>;

    fn record_delivery(
        &self,
        delivery_id: &str,
        user_id: &str,
        response: &str,
    ) -> anyhow::Result<()>;
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl ContextStore for SqliteStore {
    fn load(&self, user_id: &str) -> anyhow::Result<ConversationContext> {
        let conn = self.conn.lock().unwrap();
        Ok(queries::get_context(&conn, user_id)?
            .unwrap_or_else(|| ConversationContext::new(user_id)))
    }

    fn get(&self, user_id: &str) -> anyhow::Result<Option<ConversationContext>> {
        let conn = self.conn.lock().unwrap();
        queries::get_context(&conn, user_id)
    }

    fn save(&self, ctx: &ConversationContext) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        queries::upsert_context(&conn, ctx)
    }

    fn reset(&self, user_id: &str, keep_history: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let Some(mut ctx) = queries::get_context(&conn, user_id)? else {
            return Ok(false);
        };
        ctx.reset_booking();
        if !keep_history {
            ctx.history.clear();
        }
        ctx.last_active = Utc::now().naive_utc();
        queries::upsert_context(&conn, &ctx)?;
        Ok(true)
    }

    fn sweep(&self, older_than: NaiveDateTime) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let purged = queries::sweep_contexts(&conn, &older_than)?;
        queries::sweep_deliveries(&conn, &older_than)?;
        Ok(purged)
    }

    fn save_booking(
        &self,
        ctx: &ConversationContext,
        appointment: &Appointment,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        queries::upsert_context(&tx, ctx)?;
        queries::insert_appointment(&tx, appointment)?;
        tx.commit()?;
        Ok(())
    }

    fn delivery_response(&self, delivery_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        queries::get_delivery_response(&conn, delivery_id)
    }

    fn record_delivery(
        &self,
        delivery_id: &str,
        user_id: &str,
        response: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        queries::insert_delivery(&conn, delivery_id, user_id, response)
    }
}
