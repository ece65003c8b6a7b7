use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::AppConfig;
use crate::models::Catalog;
use crate::services::ai::LlmProvider;
use crate::services::messaging::MessagingProvider;
use crate::store::ContextStore;

/// Keyed mutex map serializing turns per user. Messages from different
/// users take different locks and never contend.
#[derive(Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    pub fn acquire(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops entries no in-flight turn holds, so the map tracks currently
    /// active users rather than every user ever seen. Returns the number of
    /// entries removed.
    pub fn prune(&self) -> usize {
        let mut locks = self.inner.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ContextStore>,
    pub catalog: Catalog,
    pub llm: Box<dyn LlmProvider>,
    pub messaging: Box<dyn MessagingProvider>,
    user_locks: UserLocks,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ContextStore>,
        catalog: Catalog,
        llm: Box<dyn LlmProvider>,
        messaging: Box<dyn MessagingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            llm,
            messaging,
            user_locks: UserLocks::default(),
        }
    }

    pub fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks.acquire(user_id)
    }

    pub fn prune_user_locks(&self) -> usize {
        self.user_locks.prune()
    }
}
