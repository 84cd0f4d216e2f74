use std::sync::Arc;

use parley_core::{Conversations, SessionManager};
use parley_db::Database;

use crate::registry::{DevicePolicy, Registry};
use crate::router::Router;

/// Everything a connection handler needs, built once at startup and passed
/// down explicitly. There is no process-global state.
#[derive(Clone)]
pub struct Context {
    pub db: Arc<Database>,
    pub sessions: SessionManager,
    pub conversations: Conversations,
    pub registry: Registry,
    pub router: Router,
}

impl Context {
    pub fn new(db: Arc<Database>, policy: DevicePolicy) -> Self {
        let sessions = SessionManager::new(db.clone());
        let conversations = Conversations::new(db.clone());
        let registry = Registry::new(policy);
        let router = Router::new(registry.clone(), conversations.clone());
        Self {
            db,
            sessions,
            conversations,
            registry,
            router,
        }
    }
}
