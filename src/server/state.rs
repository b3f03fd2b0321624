use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::MegaserviceSpec;
use crate::gateway::Gateway;

/// A request currently being served
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub endpoint: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub megaservice: Arc<MegaserviceSpec>,
    pub gateway: Arc<Gateway>,
    pub active_requests: Arc<DashMap<Uuid, ActiveRequest>>,
}

impl AppState {
    pub fn new(megaservice: MegaserviceSpec, gateway: Gateway) -> Self {
        Self {
            megaservice: Arc::new(megaservice),
            gateway: Arc::new(gateway),
            active_requests: Arc::new(DashMap::new()),
        }
    }

    /// Register an active request; it is removed when the guard drops
    pub fn register_request(&self, id: Uuid, endpoint: &'static str) -> RequestGuard {
        self.active_requests.insert(
            id,
            ActiveRequest {
                endpoint,
                started_at: Utc::now(),
            },
        );
        RequestGuard {
            requests: self.active_requests.clone(),
            id,
        }
    }

    /// Get active request count
    pub fn active_request_count(&self) -> usize {
        self.active_requests.len()
    }
}

/// Keeps a request listed as active for as long as it lives. Streaming
/// responses carry it until the last event is sent or the client goes away.
pub struct RequestGuard {
    requests: Arc<DashMap<Uuid, ActiveRequest>>,
    id: Uuid,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.requests.remove(&self.id);
    }
}
