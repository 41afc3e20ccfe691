use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{infrastructure::state::AppState, services::approvals::ApprovalService};

/// Periodically expires pending approvals whose tokens have lapsed.
pub fn spawn_sweep_worker(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = state.config.sweep_interval();
    tokio::spawn(async move {
        let service = ApprovalService::new(Arc::clone(&state));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match service.sweep().await {
                Ok(0) => {}
                Ok(count) => info!(count, "expired stale approval requests"),
                Err(err) => warn!(error = ?err, "approval sweep failed"),
            }
        }
    })
}
