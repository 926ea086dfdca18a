use std::time::Duration;

use tracing::{debug, error};

use muse_api::state::AppState;

/// How often expired pending registrations are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Drops pending registrations whose verification window has passed.
/// The first tick fires immediately and doubles as a startup sweep; the
/// loop runs for the life of the process.
pub async fn purge_pending_loop(state: AppState) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;

        let db = state.clone();
        let purged = tokio::task::spawn_blocking(move || db.db.purge_expired_pending()).await;
        match purged {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => debug!("Purged {n} expired pending registrations"),
            Ok(Err(e)) => error!("Failed to purge pending registrations: {e:#}"),
            Err(e) => error!("Pending purge task panicked: {e:#}"),
        }
    }
}
