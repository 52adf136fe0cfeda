//! Background renewal of a held lock session

use crate::coordination::consul::ConsulClient;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Wait between attempts after a failed renewal
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Renew `session` every TTL/2 until Consul drops it or it goes unrenewed for a full TTL.
///
/// Loss is reported by sending `true`; the sender is dropped on return either way.
pub(crate) async fn renew_loop(client: ConsulClient, session: String, lost: watch::Sender<bool>) {
    let ttl = client.session_ttl();
    let mut last_renewed = Instant::now();
    let mut wait = ttl / 2;

    loop {
        tokio::time::sleep(wait).await;

        match client.renew_session(&session).await {
            Ok(true) => {
                tracing::trace!("Renewed session {}", session);
                last_renewed = Instant::now();
                wait = ttl / 2;
            }
            Ok(false) => {
                tracing::error!("Session {} was invalidated by Consul", session);
                break;
            }
            Err(e) => {
                if last_renewed.elapsed() >= ttl {
                    tracing::error!("Session {} expired: unrenewed for {:?} ({})", session, ttl, e);
                    break;
                }
                tracing::warn!("Failed to renew session {}: {}", session, e);
                wait = RETRY_INTERVAL;
            }
        }
    }

    let _ = lost.send(true);
}
