//! Bridge from PostgreSQL `NOTIFY` to the in-process event bus.
//!
//! The `compliance_checks_notify` trigger publishes every status transition on
//! [`CHECK_NOTIFY_CHANNEL`]. This task republishes them so status streams see
//! changes made by any writer, including other processes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::{Pool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use regula_core::defaults::CHECK_NOTIFY_CHANNEL;
use regula_core::{Error, EventBus, Result, ServerEvent};

/// Delay before re-establishing a dropped listener connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Listen for check updates until `cancel` fires.
///
/// Connection losses are retried after [`RECONNECT_DELAY`]; malformed payloads
/// are logged and skipped.
pub async fn listen_for_check_updates(
    pool: Pool<Postgres>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let mut listener = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = connect(&pool) => match res {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(
                        subsystem = "db",
                        component = "listener",
                        error = %e,
                        "Failed to start check update listener, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            },
        };

        info!(
            subsystem = "db",
            component = "listener",
            channel = CHECK_NOTIFY_CHANNEL,
            "Listening for check updates"
        );

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                n = listener.recv() => n,
            };

            match notification {
                Ok(notification) => match parse_payload(notification.payload()) {
                    Ok(event) => {
                        debug!(
                            subsystem = "db",
                            component = "listener",
                            check_id = %event.check_id(),
                            "Check update notification"
                        );
                        bus.emit(event);
                    }
                    Err(e) => warn!(
                        subsystem = "db",
                        component = "listener",
                        error = %e,
                        "Ignoring malformed check update payload"
                    ),
                },
                Err(e) => {
                    warn!(
                        subsystem = "db",
                        component = "listener",
                        error = %e,
                        "Check update listener connection lost"
                    );
                    break;
                }
            }
        }
    }
}

async fn connect(pool: &Pool<Postgres>) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(Error::Database)?;
    listener
        .listen(CHECK_NOTIFY_CHANNEL)
        .await
        .map_err(Error::Database)?;
    Ok(listener)
}

/// Parse a trigger payload into a [`ServerEvent`].
pub fn parse_payload(payload: &str) -> Result<ServerEvent> {
    serde_json::from_str(payload).map_err(|e| Error::Stream(format!("bad notify payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regula_core::CheckStatus;
    use uuid::Uuid;

    #[test]
    fn test_parse_trigger_payload() {
        let payload = format!(
            r#"{{"type":"check_updated","check_id":"{}","organization_id":"{}","status":"processing"}}"#,
            Uuid::from_u128(7),
            Uuid::from_u128(8)
        );
        let event = parse_payload(&payload).unwrap();
        assert_eq!(event.check_id(), Uuid::from_u128(7));
        match event {
            ServerEvent::CheckUpdated { status, .. } => assert_eq!(status, CheckStatus::Processing),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_payload("not json").unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }
}
