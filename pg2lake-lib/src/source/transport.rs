//! Replication transport abstraction
//!
//! The reader only needs a handful of replication-protocol primitives: open a
//! replication connection, make sure the slot exists, start streaming, pull
//! CopyData frames and push standby status updates.

use super::protocol::StandbyStatus;
use crate::error::Result;
use crate::types::Lsn;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ReplicationTransport: Send {
    /// Open (or reopen) the replication connection
    async fn connect(&mut self) -> Result<()>;

    /// Create a pgoutput slot, tolerating one that already exists
    async fn create_slot_if_missing(&mut self, slot_name: &str) -> Result<()>;

    /// Issue `START_REPLICATION SLOT .. LOGICAL start_lsn (options)`
    async fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        options: &[(String, String)],
    ) -> Result<()>;

    /// Next CopyData frame; `None` on cancellation or idle timeout
    async fn recv(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>>;

    /// Send a standby status update
    async fn send_status(&mut self, status: StandbyStatus) -> Result<()>;

    fn is_alive(&self) -> bool;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(feature = "postgres")]
pub use libpq::{with_replication_param, PgWalTransport};

#[cfg(feature = "postgres")]
mod libpq {
    use super::*;
    use crate::error::CdcError;
    use pg_walstream::PgReplicationConnection;
    use tracing::{info, warn};

    /// Map libpq error text to the pipeline taxonomy
    fn classify(message: String) -> CdcError {
        let lower = message.to_ascii_lowercase();
        if lower.contains("password authentication failed")
            || lower.contains("no pg_hba.conf entry")
        {
            CdcError::authentication(message)
        } else if lower.contains("publication") && lower.contains("does not exist") {
            CdcError::publication(message)
        } else if lower.contains("replication slot") && lower.contains("does not exist") {
            CdcError::replication_slot(message)
        } else {
            CdcError::connection(message)
        }
    }

    /// Add `replication=database` to a connection string that lacks it
    pub fn with_replication_param(connection_string: &str) -> String {
        if connection_string.contains("replication=") {
            return connection_string.to_string();
        }
        if connection_string.starts_with("postgres://") || connection_string.starts_with("postgresql://") {
            let separator = if connection_string.contains('?') { '&' } else { '?' };
            format!("{}{}replication=database", connection_string, separator)
        } else {
            format!("{} replication=database", connection_string.trim_end())
        }
    }

    /// libpq replication connection provided by `pg_walstream`
    pub struct PgWalTransport {
        connection_string: String,
        connection: Option<PgReplicationConnection>,
    }

    impl PgWalTransport {
        pub fn new(connection_string: &str) -> Self {
            Self {
                connection_string: with_replication_param(connection_string),
                connection: None,
            }
        }

        fn connection(&mut self) -> Result<&mut PgReplicationConnection> {
            self.connection
                .as_mut()
                .ok_or_else(|| CdcError::connection("Replication connection is not open"))
        }
    }

    #[async_trait]
    impl ReplicationTransport for PgWalTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connection = None;
            let connection = PgReplicationConnection::connect(&self.connection_string)
                .map_err(|e| classify(e.to_string()))?;
            connection
                .identify_system()
                .map_err(|e| classify(e.to_string()))?;
            info!("Replication connection established");
            self.connection = Some(connection);
            Ok(())
        }

        async fn create_slot_if_missing(&mut self, slot_name: &str) -> Result<()> {
            let connection = self.connection()?;
            match connection.create_replication_slot(slot_name, "pgoutput") {
                Ok(_) => {
                    info!("Replication slot {} created", slot_name);
                    Ok(())
                }
                Err(e) if e.to_string().contains("already exists") => {
                    warn!("Replication slot {} already exists, continuing", slot_name);
                    Ok(())
                }
                Err(e) => Err(classify(e.to_string())),
            }
        }

        async fn start_replication(
            &mut self,
            slot_name: &str,
            start_lsn: Lsn,
            options: &[(String, String)],
        ) -> Result<()> {
            let options: Vec<(&str, &str)> = options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.connection()?
                .start_replication(slot_name, start_lsn, &options)
                .map_err(|e| classify(e.to_string()))?;
            Ok(())
        }

        async fn recv(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>> {
            let frame = self
                .connection()?
                .get_copy_data_async(cancel)
                .await
                .map_err(|e| classify(e.to_string()))?;
            Ok(frame.map(Bytes::from))
        }

        async fn send_status(&mut self, status: StandbyStatus) -> Result<()> {
            self.connection()?
                .send_standby_status_update(
                    status.received_lsn,
                    status.flushed_lsn,
                    status.applied_lsn,
                    status.reply_requested,
                )
                .map_err(|e| classify(e.to_string()))?;
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.connection.as_ref().map(|c| c.is_alive()).unwrap_or(false)
        }

        async fn close(&mut self) -> Result<()> {
            // dropping the connection issues PQfinish
            self.connection = None;
            Ok(())
        }
    }

}
