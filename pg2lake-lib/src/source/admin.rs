use crate::error::{CdcError, Result};
use crate::types::{parse_lsn, Lsn};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{info, warn};

/// Regular (non-replication) connection used for slot and publication checks
pub struct PostgresAdmin {
    client: Option<Client>,
    connection_string: String,
}

impl PostgresAdmin {
    pub fn new(connection_string: &str) -> Self {
        Self {
            client: None,
            connection_string: without_replication_param(connection_string),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        info!(
            "Connecting to PostgreSQL: {}",
            mask_password(&self.connection_string)
        );
        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });

        self.client = Some(client);
        Ok(())
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CdcError::connection("PostgreSQL connection not established"))
    }

    pub async fn publication_exists(&self, publication_name: &str) -> Result<bool> {
        let rows = self
            .client()?
            .query(
                "SELECT pubname FROM pg_publication WHERE pubname = $1",
                &[&publication_name],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Fail with [`CdcError::Publication`] when the publication is missing
    pub async fn verify_publication(&self, publication_name: &str) -> Result<()> {
        if self.publication_exists(publication_name).await? {
            Ok(())
        } else {
            Err(CdcError::publication(format!(
                "Publication '{}' does not exist; create it with CREATE PUBLICATION {} FOR ALL TABLES",
                publication_name, publication_name
            )))
        }
    }

    pub async fn replication_slot_exists(&self, slot_name: &str) -> Result<bool> {
        let rows = self
            .client()?
            .query(
                "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Position the server has confirmed as flushed for the slot
    pub async fn confirmed_flush_lsn(&self, slot_name: &str) -> Result<Option<Lsn>> {
        let query = format!(
            "SELECT confirmed_flush_lsn::text AS lsn FROM pg_replication_slots WHERE slot_name = '{}'",
            slot_name.replace('\'', "''")
        );
        let messages = self.client()?.simple_query(&query).await?;
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                return match row.get("lsn") {
                    Some(text) => Ok(Some(parse_lsn(text)?)),
                    None => Ok(None),
                };
            }
        }
        Err(CdcError::replication_slot(format!(
            "Replication slot '{}' not found",
            slot_name
        )))
    }

    pub async fn drop_replication_slot(&self, slot_name: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot_name);
        self.client()?
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
            .await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.client = None;
    }
}

/// Strip `replication=...` so the admin connection speaks plain SQL
fn without_replication_param(connection_string: &str) -> String {
    if let Some((base, query)) = connection_string.split_once('?') {
        let params: Vec<&str> = query
            .split('&')
            .filter(|p| !p.starts_with("replication="))
            .collect();
        if params.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, params.join("&"))
        }
    } else {
        connection_string
            .split_whitespace()
            .filter(|p| !p.starts_with("replication="))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Mask the password of a keyword/value or URL connection string for logging
pub fn mask_password(connection_string: &str) -> String {
    if let Some(start) = connection_string.find("password=") {
        let value_start = start + "password=".len();
        let value_end = connection_string[value_start..]
            .find(' ')
            .map(|i| value_start + i)
            .unwrap_or(connection_string.len());
        let mut masked = connection_string.to_string();
        masked.replace_range(value_start..value_end, "***");
        return masked;
    }
    if let Some(scheme_end) = connection_string.find("://") {
        let rest = &connection_string[scheme_end + 3..];
        if let Some(at) = rest.find('@') {
            if let Some(colon) = rest[..at].find(':') {
                let mut masked = connection_string.to_string();
                let from = scheme_end + 3 + colon + 1;
                masked.replace_range(from..scheme_end + 3 + at, "***");
                return masked;
            }
        }
    }
    connection_string.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("host=db user=u password=secret dbname=app"),
            "host=db user=u password=*** dbname=app"
        );
        assert_eq!(
            mask_password("postgresql://u:secret@db:5432/app"),
            "postgresql://u:***@db:5432/app"
        );
        assert_eq!(mask_password("host=db"), "host=db");
    }

    #[test]
    fn test_without_replication_param() {
        assert_eq!(
            without_replication_param("postgresql://db/app?replication=database&sslmode=disable"),
            "postgresql://db/app?sslmode=disable"
        );
        assert_eq!(
            without_replication_param("postgresql://db/app?replication=database"),
            "postgresql://db/app"
        );
        assert_eq!(
            without_replication_param("host=db replication=database"),
            "host=db"
        );
    }
}
