//! Persistence for host attributes learned out-of-band (e.g. from resource
//! offers) and a [`AttributeLoader`](crate::constraints::AttributeLoader)
//! backed by that table.
//!
//! The spec treats attribute lookup as an externally supplied collaborator;
//! this is the scheduler's own default implementation of that collaborator,
//! useful standalone and for the `schedulerctl` CLI.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::constraints::AttributeLoader;
use crate::error::Result;
use crate::model::Attribute;
use crate::store::Storage;

pub async fn record_attribute(conn: &mut SqliteConnection, host: &str, name: &str, value: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO host_attributes (host, name, value) VALUES (?, ?, ?)")
        .bind(host)
        .bind(name)
        .bind(value)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn fetch_attributes(conn: &mut SqliteConnection, host: &str) -> Result<Vec<Attribute>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT name, value FROM host_attributes WHERE host = ? ORDER BY name")
            .bind(host)
            .fetch_all(conn)
            .await?;
    let mut by_name: Vec<Attribute> = Vec::new();
    for (name, value) in rows {
        match by_name.iter_mut().find(|a| a.name == name) {
            Some(attr) => {
                attr.values.insert(value);
            }
            None => {
                let mut values = BTreeSet::new();
                values.insert(value);
                by_name.push(Attribute { name, values });
            }
        }
    }
    Ok(by_name)
}

/// An [`AttributeLoader`] backed directly by the `host_attributes` table.
pub struct StoredAttributeLoader {
    storage: Storage,
}

impl StoredAttributeLoader {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AttributeLoader for StoredAttributeLoader {
    async fn load(&self, host: &str) -> Result<Vec<Attribute>> {
        let mut conn = self.storage.acquire().await?;
        fetch_attributes(&mut conn, host).await
    }
}
