// =============================================================================
// Adjustment sources — where the admin-configured offsets come from
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use tracing::{debug, warn};

use crate::types::canonical_symbol;

/// Full contents of the adjustment table: symbol -> amount.
pub type AdjustmentMap = HashMap<String, f64>;

/// Read-only view of the external adjustment table.
#[async_trait]
pub trait AdjustmentSource: Send + Sync {
    /// Fetch every row. Partial results are never returned.
    async fn fetch_all(&self) -> Result<AdjustmentMap>;
}

/// Reads `coin_symbol` / `adjustment_amount` rows from MySQL.
pub struct MySqlAdjustmentSource {
    pool: MySqlPool,
    query: String,
}

impl MySqlAdjustmentSource {
    /// Build a lazily-connecting pool; nothing touches the network until the
    /// first fetch.
    pub fn connect_lazy(database_url: &str, table: &str) -> Result<Self> {
        if !is_valid_identifier(table) {
            anyhow::bail!("invalid adjustment table name: {table:?}");
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect_lazy(database_url)
            .context("invalid adjustment database URL")?;

        // The amount column may be DECIMAL or DOUBLE; reading it as text
        // decodes either.
        let query = format!(
            "SELECT coin_symbol, CAST(adjustment_amount AS CHAR) AS adjustment_amount FROM {table}"
        );
        Ok(Self { pool, query })
    }
}

#[async_trait]
impl AdjustmentSource for MySqlAdjustmentSource {
    async fn fetch_all(&self) -> Result<AdjustmentMap> {
        let rows = sqlx::query(&self.query)
            .fetch_all(&self.pool)
            .await
            .context("adjustment query failed")?;

        let mut map = AdjustmentMap::with_capacity(rows.len());
        for row in rows {
            let symbol: String = row.try_get("coin_symbol").context("coin_symbol column")?;
            let raw: Option<String> = row
                .try_get("adjustment_amount")
                .context("adjustment_amount column")?;
            match parse_amount(raw.as_deref()) {
                Some(amount) => {
                    map.insert(canonical_symbol(&symbol), amount);
                }
                None => warn!(symbol = %symbol, raw = ?raw, "skipping unparsable adjustment row"),
            }
        }

        debug!(rows = map.len(), "adjustment rows fetched");
        Ok(map)
    }
}

fn parse_amount(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
