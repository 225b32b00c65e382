//! Postgres-backed dealer store.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealerscope_core::{DealerKey, DealerRecord, ScrapeRunState, Source};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::store::{is_writable, ApplyOutcome, DealerQuery, DealerStore, StoreError};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dealers (
        id              BIGSERIAL PRIMARY KEY,
        source          TEXT NOT NULL,
        key_name        TEXT NOT NULL,
        key_street      TEXT NOT NULL,
        key_postal_code TEXT NOT NULL,
        name            TEXT NOT NULL,
        street          TEXT NOT NULL DEFAULT '',
        postal_code     TEXT NOT NULL,
        city            TEXT NOT NULL DEFAULT '',
        phone           TEXT,
        email           TEXT,
        website         TEXT,
        services        TEXT[] NOT NULL DEFAULT '{}',
        latitude        DOUBLE PRECISION,
        longitude       DOUBLE PRECISION,
        inactive        BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS dealers_identity_uidx
        ON dealers (source, key_name, key_street, key_postal_code)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS dealers_source_city_idx
        ON dealers (source, lower(city))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_runs (
        source       TEXT PRIMARY KEY,
        last_updated TIMESTAMPTZ NOT NULL
    )
    "#,
];

const UPSERT_DEALER: &str = r#"
    INSERT INTO dealers (
        source, key_name, key_street, key_postal_code,
        name, street, postal_code, city, phone, email, website, services,
        latitude, longitude, inactive, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, FALSE, now())
    ON CONFLICT (source, key_name, key_street, key_postal_code) DO UPDATE SET
        name = EXCLUDED.name,
        street = EXCLUDED.street,
        postal_code = EXCLUDED.postal_code,
        city = EXCLUDED.city,
        phone = EXCLUDED.phone,
        email = EXCLUDED.email,
        website = EXCLUDED.website,
        services = EXCLUDED.services,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        inactive = FALSE,
        updated_at = now()
    WHERE (dealers.name, dealers.street, dealers.postal_code, dealers.city,
           dealers.phone, dealers.email, dealers.website, dealers.services,
           dealers.latitude, dealers.longitude, dealers.inactive)
        IS DISTINCT FROM
          (EXCLUDED.name, EXCLUDED.street, EXCLUDED.postal_code, EXCLUDED.city,
           EXCLUDED.phone, EXCLUDED.email, EXCLUDED.website, EXCLUDED.services,
           EXCLUDED.latitude, EXCLUDED.longitude, FALSE)
"#;

const RETIRE_DEALER: &str = r#"
    UPDATE dealers
       SET inactive = TRUE, updated_at = now()
     WHERE source = $1
       AND key_name = $2
       AND key_street = $3
       AND key_postal_code = $4
       AND inactive = FALSE
"#;

const DEALER_COLUMNS: &str = "source, name, street, postal_code, city, phone, email, website, \
                              services, latitude, longitude, inactive";

/// Errors that mean the database itself is gone, as opposed to one bad row.
fn is_unavailable(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn classify(err: sqlx::Error) -> StoreError {
    if is_unavailable(&err) {
        StoreError::Unavailable(err)
    } else {
        StoreError::Query(err)
    }
}

fn dealer_from_row(row: &PgRow) -> Result<DealerRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
    let source: String = row.try_get("source").map_err(decode)?;
    let source = source
        .parse::<Source>()
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(DealerRecord {
        source,
        name: row.try_get("name").map_err(decode)?,
        street: row.try_get("street").map_err(decode)?,
        postal_code: row.try_get("postal_code").map_err(decode)?,
        city: row.try_get("city").map_err(decode)?,
        phone: row.try_get("phone").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        website: row.try_get("website").map_err(decode)?,
        services: row.try_get("services").map_err(decode)?,
        latitude: row.try_get("latitude").map_err(decode)?,
        longitude: row.try_get("longitude").map_err(decode)?,
        inactive: row.try_get("inactive").map_err(decode)?,
    })
}

#[derive(Debug)]
pub struct PgDealerStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgDealerStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        }
        info!("dealer schema ensured");
        Ok(())
    }
}

#[async_trait]
impl DealerStore for PgDealerStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_ready
            .get_or_try_init(|| self.create_schema())
            .await
            .map(|_| ())
    }

    async fn active_keys(&self, source: Source) -> Result<BTreeSet<DealerKey>, StoreError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            r#"
            SELECT key_name, key_street, key_postal_code
              FROM dealers
             WHERE source = $1 AND inactive = FALSE
            "#,
        )
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
        rows.iter()
            .map(|row| {
                Ok(DealerKey {
                    name: row.try_get("key_name").map_err(decode)?,
                    street: row.try_get("key_street").map_err(decode)?,
                    postal_code: row.try_get("key_postal_code").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn apply(
        &self,
        source: Source,
        to_upsert: &[DealerRecord],
        to_retire: &[DealerKey],
    ) -> Result<ApplyOutcome, StoreError> {
        self.ensure_schema().await?;
        let mut outcome = ApplyOutcome::default();

        for record in to_upsert {
            let key = record.key();
            if !is_writable(record) {
                warn!(%source, %key, "rejecting dealer without identity fields");
                outcome.failed += 1;
                continue;
            }
            let result = sqlx::query(UPSERT_DEALER)
                .bind(source.as_str())
                .bind(&key.name)
                .bind(&key.street)
                .bind(&key.postal_code)
                .bind(&record.name)
                .bind(&record.street)
                .bind(&record.postal_code)
                .bind(&record.city)
                .bind(&record.phone)
                .bind(&record.email)
                .bind(&record.website)
                .bind(&record.services)
                .bind(record.latitude)
                .bind(record.longitude)
                .execute(&self.pool)
                .await;
            match result {
                Ok(done) => outcome.upserted += done.rows_affected(),
                Err(err) if is_unavailable(&err) => return Err(StoreError::Unavailable(err)),
                Err(err) => {
                    warn!(%source, %key, error = %err, "dealer upsert failed");
                    outcome.failed += 1;
                }
            }
        }

        for key in to_retire {
            let result = sqlx::query(RETIRE_DEALER)
                .bind(source.as_str())
                .bind(&key.name)
                .bind(&key.street)
                .bind(&key.postal_code)
                .execute(&self.pool)
                .await;
            match result {
                Ok(done) => outcome.retired += done.rows_affected(),
                Err(err) if is_unavailable(&err) => return Err(StoreError::Unavailable(err)),
                Err(err) => {
                    warn!(%source, %key, error = %err, "dealer retirement failed");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn record_run_completed(&self, source: Source, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO scrape_runs (source, last_updated)
            VALUES ($1, $2)
            ON CONFLICT (source) DO UPDATE SET last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(source.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn run_states(&self) -> Result<Vec<ScrapeRunState>, StoreError> {
        let rows = sqlx::query("SELECT source, last_updated FROM scrape_runs ORDER BY source")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row
                .try_get("source")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            // Rows for sources this build no longer knows are skipped.
            let Ok(source) = source.parse::<Source>() else {
                continue;
            };
            out.push(ScrapeRunState {
                source,
                last_updated: row
                    .try_get("last_updated")
                    .map_err(|e| StoreError::Decode(e.to_string()))?,
            });
        }
        Ok(out)
    }

    async fn find(&self, query: &DealerQuery) -> Result<Vec<DealerRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEALER_COLUMNS}
              FROM dealers
             WHERE ($1::text IS NULL OR source = $1)
               AND ($2::text IS NULL OR lower(city) = lower($2))
               AND (NOT $3 OR (latitude IS NOT NULL AND longitude IS NOT NULL))
             ORDER BY source, name
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.source.map(|s| s.as_str()))
            .bind(query.city.as_deref().map(str::trim))
            .bind(query.with_coordinates_only)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(dealer_from_row).collect()
    }

    async fn get(&self, source: Source, key: &DealerKey) -> Result<Option<DealerRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEALER_COLUMNS}
              FROM dealers
             WHERE source = $1 AND key_name = $2 AND key_street = $3 AND key_postal_code = $4
            "#
        );
        let row = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(&key.name)
            .bind(&key.street)
            .bind(&key.postal_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;
        row.as_ref().map(dealer_from_row).transpose()
    }
}
