//! Product and measure stores
//!
//! The engine works on a materialized batch; these adapters load that batch
//! and persist it back. `SqliteStore` reads the warehouse tables
//! (`dim_product`, `fact_sales`) and owns the classification ledger.

use crate::auditor::MeasureMap;
use crate::config::CatalogConfig;
use crate::engine::Classification;
use crate::errors::{Result, TaxonomyError};
use crate::ledger::ClassificationLedger;
use crate::record::{ProductId, ProductRecord};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use std::path::Path;

/// Embedded schema SQL from CATALOG_SCHEMA.sql
const SCHEMA_SQL: &str = include_str!("../CATALOG_SCHEMA.sql");

/// Readable/writable product dimension keyed by `product_id`
pub trait ProductStore {
    /// Every product, ordered by id
    fn load_all(&self) -> Result<Vec<ProductRecord>>;

    /// Persist the classification fields of `records`.
    ///
    /// All-or-nothing: an unknown product id fails the whole batch and
    /// nothing is written. Returns the number of records written.
    fn write_back(&mut self, records: &[ProductRecord]) -> Result<usize>;
}

/// Read-only source of per-product measures
pub trait MeasureSource {
    fn load_measures(&self) -> Result<MeasureMap>;
}

/// In-memory store for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: BTreeMap<ProductId, ProductRecord>,
    measures: MeasureMap,
}

impl InMemoryStore {
    pub fn new(records: impl IntoIterator<Item = ProductRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.product_id, r)).collect(),
            measures: MeasureMap::new(),
        }
    }

    pub fn with_measures(mut self, measures: MeasureMap) -> Self {
        self.measures = measures;
        self
    }

    pub fn get(&self, product_id: ProductId) -> Option<&ProductRecord> {
        self.records.get(&product_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ProductStore for InMemoryStore {
    fn load_all(&self) -> Result<Vec<ProductRecord>> {
        Ok(self.records.values().cloned().collect())
    }

    fn write_back(&mut self, records: &[ProductRecord]) -> Result<usize> {
        if let Some(missing) = records
            .iter()
            .find(|r| !self.records.contains_key(&r.product_id))
        {
            return Err(TaxonomyError::store(format!(
                "unknown product_id {} in write-back batch",
                missing.product_id
            )));
        }
        for record in records {
            self.records.insert(record.product_id, record.clone());
        }
        Ok(records.len())
    }
}

impl MeasureSource for InMemoryStore {
    fn load_measures(&self) -> Result<MeasureMap> {
        Ok(self.measures.clone())
    }
}

/// SQLite warehouse adapter
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the database named by the config
    pub fn open(cfg: &CatalogConfig) -> Result<Self> {
        Self::open_at_path(&cfg.resolved_db_path())
    }

    /// Open (creating if needed) the database at `path` and apply the schema
    pub fn open_at_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaxonomyError::store_with_source(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            TaxonomyError::store_with_source(format!("failed to open db at {}", path.display()), e)
        })?;

        Self::apply_schema(&conn)?;

        tracing::debug!(path = %path.display(), "Catalog DB initialized");

        Ok(Self { conn })
    }

    /// In-memory database with the schema applied
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TaxonomyError::store_with_source("failed to open in-memory db", e))?;

        Self::apply_schema(&conn)?;

        Ok(Self { conn })
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| TaxonomyError::store_with_source("failed to apply schema", e))?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Ledger over the same connection
    pub fn ledger(&self) -> ClassificationLedger<'_> {
        ClassificationLedger::new(&self.conn)
    }

    /// Persist a finished run: labels (unless `dry_run`), its change and
    /// error rows, and the completed run row, all in one transaction.
    ///
    /// On any failure nothing is written and the run row stays `running`.
    pub fn commit_run(
        &mut self,
        run_pk: i64,
        classification: &Classification,
        dry_run: bool,
        stats_json: &str,
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| TaxonomyError::store_with_source("failed to begin run commit", e))?;

        let written = if dry_run {
            0
        } else {
            update_labels(&tx, &classification.records)?;
            classification.records.len()
        };
        {
            let ledger = ClassificationLedger::new(&tx);
            ledger.insert_changes(run_pk, &classification.changes)?;
            ledger.insert_errors(run_pk, &classification.errors)?;
            ledger.complete_run(run_pk, stats_json)?;
        }

        tx.commit()
            .map_err(|e| TaxonomyError::store_with_source("failed to commit run", e))?;

        tracing::info!(run_pk, written, "Committed classification run");
        Ok(written)
    }

    /// Insert one product row. Ingestion normally owns this table; used for
    /// seeding.
    pub fn insert_product(&self, record: &ProductRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO dim_product (product_id, main_sku_code, english_name, category, subcategory)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.product_id,
                    record.sku_code,
                    record.display_name,
                    record.category,
                    record.subcategory,
                ],
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to insert product", e))?;
        Ok(())
    }

    /// Append a sales fact row
    pub fn insert_sale(&self, product_id: ProductId, units: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO fact_sales (product_id, units) VALUES (?1, ?2)",
                params![product_id, units],
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to insert sale", e))?;
        Ok(())
    }
}

impl ProductStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<ProductRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT product_id,
                       COALESCE(main_sku_code, ''),
                       COALESCE(NULLIF(TRIM(english_name), ''), chinese_name, ''),
                       category,
                       subcategory
                FROM dim_product
                ORDER BY product_id
                "#,
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare query", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ProductRecord {
                    product_id: row.get(0)?,
                    sku_code: row.get(1)?,
                    display_name: row.get(2)?,
                    category: row.get(3)?,
                    subcategory: row.get(4)?,
                })
            })
            .map_err(|e| TaxonomyError::store_with_source("failed to query products", e))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(
                row.map_err(|e| TaxonomyError::store_with_source("failed to read product", e))?,
            );
        }

        tracing::debug!(count = records.len(), "Loaded product dimension");
        Ok(records)
    }

    fn write_back(&mut self, records: &[ProductRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| TaxonomyError::store_with_source("failed to begin write-back", e))?;
        update_labels(&tx, records)?;
        tx.commit()
            .map_err(|e| TaxonomyError::store_with_source("failed to commit write-back", e))?;

        tracing::info!(count = records.len(), "Wrote classifications back");
        Ok(records.len())
    }
}

/// Update the two label columns of every record. Runs inside the caller's
/// transaction; an unknown id aborts it.
fn update_labels(conn: &Connection, records: &[ProductRecord]) -> Result<()> {
    let mut stmt = conn
        .prepare(
            r#"
            UPDATE dim_product
            SET category = ?2,
                subcategory = ?3
            WHERE product_id = ?1
            "#,
        )
        .map_err(|e| TaxonomyError::store_with_source("failed to prepare update", e))?;

    for record in records {
        let updated = stmt
            .execute(params![
                record.product_id,
                record.category,
                record.subcategory
            ])
            .map_err(|e| {
                TaxonomyError::store_with_source(
                    format!("failed to update product {}", record.product_id),
                    e,
                )
            })?;
        if updated == 0 {
            return Err(TaxonomyError::store(format!(
                "unknown product_id {} in write-back batch",
                record.product_id
            )));
        }
    }
    Ok(())
}

impl MeasureSource for SqliteStore {
    fn load_measures(&self) -> Result<MeasureMap> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT product_id, COALESCE(SUM(units), 0)
                FROM fact_sales
                GROUP BY product_id
                "#,
            )
            .map_err(|e| TaxonomyError::store_with_source("failed to prepare query", e))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| TaxonomyError::store_with_source("failed to query measures", e))?;

        let mut measures = MeasureMap::new();
        for row in rows {
            let (product_id, units) =
                row.map_err(|e| TaxonomyError::store_with_source("failed to read measure", e))?;
            // Net returns can push a product below zero; count it as no volume.
            measures.insert(product_id, u64::try_from(units).unwrap_or(0));
        }
        Ok(measures)
    }
}
