//! Product taxonomy classification
//!
//! Assigns a `category` and `subcategory` to every product in the catalog
//! through an ordered pipeline of rule passes:
//!
//! 1. category (SKU prefix, then keyword)
//! 2. subcategory, one pass per category, with an `Other <Category>` catch-all
//! 3. refinement, re-classifying records out of a catch-all bucket
//! 4. override, the only pass that overwrites
//! 5. fallback, which guarantees no label is left unset
//!
//! Rules are data (a TOML document, see [`ruleset::TaxonomyDocument`]). Every
//! write is attributed to a rule id, and the convergence auditor reports how
//! much of each category still sits in a catch-all bucket.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod auditor;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod record;
pub mod rule;
pub mod ruleset;
pub mod runner;
pub mod store;

pub use auditor::{
    AuditRow, AuditSummary, BucketDelta, BucketStats, ConvergenceAuditor, ConvergenceWarning,
    LabelKey, MeasureMap, Offender, ShareBasis, convergence_delta, convergence_warnings,
    summarize,
};
pub use config::{CatalogConfig, ConvergenceConfig, EngineConfig, OffendersConfig};
pub use engine::{
    Attribution, Classification, ClassificationEngine, ClassificationResult, FieldChange,
    PassOutput, PassReport,
};
pub use errors::{ErrorCategory, PredicateError, RecordError, Result, TaxonomyError};
pub use ledger::{ChangeRecord, ClassificationLedger, RunRecord, RunStatus};
pub use record::{Field, ProductId, ProductRecord};
pub use rule::{Assignment, Condition, Predicate, RecordView, Rule, RuleSpec, RuleTier};
pub use ruleset::{CatchAll, PassKind, RuleOrdering, RuleSet, Taxonomy};
pub use runner::{RunReport, RunStats, run_batch, run_recorded};
pub use store::{InMemoryStore, MeasureSource, ProductStore, SqliteStore};

use serde::Serialize;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convergence audit of the current warehouse state
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub rows: Vec<AuditRow>,
    pub totals: BucketStats,
    pub basis: ShareBasis,
    pub threshold: f64,
    pub warnings: Vec<ConvergenceWarning>,
}

/// Main entry point: config, warehouse and compiled rules together
pub struct CatalogEngine {
    cfg: CatalogConfig,
    store: SqliteStore,
    taxonomy: Taxonomy,
    engine: ClassificationEngine,
}

impl CatalogEngine {
    /// Load config from the default location, open the warehouse and compile the rules
    pub fn new() -> Result<Self> {
        Self::with_config(CatalogConfig::load()?)
    }

    pub fn with_config(cfg: CatalogConfig) -> Result<Self> {
        let taxonomy = Taxonomy::load_from_path(&cfg.resolved_rules_path())?;
        let store = SqliteStore::open(&cfg)?;

        tracing::info!(
            version = VERSION,
            db_path = %cfg.resolved_db_path().display(),
            rules_path = %cfg.resolved_rules_path().display(),
            passes = taxonomy.passes().len(),
            rules = taxonomy.rule_count(),
            fingerprint = %taxonomy.fingerprint(),
            "Catalog engine initialized"
        );

        Ok(Self::from_parts(cfg, store, taxonomy))
    }

    pub fn from_parts(cfg: CatalogConfig, store: SqliteStore, taxonomy: Taxonomy) -> Self {
        let engine = ClassificationEngine::new(cfg.engine.clone());
        Self {
            cfg,
            store,
            taxonomy,
            engine,
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.cfg
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Run the pipeline over the whole warehouse and record the run
    pub fn classify(&mut self, dry_run: bool) -> Result<RunReport> {
        run_recorded(&mut self.store, &self.taxonomy, &self.engine, dry_run)
    }

    /// Summarize stored labels and flag oversized catch-all buckets
    pub fn audit(&self, threshold: Option<f64>, basis: Option<ShareBasis>) -> Result<AuditReport> {
        let threshold = threshold.unwrap_or(self.cfg.convergence.threshold);
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(TaxonomyError::config(format!(
                "threshold must be in (0, 1], got {threshold}"
            )));
        }
        let basis = basis.unwrap_or(self.cfg.convergence.basis);

        let records = self.store.load_all()?;
        let measures = self.store.load_measures()?;
        let summary = summarize(&records, &measures);
        let warnings = convergence_warnings(
            &summary,
            &self.taxonomy.catch_all_buckets(),
            threshold,
            basis,
        );

        Ok(AuditReport {
            rows: summary.rows(),
            totals: summary.totals(),
            basis,
            threshold,
            warnings,
        })
    }

    /// Highest-volume records still in `bucket` (default `Other <category>`)
    pub fn top_offenders(
        &self,
        category: &str,
        bucket: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Offender>> {
        let records = self.store.load_all()?;
        let measures = self.store.load_measures()?;
        let bucket = bucket
            .map(String::from)
            .unwrap_or_else(|| ruleset::default_other_label(category));
        let limit = limit.unwrap_or(self.cfg.offenders.default_limit);
        Ok(ConvergenceAuditor::new(&records, &measures).top_offenders(category, &bucket, limit))
    }

    /// Most recent ledger runs
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.store.ledger().list_recent_runs(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RULES: &str = r#"
        [[pass]]
        kind = "category"
        [[pass.rule]]
        id = "cat:nb"
        tier = "prefix"
        when = { sku_prefix = "NB" }
        category = "Furniture"

        [[pass]]
        kind = "subcategory"
        category = "Furniture"

        [[pass]]
        kind = "fallback"
        [[pass.rule]]
        id = "fb:category"
        tier = "fallback"
        when = "always"
        category = "Other"
        [[pass.rule]]
        id = "fb:subcategory"
        tier = "fallback"
        when = "always"
        subcategory = "Uncategorized"
    "#;

    fn engine() -> CatalogEngine {
        let store = SqliteStore::open_in_memory().expect("open");
        for (id, sku, name, units) in [
            (1, "NB1", "oak table", 30),
            (2, "NB2", "pine table", 50),
            (3, "QQ3", "mystery box", 5),
        ] {
            store
                .insert_product(&ProductRecord::new(id, sku, name))
                .expect("insert");
            store.insert_sale(id, units).expect("sale");
        }
        let taxonomy = Taxonomy::from_toml_str(RULES).expect("rules");
        CatalogEngine::from_parts(CatalogConfig::default(), store, taxonomy)
    }

    #[test]
    fn test_classify_then_audit() {
        let mut engine = engine();
        let report = engine.classify(false).expect("classify");
        assert_eq!(report.stats.records, 3);

        let audit = engine.audit(Some(0.5), None).expect("audit");
        assert_eq!(audit.totals.records, 3);
        let keys: Vec<(&str, &str)> = audit
            .warnings
            .iter()
            .map(|w| (w.category.as_str(), w.subcategory.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("Furniture", "Other Furniture"), ("Other", "Uncategorized")]
        );

        let offenders = engine
            .top_offenders("Furniture", None, Some(1))
            .expect("offenders");
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].product_id, 2);

        assert_eq!(engine.recent_runs(5).expect("runs").len(), 1);
    }

    #[test]
    fn test_audit_rejects_bad_threshold() {
        let engine = engine();
        let err = engine.audit(Some(0.0), None).expect_err("bad threshold");
        assert_eq!(err.category(), ErrorCategory::ConfigurationError);
    }
}
