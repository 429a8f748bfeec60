//! Batch runs: load → classify → write back → record

use crate::engine::{Classification, ClassificationEngine, PassReport};
use crate::errors::{Result, TaxonomyError};
use crate::ruleset::Taxonomy;
use crate::store::{ProductStore, SqliteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary persisted as the ledger's `stats_json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: String,
    pub fingerprint: String,
    pub dry_run: bool,
    pub records: usize,
    pub changed_records: usize,
    pub field_changes: usize,
    pub errors: usize,
    pub written: usize,
    pub passes: Vec<PassReport>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: RunStats,
    pub classification: Classification,
}

/// Fresh run identifier, e.g. `CLS-20261019-1a2b3c4d`
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "CLS-{}-{}",
        Utc::now().format("%Y%m%d"),
        &suffix[..8]
    )
}

/// Classify every record in `store` and write the batch back.
///
/// With `dry_run` the store is left untouched.
pub fn run_batch<S: ProductStore>(
    store: &mut S,
    taxonomy: &Taxonomy,
    engine: &ClassificationEngine,
    dry_run: bool,
) -> Result<RunReport> {
    let run_id = new_run_id();
    let classification = engine.classify(store.load_all()?, taxonomy);
    let written = if dry_run {
        0
    } else {
        store.write_back(&classification.records)?
    };
    Ok(finish(run_id, dry_run, classification, written))
}

/// [`run_batch`] against the SQLite warehouse, recorded in its ledger.
///
/// Labels and ledger rows commit together. A failed run is marked failed and
/// leaves `dim_product` as it was.
pub fn run_recorded(
    store: &mut SqliteStore,
    taxonomy: &Taxonomy,
    engine: &ClassificationEngine,
    dry_run: bool,
) -> Result<RunReport> {
    let run_id = new_run_id();
    let run_pk = store
        .ledger()
        .start_run(&run_id, taxonomy.fingerprint(), dry_run)?;

    let outcome = record(store, taxonomy, engine, dry_run, run_id, run_pk);

    if let Err(err) = &outcome
        && let Err(mark_err) = store.ledger().fail_run(run_pk, &err.to_string())
    {
        tracing::error!(
            run_pk,
            error = %err,
            mark_error = %mark_err,
            "Could not mark classification run failed"
        );
    }
    outcome
}

fn record(
    store: &mut SqliteStore,
    taxonomy: &Taxonomy,
    engine: &ClassificationEngine,
    dry_run: bool,
    run_id: String,
    run_pk: i64,
) -> Result<RunReport> {
    let classification = engine.classify(store.load_all()?, taxonomy);
    let written = if dry_run {
        0
    } else {
        classification.records.len()
    };
    let report = finish(run_id, dry_run, classification, written);

    let stats_json = serde_json::to_string(&report.stats).map_err(|e| TaxonomyError::Internal {
        message: "failed to serialize run stats".to_string(),
        source: Some(Box::new(e)),
    })?;
    store.commit_run(run_pk, &report.classification, dry_run, &stats_json)?;
    Ok(report)
}

fn finish(
    run_id: String,
    dry_run: bool,
    classification: Classification,
    written: usize,
) -> RunReport {
    let stats = RunStats {
        run_id,
        fingerprint: classification.taxonomy_fingerprint.clone(),
        dry_run,
        records: classification.records.len(),
        changed_records: classification.changed_records(),
        field_changes: classification.changes.len(),
        errors: classification.errors.len(),
        written,
        passes: classification.passes.clone(),
    };

    tracing::info!(
        run_id = %stats.run_id,
        records = stats.records,
        changed = stats.changed_records,
        errors = stats.errors,
        written = stats.written,
        dry_run,
        "Classification run finished"
    );

    RunReport {
        stats,
        classification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Field, ProductRecord};
    use crate::ruleset::RuleSet;
    use crate::rule::{Rule, RuleSpec};
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    fn taxonomy() -> Taxonomy {
        let rules = vec![Rule::compile(&RuleSpec::prefix("cat:cn", "CN", "Furniture")).expect("rule")];
        Taxonomy::new(vec![
            RuleSet::category(rules).expect("category"),
            RuleSet::default_fallback().expect("fallback"),
        ])
        .expect("taxonomy")
    }

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        assert!(id.starts_with("CLS-"));
        assert_eq!(id.len(), "CLS-20261019-".len() + 8);
        assert_ne!(id, new_run_id());
    }

    #[test]
    fn test_run_batch_writes_back() {
        let mut store = InMemoryStore::new(vec![ProductRecord::new(1, "CN1", "stool")]);
        let report = run_batch(&mut store, &taxonomy(), &ClassificationEngine::serial(), false)
            .expect("run");
        assert_eq!(report.stats.written, 1);
        assert_eq!(report.stats.changed_records, 1);
        assert_eq!(report.stats.field_changes, 2);
        let stored = store.get(1).expect("record");
        assert_eq!(stored.label(Field::Category), Some("Furniture"));
    }

    #[test]
    fn test_dry_run_leaves_store_untouched() {
        let mut store = InMemoryStore::new(vec![ProductRecord::new(1, "CN1", "stool")]);
        let report = run_batch(&mut store, &taxonomy(), &ClassificationEngine::serial(), true)
            .expect("run");
        assert_eq!(report.stats.written, 0);
        assert_eq!(report.classification.records[0].label(Field::Category), Some("Furniture"));
        assert!(store.get(1).expect("record").is_unset(Field::Category));
    }

    #[test]
    fn test_recorded_run_lands_in_ledger() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_product(&ProductRecord::new(1, "CN1", "stool"))
            .expect("insert");
        let taxonomy = taxonomy();

        let report = run_recorded(&mut store, &taxonomy, &ClassificationEngine::serial(), false)
            .expect("run");

        let run = store
            .ledger()
            .get_run_by_run_id(&report.stats.run_id)
            .expect("get")
            .expect("recorded");
        assert_eq!(run.fingerprint, taxonomy.fingerprint());
        assert_eq!(run.status, crate::ledger::RunStatus::Completed);
        let stats: RunStats =
            serde_json::from_str(run.stats_json.as_deref().unwrap_or("{}")).expect("stats");
        assert_eq!(stats, report.stats);
        assert_eq!(store.ledger().changes_for_run(run.id).expect("changes").len(), 2);
    }

    #[test]
    fn test_ledger_failure_leaves_labels_untouched() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        store
            .insert_product(&ProductRecord::new(1, "CN1", "stool"))
            .expect("insert");
        store
            .conn()
            .execute_batch("DROP TABLE classification_changes")
            .expect("drop");

        let err = run_recorded(&mut store, &taxonomy(), &ClassificationEngine::serial(), false)
            .expect_err("ledger write fails");
        assert_eq!(err.category(), crate::errors::ErrorCategory::StoreError, "{err}");

        let records = store.load_all().expect("load");
        assert!(records[0].is_unset(Field::Category));
        assert!(records[0].is_unset(Field::Subcategory));

        let runs = store.ledger().list_recent_runs(1).expect("runs");
        assert_eq!(runs[0].status, crate::ledger::RunStatus::Failed);
    }
}
