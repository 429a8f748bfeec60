//! Classification engine: runs a taxonomy's passes over a batch of records
//!
//! Pass semantics:
//!
//! | pass        | eligible records                                  | on match          |
//! |-------------|---------------------------------------------------|-------------------|
//! | category    | category unset                                    | set category      |
//! | subcategory | category == C, subcategory unset                  | set subcategory, else `Other C` |
//! | refinement  | category == C, subcategory == bucket              | set subcategory   |
//! | override    | every record                                      | overwrite         |
//! | fallback    | category or subcategory unset                     | set the unset field |
//!
//! Passes run strictly in sequence. Inside a pass no record reads another
//! record, so a batch is split across the rayon pool once it is large enough;
//! output order always equals input order.

use crate::config::EngineConfig;
use crate::errors::{PredicateError, RecordError};
use crate::record::{Field, ProductId, ProductRecord};
use crate::rule::{RecordView, Rule, synthetic_rule_id};
use crate::ruleset::{PassKind, RuleSet, Taxonomy};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a field's final value came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "rule_id", rename_all = "snake_case")]
pub enum Attribution {
    /// Field is still unset
    Unassigned,
    /// Value was present on input and no pass changed it
    Preexisting,
    /// Value written by the rule with this id
    Rule(String),
}

impl Attribution {
    fn initial(record: &ProductRecord, field: Field) -> Self {
        if record.is_unset(field) {
            Self::Unassigned
        } else {
            Self::Preexisting
        }
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Rule(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => f.write_str("unassigned"),
            Self::Preexisting => f.write_str("pre-existing"),
            Self::Rule(id) => write!(f, "rule:{id}"),
        }
    }
}

/// Final labels of one record and why it carries them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub product_id: ProductId,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub category_source: Attribution,
    pub subcategory_source: Attribution,
}

/// One attributed field write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub pass: String,
    pub product_id: ProductId,
    pub field: Field,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub rule_id: String,
}

/// Per-pass counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub name: String,
    pub kind: String,
    pub eligible: usize,
    pub changed: usize,
    pub errors: usize,
}

/// Output of a single pass
#[derive(Debug, Clone, Default)]
pub struct PassOutput {
    pub report: PassReport,
    pub changes: Vec<FieldChange>,
    pub errors: Vec<RecordError>,
}

/// Output of a full pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Updated records, in input order
    pub records: Vec<ProductRecord>,
    /// One entry per record, in input order
    pub attributions: Vec<ClassificationResult>,
    /// Every field write, in pass order then record order
    pub changes: Vec<FieldChange>,
    pub errors: Vec<RecordError>,
    pub passes: Vec<PassReport>,
    pub taxonomy_fingerprint: String,
}

impl Classification {
    /// No record hit a predicate failure
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of distinct records whose labels differ from the input
    pub fn changed_records(&self) -> usize {
        let mut ids: Vec<ProductId> = self.changes.iter().map(|c| c.product_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Applies rule sets to record batches
#[derive(Debug, Clone, Default)]
pub struct ClassificationEngine {
    cfg: EngineConfig,
}

impl ClassificationEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    /// Engine that never uses the thread pool
    pub fn serial() -> Self {
        Self::new(EngineConfig {
            parallel: false,
            ..EngineConfig::default()
        })
    }

    fn use_parallel(&self, batch: usize) -> bool {
        self.cfg.parallel && batch >= self.cfg.parallel_min_batch.max(1)
    }

    /// Run every pass of `taxonomy` over `records`.
    pub fn classify(&self, mut records: Vec<ProductRecord>, taxonomy: &Taxonomy) -> Classification {
        let mut sources: Vec<(Attribution, Attribution)> = records
            .iter()
            .map(|r| {
                (
                    Attribution::initial(r, Field::Category),
                    Attribution::initial(r, Field::Subcategory),
                )
            })
            .collect();

        let mut changes = Vec::new();
        let mut errors = Vec::new();
        let mut passes = Vec::with_capacity(taxonomy.passes().len());

        for pass in taxonomy.passes() {
            let (output, touched) = self.run_pass_indexed(&mut records, pass);
            for (index, change) in touched.into_iter().zip(&output.changes) {
                let source = match change.new_value {
                    Some(_) => Attribution::Rule(change.rule_id.clone()),
                    None => Attribution::Unassigned,
                };
                match change.field {
                    Field::Category => sources[index].0 = source,
                    Field::Subcategory => sources[index].1 = source,
                }
            }
            changes.extend(output.changes);
            errors.extend(output.errors);
            passes.push(output.report);
        }

        let attributions = records
            .iter()
            .zip(sources)
            .map(|(record, (category_source, subcategory_source))| ClassificationResult {
                product_id: record.product_id,
                category: record.label(Field::Category).map(String::from),
                subcategory: record.label(Field::Subcategory).map(String::from),
                category_source,
                subcategory_source,
            })
            .collect();

        let classification = Classification {
            records,
            attributions,
            changes,
            errors,
            passes,
            taxonomy_fingerprint: taxonomy.fingerprint().to_string(),
        };

        tracing::info!(
            records = classification.records.len(),
            passes = classification.passes.len(),
            changed = classification.changed_records(),
            errors = classification.errors.len(),
            "Classification complete"
        );

        classification
    }

    /// Run one pass in place.
    pub fn run_pass(&self, records: &mut [ProductRecord], pass: &RuleSet) -> PassOutput {
        self.run_pass_indexed(records, pass).0
    }

    /// Run one pass; also returns the record index of every change.
    fn run_pass_indexed(
        &self,
        records: &mut [ProductRecord],
        pass: &RuleSet,
    ) -> (PassOutput, Vec<usize>) {
        let outcomes: Vec<RecordOutcome> = if self.use_parallel(records.len()) {
            records
                .par_iter_mut()
                .map(|record| evaluate_record(pass, record))
                .collect()
        } else {
            records
                .iter_mut()
                .map(|record| evaluate_record(pass, record))
                .collect()
        };

        let mut output = PassOutput {
            report: PassReport {
                name: pass.name().to_string(),
                kind: pass.kind().as_str().to_string(),
                ..PassReport::default()
            },
            ..PassOutput::default()
        };
        let mut touched = Vec::new();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            if outcome.eligible {
                output.report.eligible += 1;
            }
            if !outcome.changes.is_empty() {
                output.report.changed += 1;
            }
            for error in &outcome.errors {
                tracing::warn!(
                    product_id = error.product_id,
                    pass = %error.pass,
                    rule_id = %error.rule_id,
                    error = %error.message,
                    "Predicate failed; record keeps its prior labels"
                );
            }
            output.report.errors += outcome.errors.len();
            touched.extend(std::iter::repeat_n(index, outcome.changes.len()));
            output.changes.extend(outcome.changes);
            output.errors.extend(outcome.errors);
        }

        tracing::debug!(
            pass = %pass.name(),
            kind = %pass.kind(),
            eligible = output.report.eligible,
            changed = output.report.changed,
            errors = output.report.errors,
            "Pass finished"
        );

        (output, touched)
    }
}

/// What one pass did to one record
#[derive(Debug, Default)]
struct RecordOutcome {
    eligible: bool,
    changes: Vec<FieldChange>,
    errors: Vec<RecordError>,
}

impl RecordOutcome {
    fn skipped() -> Self {
        Self::default()
    }

    fn eligible() -> Self {
        Self {
            eligible: true,
            ..Self::default()
        }
    }

    fn push(&mut self, change: Option<FieldChange>) {
        self.changes.extend(change);
    }

    fn fail(&mut self, pass: &RuleSet, record: &ProductRecord, rule: &Rule, err: PredicateError) {
        self.errors.push(RecordError {
            product_id: record.product_id,
            pass: pass.name().to_string(),
            rule_id: rule.id().to_string(),
            message: err.message,
        });
    }
}

/// First rule in evaluation order whose predicate holds.
fn first_match<'r>(
    rules: &'r [Rule],
    view: &RecordView<'_>,
) -> Result<Option<&'r Rule>, (&'r Rule, PredicateError)> {
    for rule in rules {
        match rule.matches(view) {
            Ok(true) => return Ok(Some(rule)),
            Ok(false) => {}
            Err(err) => return Err((rule, err)),
        }
    }
    Ok(None)
}

/// Set a field, returning the change when the value actually differs.
fn write(
    record: &mut ProductRecord,
    pass: &RuleSet,
    field: Field,
    value: Option<&str>,
    rule_id: &str,
) -> Option<FieldChange> {
    let old_value = record.label(field).map(String::from);
    let new_value = value.map(String::from);
    if old_value == new_value {
        return None;
    }
    record.set_label(field, new_value.clone());
    Some(FieldChange {
        pass: pass.name().to_string(),
        product_id: record.product_id,
        field,
        old_value,
        new_value,
        rule_id: rule_id.to_string(),
    })
}

fn evaluate_record(pass: &RuleSet, record: &mut ProductRecord) -> RecordOutcome {
    match pass.kind() {
        PassKind::Category => category_pass(pass, record),
        PassKind::Subcategory {
            category,
            other_label,
        } => subcategory_pass(pass, record, category, other_label),
        PassKind::Refinement { category, bucket } => refinement_pass(pass, record, category, bucket),
        PassKind::Override => override_pass(pass, record),
        PassKind::Fallback => fallback_pass(pass, record),
    }
}

fn category_pass(pass: &RuleSet, record: &mut ProductRecord) -> RecordOutcome {
    if !record.is_unset(Field::Category) {
        return RecordOutcome::skipped();
    }
    let mut outcome = RecordOutcome::eligible();
    let matched = first_match(pass.rules(), &RecordView::new(record));
    match matched {
        Ok(Some(rule)) => {
            let value = rule.assignment().get(Field::Category);
            outcome.push(write(record, pass, Field::Category, value, rule.id()));
        }
        Ok(None) => {}
        Err((rule, err)) => outcome.fail(pass, record, rule, err),
    }
    outcome
}

fn subcategory_pass(
    pass: &RuleSet,
    record: &mut ProductRecord,
    category: &str,
    other_label: &str,
) -> RecordOutcome {
    if record.label(Field::Category) != Some(category) || !record.is_unset(Field::Subcategory) {
        return RecordOutcome::skipped();
    }
    let mut outcome = RecordOutcome::eligible();
    let matched = first_match(pass.rules(), &RecordView::new(record));
    match matched {
        Ok(Some(rule)) => {
            let value = rule.assignment().get(Field::Subcategory);
            outcome.push(write(record, pass, Field::Subcategory, value, rule.id()));
        }
        Ok(None) => {
            let synthetic = synthetic_rule_id(category);
            outcome.push(write(
                record,
                pass,
                Field::Subcategory,
                Some(other_label),
                &synthetic,
            ));
        }
        Err((rule, err)) => outcome.fail(pass, record, rule, err),
    }
    outcome
}

fn refinement_pass(
    pass: &RuleSet,
    record: &mut ProductRecord,
    category: &str,
    bucket: &str,
) -> RecordOutcome {
    if record.label(Field::Category) != Some(category)
        || record.label(Field::Subcategory) != Some(bucket)
    {
        return RecordOutcome::skipped();
    }
    let mut outcome = RecordOutcome::eligible();
    let matched = first_match(pass.rules(), &RecordView::new(record));
    match matched {
        Ok(Some(rule)) => {
            let value = rule.assignment().get(Field::Subcategory);
            outcome.push(write(record, pass, Field::Subcategory, value, rule.id()));
        }
        Ok(None) => {}
        Err((rule, err)) => outcome.fail(pass, record, rule, err),
    }
    outcome
}

fn override_pass(pass: &RuleSet, record: &mut ProductRecord) -> RecordOutcome {
    let mut outcome = RecordOutcome::eligible();
    let matched = first_match(pass.rules(), &RecordView::new(record));
    let rule = match matched {
        Ok(Some(rule)) => rule,
        Ok(None) => return outcome,
        Err((rule, err)) => {
            outcome.fail(pass, record, rule, err);
            return outcome;
        }
    };

    for (field, value) in rule.apply() {
        outcome.push(write(record, pass, field, Some(value), rule.id()));
    }

    // A category move without a subcategory leaves a label from the old
    // category behind; clear it so the fallback pass re-derives it.
    let moved = outcome.changes.iter().any(|c| c.field == Field::Category);
    if moved && !rule.assignment().assigns(Field::Subcategory) {
        outcome.push(write(record, pass, Field::Subcategory, None, rule.id()));
    }
    outcome
}

fn fallback_pass(pass: &RuleSet, record: &mut ProductRecord) -> RecordOutcome {
    if !record.is_unset(Field::Category) && !record.is_unset(Field::Subcategory) {
        return RecordOutcome::skipped();
    }
    let mut outcome = RecordOutcome::eligible();

    // Category first: scoped subcategory fallbacks depend on it.
    for field in [Field::Category, Field::Subcategory] {
        if !record.is_unset(field) {
            continue;
        }
        let chosen = {
            let view = RecordView::new(record);
            let mut chosen = None;
            for rule in pass.rules().iter().filter(|r| r.assignment().assigns(field)) {
                // A failing scoped fallback is skipped so the unconditional
                // rule still terminates the record.
                let hit = if rule.is_unconditional() {
                    Ok(true)
                } else {
                    rule.matches(&view)
                };
                match hit {
                    Ok(true) => {
                        chosen = Some(rule);
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => outcome.fail(pass, view.record(), rule, err),
                }
            }
            chosen
        };
        if let Some(rule) = chosen {
            let value = rule.assignment().get(field);
            outcome.push(write(record, pass, field, value, rule.id()));
        }
    }
    outcome
}
