//! Convergence auditor
//!
//! Read-only aggregation over a classified batch. Groups records by
//! (category, subcategory), sums the unit measure, and flags catch-all buckets
//! that still hold too large a share of their category.

use crate::record::{Field, ProductId, ProductRecord};
use crate::ruleset::CatchAll;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Total units per product, from the fact source
pub type MeasureMap = HashMap<ProductId, u64>;

/// Label shown for a field that is still unset
pub const UNSET_LABEL: &str = "(unset)";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelKey {
    pub category: String,
    pub subcategory: String,
}

impl LabelKey {
    pub fn new(category: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            subcategory: subcategory.into(),
        }
    }

    fn of(record: &ProductRecord) -> Self {
        Self::new(
            record.label(Field::Category).unwrap_or(UNSET_LABEL),
            record.label(Field::Subcategory).unwrap_or(UNSET_LABEL),
        )
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.category, self.subcategory)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub records: u64,
    pub units: u64,
}

impl BucketStats {
    fn add(&mut self, units: u64) {
        self.records += 1;
        self.units = self.units.saturating_add(units);
    }

    fn merge(&mut self, other: &BucketStats) {
        self.records += other.records;
        self.units = self.units.saturating_add(other.units);
    }
}

/// Which aggregate a share is computed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareBasis {
    /// SKU count
    #[default]
    Records,
    /// Summed unit volume
    Units,
}

impl ShareBasis {
    pub fn pick(&self, stats: &BucketStats) -> u64 {
        match self {
            Self::Records => stats.records,
            Self::Units => stats.units,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::Units => "units",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "records" => Some(Self::Records),
            "units" => Some(Self::Units),
            _ => None,
        }
    }
}

/// One flattened summary line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub category: String,
    pub subcategory: String,
    pub records: u64,
    pub units: u64,
}

/// Snapshot of label counts and volumes for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    buckets: BTreeMap<LabelKey, BucketStats>,
    totals: BucketStats,
}

impl AuditSummary {
    pub fn get(&self, category: &str, subcategory: &str) -> BucketStats {
        self.buckets
            .get(&LabelKey::new(category, subcategory))
            .copied()
            .unwrap_or_default()
    }

    pub fn totals(&self) -> BucketStats {
        self.totals
    }

    pub fn category_totals(&self, category: &str) -> BucketStats {
        let mut stats = BucketStats::default();
        for (key, bucket) in &self.buckets {
            if key.category == category {
                stats.merge(bucket);
            }
        }
        stats
    }

    /// Fraction of `category` held by the bucket; 0.0 for an empty category.
    pub fn share(&self, category: &str, subcategory: &str, basis: ShareBasis) -> f64 {
        let whole = basis.pick(&self.category_totals(category));
        if whole == 0 {
            return 0.0;
        }
        basis.pick(&self.get(category, subcategory)) as f64 / whole as f64
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LabelKey, &BucketStats)> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Rows sorted by category, then subcategory
    pub fn rows(&self) -> Vec<AuditRow> {
        self.buckets
            .iter()
            .map(|(key, stats)| AuditRow {
                category: key.category.clone(),
                subcategory: key.subcategory.clone(),
                records: stats.records,
                units: stats.units,
            })
            .collect()
    }
}

/// Group `records` by label and sum their measures.
///
/// Products missing from `measures` count as zero units.
pub fn summarize(records: &[ProductRecord], measures: &MeasureMap) -> AuditSummary {
    let mut summary = AuditSummary::default();
    for record in records {
        let units = measures.get(&record.product_id).copied().unwrap_or(0);
        summary
            .buckets
            .entry(LabelKey::of(record))
            .or_default()
            .add(units);
        summary.totals.add(units);
    }
    summary
}

/// A record still sitting in a catch-all bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub product_id: ProductId,
    pub sku_code: String,
    pub display_name: String,
    pub units: u64,
}

/// Auditor bound to one classified batch and its measures
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceAuditor<'a> {
    records: &'a [ProductRecord],
    measures: &'a MeasureMap,
}

impl<'a> ConvergenceAuditor<'a> {
    pub fn new(records: &'a [ProductRecord], measures: &'a MeasureMap) -> Self {
        Self { records, measures }
    }

    pub fn summarize(&self) -> AuditSummary {
        summarize(self.records, self.measures)
    }

    /// Highest-volume records labelled `category` / `bucket`.
    ///
    /// Ordered by units descending, then product id ascending.
    pub fn top_offenders(&self, category: &str, bucket: &str, limit: usize) -> Vec<Offender> {
        let mut offenders: Vec<Offender> = self
            .records
            .iter()
            .filter(|r| {
                r.label(Field::Category) == Some(category)
                    && r.label(Field::Subcategory) == Some(bucket)
            })
            .map(|r| Offender {
                product_id: r.product_id,
                sku_code: r.sku_code.clone(),
                display_name: r.display_name.clone(),
                units: self.measures.get(&r.product_id).copied().unwrap_or(0),
            })
            .collect();
        offenders.sort_by_key(|o| (Reverse(o.units), o.product_id));
        offenders.truncate(limit);
        offenders
    }
}

/// Informational: a catch-all bucket above the configured share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    pub category: String,
    pub subcategory: String,
    pub basis: ShareBasis,
    pub share: f64,
    pub threshold: f64,
    pub stats: BucketStats,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "catch-all '{}' holds {:.1}% of {} {} (threshold {:.1}%)",
            self.subcategory,
            self.share * 100.0,
            self.category,
            self.basis.as_str(),
            self.threshold * 100.0,
        )
    }
}

fn is_catch_all(catch_alls: &[CatchAll], key: &LabelKey) -> bool {
    catch_alls
        .iter()
        .any(|c| c.applies_to(&key.category, &key.subcategory))
}

/// Catch-all buckets whose share of their category exceeds `threshold`.
pub fn convergence_warnings(
    summary: &AuditSummary,
    catch_alls: &[CatchAll],
    threshold: f64,
    basis: ShareBasis,
) -> Vec<ConvergenceWarning> {
    let mut warnings = Vec::new();
    for (key, stats) in summary.iter() {
        if !is_catch_all(catch_alls, key) {
            continue;
        }
        let share = summary.share(&key.category, &key.subcategory, basis);
        if share > threshold {
            tracing::warn!(
                category = %key.category,
                subcategory = %key.subcategory,
                share,
                threshold,
                basis = basis.as_str(),
                "Catch-all bucket above convergence threshold"
            );
            warnings.push(ConvergenceWarning {
                category: key.category.clone(),
                subcategory: key.subcategory.clone(),
                basis,
                share,
                threshold,
                stats: *stats,
            });
        }
    }
    warnings
}

/// Change of one catch-all bucket between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDelta {
    pub category: String,
    pub subcategory: String,
    pub before: BucketStats,
    pub after: BucketStats,
    pub before_share: f64,
    pub after_share: f64,
}

impl BucketDelta {
    /// The bucket shrank relative to its category
    pub fn converged(&self) -> bool {
        self.after_share < self.before_share
    }
}

/// Catch-all buckets present in either snapshot, with their share movement.
pub fn convergence_delta(
    before: &AuditSummary,
    after: &AuditSummary,
    catch_alls: &[CatchAll],
    basis: ShareBasis,
) -> Vec<BucketDelta> {
    let keys: BTreeSet<&LabelKey> = before
        .buckets
        .keys()
        .chain(after.buckets.keys())
        .filter(|key| is_catch_all(catch_alls, key))
        .collect();

    keys.into_iter()
        .map(|key| BucketDelta {
            category: key.category.clone(),
            subcategory: key.subcategory.clone(),
            before: before.get(&key.category, &key.subcategory),
            after: after.get(&key.category, &key.subcategory),
            before_share: before.share(&key.category, &key.subcategory, basis),
            after_share: after.share(&key.category, &key.subcategory, basis),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: ProductId, category: &str, subcategory: &str) -> ProductRecord {
        ProductRecord::new(id, format!("SKU{id}"), format!("item {id}"))
            .with_labels(Some(category), Some(subcategory))
    }

    fn furniture_batch() -> (Vec<ProductRecord>, MeasureMap) {
        let records = vec![
            record(1, "Furniture", "Other Furniture"),
            record(2, "Furniture", "Other Furniture"),
            record(3, "Furniture", "Desks"),
            record(4, "Furniture", "Other Furniture"),
            record(5, "Other", "Uncategorized"),
        ];
        let measures = MeasureMap::from([(1, 10), (2, 40), (3, 50), (4, 40)]);
        (records, measures)
    }

    fn catch_alls() -> Vec<CatchAll> {
        vec![
            CatchAll {
                category: Some("Furniture".into()),
                label: "Other Furniture".into(),
            },
            CatchAll {
                category: None,
                label: "Uncategorized".into(),
            },
        ]
    }

    #[test]
    fn test_summarize_groups_and_sums() {
        let (records, measures) = furniture_batch();
        let summary = summarize(&records, &measures);
        assert_eq!(
            summary.get("Furniture", "Other Furniture"),
            BucketStats {
                records: 3,
                units: 90
            }
        );
        assert_eq!(summary.get("Other", "Uncategorized").units, 0);
        assert_eq!(
            summary.totals(),
            BucketStats {
                records: 5,
                units: 140
            }
        );
        assert_eq!(summary.len(), 3);
        assert_eq!(summary.rows()[0].subcategory, "Desks");
    }

    #[test]
    fn test_unset_labels_are_grouped_under_placeholder() {
        let records = vec![ProductRecord::new(1, "", "")];
        let summary = summarize(&records, &MeasureMap::new());
        assert_eq!(summary.get(UNSET_LABEL, UNSET_LABEL).records, 1);
    }

    #[test]
    fn test_share_by_basis() {
        let (records, measures) = furniture_batch();
        let summary = summarize(&records, &measures);
        assert_eq!(
            summary.share("Furniture", "Other Furniture", ShareBasis::Records),
            0.75
        );
        assert_eq!(
            summary.share("Furniture", "Other Furniture", ShareBasis::Units),
            90.0 / 140.0
        );
        assert_eq!(summary.share("Toys", "Other Toys", ShareBasis::Records), 0.0);
    }

    #[test]
    fn test_top_offenders_orders_by_units_then_id() {
        let (records, measures) = furniture_batch();
        let auditor = ConvergenceAuditor::new(&records, &measures);
        let ids: Vec<ProductId> = auditor
            .top_offenders("Furniture", "Other Furniture", 10)
            .iter()
            .map(|o| o.product_id)
            .collect();
        assert_eq!(ids, vec![2, 4, 1]);

        let top = auditor.top_offenders("Furniture", "Other Furniture", 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].units, 40);
        assert!(auditor.top_offenders("Furniture", "Desks", 0).is_empty());
    }

    #[test]
    fn test_warnings_only_for_catch_alls_above_threshold() {
        let (records, measures) = furniture_batch();
        let summary = summarize(&records, &measures);
        let warnings = convergence_warnings(&summary, &catch_alls(), 0.5, ShareBasis::Records);
        let keys: Vec<(&str, &str)> = warnings
            .iter()
            .map(|w| (w.category.as_str(), w.subcategory.as_str()))
            .collect();
        // Desks is not a catch-all; Other/Uncategorized is 100% of its category.
        assert_eq!(
            keys,
            vec![("Furniture", "Other Furniture"), ("Other", "Uncategorized")]
        );
        assert_eq!(
            warnings[0].to_string(),
            "catch-all 'Other Furniture' holds 75.0% of Furniture records (threshold 50.0%)"
        );

        assert!(convergence_warnings(&summary, &catch_alls(), 1.0, ShareBasis::Records).is_empty());
    }

    #[test]
    fn test_delta_reports_shrinking_bucket() {
        let (records, measures) = furniture_batch();
        let before = summarize(&records, &measures);
        let mut refined = records.clone();
        refined[1].subcategory = Some("Dining Furniture".into());
        let after = summarize(&refined, &measures);

        let deltas = convergence_delta(&before, &after, &catch_alls(), ShareBasis::Records);
        let furniture = deltas
            .iter()
            .find(|d| d.category == "Furniture")
            .expect("furniture delta");
        assert_eq!(furniture.before.records, 3);
        assert_eq!(furniture.after.records, 2);
        assert!(furniture.converged());
        assert_eq!(deltas.len(), 2);
    }

    #[test]
    fn test_share_basis_parse() {
        assert_eq!(ShareBasis::parse("Units"), Some(ShareBasis::Units));
        assert_eq!(ShareBasis::parse("records"), Some(ShareBasis::Records));
        assert_eq!(ShareBasis::parse("volume"), None);
    }
}
