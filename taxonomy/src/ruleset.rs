//! Rule sets (one per pass) and the ordered taxonomy pipeline
//!
//! A [`Taxonomy`] is the full sequence of passes `classify` runs:
//!
//! ```text
//! category → subcategory(C)* / refinement(C, bucket)* → override → fallback
//! ```
//!
//! A refinement pass for `C` runs after `C`'s subcategory pass, and nothing
//! after it may write its bucket back onto a `C` record. Override rules stay
//! inside their scope. Both keep a second `classify` run a no-op.
//!
//! Everything structural is checked when the taxonomy is built. A malformed
//! rule, a pass out of order, or a fallback pass that cannot guarantee a
//! label for every field is a configuration error; no record is evaluated
//! against a taxonomy that failed validation.

use crate::errors::{Result, TaxonomyError};
use crate::record::Field;
use crate::rule::{Rule, RuleSpec, RuleTier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

/// Category assigned to records no category rule claimed
pub const DEFAULT_CATEGORY_FALLBACK: &str = "Other";

/// Subcategory assigned to records nothing else claimed
pub const DEFAULT_SUBCATEGORY_FALLBACK: &str = "Uncategorized";

/// Only supported rules document schema
pub const SCHEMA_VERSION: u32 = 1;

/// Catch-all label a subcategory pass uses for unmatched records
pub fn default_other_label(category: &str) -> String {
    format!("Other {category}")
}

/// How rules inside a pass are ordered before evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrdering {
    /// Authoring order
    #[default]
    Declared,
    /// Descending specificity rank, authoring order among equals
    Specificity,
}

/// What a pass does and which records it may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassKind {
    /// Fill unset categories from prefix then keyword rules
    Category,
    /// Fill unset subcategories of one category; unmatched land in `other_label`
    Subcategory { category: String, other_label: String },
    /// Re-examine records sitting in one catch-all bucket
    Refinement { category: String, bucket: String },
    /// Unconditional re-classification of known exceptions
    Override,
    /// Terminal labels for anything still unset
    Fallback,
}

impl PassKind {
    /// Position in the pipeline; passes must appear in non-decreasing stage order
    pub fn stage(&self) -> u8 {
        match self {
            Self::Category => 0,
            Self::Subcategory { .. } | Self::Refinement { .. } => 1,
            Self::Override => 2,
            Self::Fallback => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Subcategory { .. } => "subcategory",
            Self::Refinement { .. } => "refinement",
            Self::Override => "override",
            Self::Fallback => "fallback",
        }
    }

    /// Category a subcategory or refinement pass is scoped to
    pub fn target_category(&self) -> Option<&str> {
        match self {
            Self::Subcategory { category, .. } | Self::Refinement { category, .. } => {
                Some(category)
            }
            _ => None,
        }
    }

    fn allowed_tiers(&self) -> &'static [RuleTier] {
        match self {
            Self::Category | Self::Subcategory { .. } | Self::Refinement { .. } => {
                &[RuleTier::Prefix, RuleTier::Keyword]
            }
            Self::Override => &[RuleTier::Override],
            Self::Fallback => &[RuleTier::Fallback],
        }
    }

    /// The only field this pass's rules may write, if restricted
    fn sole_field(&self) -> Option<Field> {
        match self {
            Self::Category => Some(Field::Category),
            Self::Subcategory { .. } | Self::Refinement { .. } => Some(Field::Subcategory),
            Self::Override | Self::Fallback => None,
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subcategory { category, .. } => write!(f, "subcategory({category})"),
            Self::Refinement { category, bucket } => write!(f, "refinement({category}/{bucket})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The rules of one pass, sorted into evaluation order
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: String,
    kind: PassKind,
    ordering: RuleOrdering,
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Validate and sort a pass's rules.
    pub fn new(
        name: impl Into<String>,
        kind: PassKind,
        ordering: RuleOrdering,
        mut rules: Vec<Rule>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(TaxonomyError::config("pass name must not be empty"));
        }
        let kind = normalize_kind(&name, kind)?;

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id().to_string()) {
                return Err(TaxonomyError::config(format!(
                    "pass `{name}`: duplicate rule id `{}`",
                    rule.id()
                )));
            }
            validate_rule_for_pass(&name, &kind, ordering, rule)?;
        }

        if let PassKind::Fallback = kind {
            for field in [Field::Category, Field::Subcategory] {
                let terminal = rules
                    .iter()
                    .any(|r| r.is_unconditional() && r.assignment().assigns(field));
                if !terminal {
                    return Err(TaxonomyError::config(format!(
                        "pass `{name}`: fallback needs an unconditional rule assigning {field}"
                    )));
                }
            }
        }

        // Stable sorts: declaration order survives among equal keys.
        match ordering {
            RuleOrdering::Declared => rules.sort_by_key(|r| r.tier().rank()),
            RuleOrdering::Specificity => rules.sort_by_key(|r| {
                (r.tier().rank(), Reverse(r.specificity().unwrap_or_default()))
            }),
        }

        Ok(Self {
            name,
            kind,
            ordering,
            rules,
        })
    }

    pub fn category(rules: Vec<Rule>) -> Result<Self> {
        Self::new("category", PassKind::Category, RuleOrdering::Declared, rules)
    }

    /// Subcategory pass with the default `Other <category>` catch-all
    pub fn subcategory(category: &str, rules: Vec<Rule>) -> Result<Self> {
        Self::new(
            format!("subcategory:{category}"),
            PassKind::Subcategory {
                category: category.to_string(),
                other_label: default_other_label(category),
            },
            RuleOrdering::Declared,
            rules,
        )
    }

    pub fn refinement(
        category: &str,
        bucket: &str,
        ordering: RuleOrdering,
        rules: Vec<Rule>,
    ) -> Result<Self> {
        Self::new(
            format!("refinement:{category}"),
            PassKind::Refinement {
                category: category.to_string(),
                bucket: bucket.to_string(),
            },
            ordering,
            rules,
        )
    }

    pub fn overrides(rules: Vec<Rule>) -> Result<Self> {
        Self::new("override", PassKind::Override, RuleOrdering::Declared, rules)
    }

    pub fn fallback(rules: Vec<Rule>) -> Result<Self> {
        Self::new("fallback", PassKind::Fallback, RuleOrdering::Declared, rules)
    }

    /// `Other` / `Uncategorized` with nothing scoped
    pub fn default_fallback() -> Result<Self> {
        let rules = default_fallback_specs()
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        Self::fallback(rules)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PassKind {
        &self.kind
    }

    pub fn ordering(&self) -> RuleOrdering {
        self.ordering
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn default_fallback_specs() -> [RuleSpec; 2] {
    use crate::rule::Condition;
    [
        RuleSpec::new("fallback:category", RuleTier::Fallback, Condition::Always)
            .assign_category(DEFAULT_CATEGORY_FALLBACK),
        RuleSpec::new("fallback:subcategory", RuleTier::Fallback, Condition::Always)
            .assign_subcategory(DEFAULT_SUBCATEGORY_FALLBACK),
    ]
}

fn non_blank(pass: &str, what: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TaxonomyError::config(format!("pass `{pass}`: {what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn normalize_kind(name: &str, kind: PassKind) -> Result<PassKind> {
    Ok(match kind {
        PassKind::Subcategory {
            category,
            other_label,
        } => PassKind::Subcategory {
            category: non_blank(name, "category", &category)?,
            other_label: non_blank(name, "other_label", &other_label)?,
        },
        PassKind::Refinement { category, bucket } => PassKind::Refinement {
            category: non_blank(name, "category", &category)?,
            bucket: non_blank(name, "bucket", &bucket)?,
        },
        other => other,
    })
}

fn validate_rule_for_pass(
    pass: &str,
    kind: &PassKind,
    ordering: RuleOrdering,
    rule: &Rule,
) -> Result<()> {
    let id = rule.id();
    if !kind.allowed_tiers().contains(&rule.tier()) {
        return Err(TaxonomyError::config(format!(
            "pass `{pass}`: rule `{id}` has tier {} which a {} pass does not accept",
            rule.tier(),
            kind.as_str()
        )));
    }

    if let Some(field) = kind.sole_field() {
        let other = match field {
            Field::Category => Field::Subcategory,
            Field::Subcategory => Field::Category,
        };
        if !rule.assignment().assigns(field) || rule.assignment().assigns(other) {
            return Err(TaxonomyError::config(format!(
                "pass `{pass}`: rule `{id}` must assign {field} and nothing else"
            )));
        }
    }

    match kind {
        PassKind::Category if rule.scope().is_some() => {
            return Err(TaxonomyError::config(format!(
                "pass `{pass}`: rule `{id}` is scoped, but category rules only see uncategorized records"
            )));
        }
        PassKind::Subcategory { category, .. } | PassKind::Refinement { category, .. } => {
            if let Some(scope) = rule.scope()
                && scope != category
            {
                return Err(TaxonomyError::config(format!(
                    "pass `{pass}`: rule `{id}` is scoped to `{scope}` inside a pass for `{category}`"
                )));
            }
        }
        _ => {}
    }

    if let PassKind::Refinement { bucket, .. } = kind {
        if rule.assignment().get(Field::Subcategory) == Some(bucket.as_str()) {
            return Err(TaxonomyError::config(format!(
                "pass `{pass}`: rule `{id}` assigns the bucket it refines (`{bucket}`)"
            )));
        }
        if ordering == RuleOrdering::Specificity && rule.specificity().is_none() {
            return Err(TaxonomyError::config(format!(
                "pass `{pass}`: rule `{id}` needs a specificity rank in a specificity-ordered pass"
            )));
        }
    }

    Ok(())
}

/// A label that collects records no specific rule claimed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatchAll {
    /// `None` matches any category
    pub category: Option<String>,
    pub label: String,
}

impl CatchAll {
    pub fn applies_to(&self, category: &str, subcategory: &str) -> bool {
        self.label == subcategory && self.category.as_deref().is_none_or(|c| c == category)
    }
}

/// The ordered pass pipeline `classify` runs
#[derive(Debug, Clone)]
pub struct Taxonomy {
    passes: Vec<RuleSet>,
    fingerprint: String,
}

impl Taxonomy {
    /// Validate pipeline order and cross-pass constraints.
    pub fn new(passes: Vec<RuleSet>) -> Result<Self> {
        validate_pipeline(&passes)?;
        check_refinement_buckets(&passes)?;
        check_override_scopes(&passes)?;

        let fingerprint = fingerprint(&passes)?;
        Ok(Self {
            passes,
            fingerprint,
        })
    }

    /// Compile an authored rules document
    pub fn from_document(doc: &TaxonomyDocument) -> Result<Self> {
        if doc.schema_version != SCHEMA_VERSION {
            return Err(TaxonomyError::config(format!(
                "unsupported rules schema_version {} (expected {SCHEMA_VERSION})",
                doc.schema_version
            )));
        }
        let passes = doc
            .passes
            .iter()
            .map(PassSpec::compile)
            .collect::<Result<Vec<_>>>()?;
        let taxonomy = Self::new(passes)?;

        tracing::debug!(
            passes = taxonomy.passes.len(),
            rules = taxonomy.rule_count(),
            fingerprint = %taxonomy.fingerprint,
            "Compiled taxonomy"
        );
        Ok(taxonomy)
    }

    /// Parse and compile a TOML rules document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let doc: TaxonomyDocument = toml::from_str(contents)
            .map_err(|e| TaxonomyError::config_with_source("failed to parse rules document", e))?;
        Self::from_document(&doc)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TaxonomyError::config_with_source(
                format!("failed to read rules at {}", path.display()),
                e,
            )
        })?;
        Self::from_toml_str(&contents)
    }

    /// Passes in execution order
    pub fn passes(&self) -> &[RuleSet] {
        &self.passes
    }

    /// SHA-256 over the compiled pipeline; identical rules give identical hashes
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn rule_count(&self) -> usize {
        self.passes.iter().map(RuleSet::len).sum()
    }

    /// Every label that collects unmatched records, for convergence auditing
    pub fn catch_all_buckets(&self) -> Vec<CatchAll> {
        let mut buckets = BTreeSet::new();
        for pass in &self.passes {
            match pass.kind() {
                PassKind::Subcategory {
                    category,
                    other_label,
                } => {
                    buckets.insert(CatchAll {
                        category: Some(category.clone()),
                        label: other_label.clone(),
                    });
                }
                PassKind::Refinement { category, bucket } => {
                    buckets.insert(CatchAll {
                        category: Some(category.clone()),
                        label: bucket.clone(),
                    });
                }
                PassKind::Fallback => {
                    for rule in pass.rules() {
                        if let Some(label) = rule.assignment().get(Field::Subcategory) {
                            buckets.insert(CatchAll {
                                category: rule.scope().map(String::from),
                                label: label.to_string(),
                            });
                        }
                    }
                }
                PassKind::Category | PassKind::Override => {}
            }
        }
        buckets.into_iter().collect()
    }
}

fn validate_pipeline(passes: &[RuleSet]) -> Result<()> {
    let Some(last) = passes.last() else {
        return Err(TaxonomyError::config("taxonomy has no passes"));
    };
    if last.kind() != &PassKind::Fallback {
        return Err(TaxonomyError::config(format!(
            "the last pass must be a fallback pass, found `{}`",
            last.name()
        )));
    }

    let mut names = HashSet::new();
    let mut rule_ids = HashSet::new();
    let mut subcategory_targets = HashSet::new();
    let mut stage = 0;
    let mut category_passes = 0;
    let mut fallback_passes = 0;

    for pass in passes {
        if !names.insert(pass.name()) {
            return Err(TaxonomyError::config(format!(
                "duplicate pass name `{}`; give repeated passes explicit names",
                pass.name()
            )));
        }
        if pass.kind().stage() < stage {
            return Err(TaxonomyError::config(format!(
                "pass `{}` ({}) is out of order; passes run category, subcategory/refinement, override, fallback",
                pass.name(),
                pass.kind().as_str()
            )));
        }
        stage = pass.kind().stage();

        match pass.kind() {
            PassKind::Category => category_passes += 1,
            PassKind::Fallback => fallback_passes += 1,
            PassKind::Subcategory { category, .. } => {
                if !subcategory_targets.insert(category.as_str()) {
                    return Err(TaxonomyError::config(format!(
                        "more than one subcategory pass for `{category}`"
                    )));
                }
            }
            _ => {}
        }

        for rule in pass.rules() {
            if !rule_ids.insert(rule.id()) {
                return Err(TaxonomyError::config(format!(
                    "rule id `{}` is used more than once",
                    rule.id()
                )));
            }
        }
    }

    if category_passes > 1 {
        return Err(TaxonomyError::config("only one category pass is allowed"));
    }
    if fallback_passes != 1 {
        return Err(TaxonomyError::config("exactly one fallback pass is required"));
    }
    Ok(())
}

/// Reject pipelines where something downstream of a refinement pass can
/// put a record back into the bucket it refines. The next run would refine
/// that record again, so the result would depend on how often `classify` ran.
fn check_refinement_buckets(passes: &[RuleSet]) -> Result<()> {
    for (index, pass) in passes.iter().enumerate() {
        let PassKind::Refinement { category, bucket } = pass.kind() else {
            continue;
        };
        for later in &passes[index + 1..] {
            match later.kind() {
                PassKind::Subcategory { category: target, .. } if target == category => {
                    return Err(TaxonomyError::config(format!(
                        "subcategory pass `{}` must run before refinement pass `{}`",
                        later.name(),
                        pass.name()
                    )));
                }
                PassKind::Refinement { category: target, .. } if target == category => {
                    if let Some(rule) = later
                        .rules()
                        .iter()
                        .find(|r| r.assignment().get(Field::Subcategory) == Some(bucket.as_str()))
                    {
                        return Err(TaxonomyError::config(format!(
                            "refinement rule `{}` assigns `{bucket}`, which the earlier pass `{}` refines",
                            rule.id(),
                            pass.name()
                        )));
                    }
                }
                PassKind::Override => {
                    for rule in later.rules() {
                        let target = rule.assignment().get(Field::Category).or(rule.scope());
                        if writes_bucket(rule, target, category, bucket) {
                            return Err(TaxonomyError::config(format!(
                                "override rule `{}` assigns refinement bucket `{bucket}`; refinement re-runs would overwrite it",
                                rule.id()
                            )));
                        }
                    }
                }
                PassKind::Fallback => {
                    for rule in later.rules() {
                        if writes_bucket(rule, rule.scope(), category, bucket) {
                            return Err(TaxonomyError::config(format!(
                                "fallback rule `{}` assigns refinement bucket `{bucket}` of `{category}`; the next run would refine it",
                                rule.id()
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// `target` is the category a rule's record ends up in; `None` means any.
fn writes_bucket(rule: &Rule, target: Option<&str>, category: &str, bucket: &str) -> bool {
    rule.assignment().get(Field::Subcategory) == Some(bucket)
        && target.is_none_or(|t| t == category)
}

/// Scope is re-read on every run, so an override that moves a record out of
/// its own scope would stop matching next time and let a later rule fire.
fn check_override_scopes(passes: &[RuleSet]) -> Result<()> {
    for pass in passes.iter().filter(|p| p.kind() == &PassKind::Override) {
        for rule in pass.rules() {
            if let (Some(scope), Some(category)) =
                (rule.scope(), rule.assignment().get(Field::Category))
                && scope != category
            {
                return Err(TaxonomyError::config(format!(
                    "override rule `{}` is scoped to `{scope}` but moves records to `{category}`",
                    rule.id()
                )));
            }
        }
    }
    Ok(())
}

fn fingerprint(passes: &[RuleSet]) -> Result<String> {
    let canonical: Vec<serde_json::Value> = passes
        .iter()
        .map(|pass| {
            let rules: Vec<serde_json::Value> = pass
                .rules()
                .iter()
                .map(|rule| {
                    serde_json::json!({
                        "id": rule.id(),
                        "tier": rule.tier().as_str(),
                        "assign": rule.assignment(),
                        "scope": rule.scope(),
                        "specificity": rule.specificity(),
                        "predicate": format!("{rule:?}"),
                    })
                })
                .collect();
            serde_json::json!({
                "name": pass.name(),
                "kind": pass.kind().to_string(),
                "rules": rules,
            })
        })
        .collect();

    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| TaxonomyError::internal(format!("failed to encode rule set: {e}")))?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{digest:x}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules document
// ─────────────────────────────────────────────────────────────────────────────

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// TOML rules document: a list of `[[pass]]` tables, each with `[[pass.rule]]`s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaxonomyDocument {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(rename = "pass", default)]
    pub passes: Vec<PassSpec>,
}

/// Pass type as written in a rules document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassType {
    Category,
    Subcategory,
    Refinement,
    Override,
    Fallback,
}

/// Authored form of one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassSpec {
    pub kind: PassType,
    #[serde(default)]
    pub name: Option<String>,
    /// Target category (subcategory and refinement passes)
    #[serde(default)]
    pub category: Option<String>,
    /// Catch-all label for unmatched records (subcategory passes)
    #[serde(default)]
    pub other_label: Option<String>,
    /// Bucket to refine (refinement passes); defaults to `Other <category>`
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub ordering: RuleOrdering,
    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleSpec>,
}

impl PassSpec {
    fn compile(&self) -> Result<RuleSet> {
        let label = self.name.clone().unwrap_or_else(|| format!("{:?}", self.kind));
        let reject = |field: &str, present: bool| -> Result<()> {
            if present {
                return Err(TaxonomyError::config(format!(
                    "pass `{label}`: `{field}` is not valid for a {:?} pass",
                    self.kind
                )));
            }
            Ok(())
        };
        let require_category = || {
            self.category.clone().ok_or_else(|| {
                TaxonomyError::config(format!("pass `{label}` needs a `category`"))
            })
        };

        let (default_name, kind) = match self.kind {
            PassType::Category => {
                reject("category", self.category.is_some())?;
                reject("other_label", self.other_label.is_some())?;
                reject("bucket", self.bucket.is_some())?;
                ("category".to_string(), PassKind::Category)
            }
            PassType::Subcategory => {
                reject("bucket", self.bucket.is_some())?;
                let category = require_category()?;
                let other_label = self
                    .other_label
                    .clone()
                    .unwrap_or_else(|| default_other_label(category.trim()));
                (
                    format!("subcategory:{}", category.trim()),
                    PassKind::Subcategory {
                        category,
                        other_label,
                    },
                )
            }
            PassType::Refinement => {
                reject("other_label", self.other_label.is_some())?;
                let category = require_category()?;
                let bucket = self
                    .bucket
                    .clone()
                    .unwrap_or_else(|| default_other_label(category.trim()));
                (
                    format!("refinement:{}", category.trim()),
                    PassKind::Refinement { category, bucket },
                )
            }
            PassType::Override | PassType::Fallback => {
                reject("category", self.category.is_some())?;
                reject("other_label", self.other_label.is_some())?;
                reject("bucket", self.bucket.is_some())?;
                if self.kind == PassType::Override {
                    ("override".to_string(), PassKind::Override)
                } else {
                    ("fallback".to_string(), PassKind::Fallback)
                }
            }
        };

        let rules = self
            .rules
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        RuleSet::new(
            self.name.clone().unwrap_or(default_name),
            kind,
            self.ordering,
            rules,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Condition;

    fn compile(specs: &[RuleSpec]) -> Vec<Rule> {
        specs.iter().map(|s| Rule::compile(s).expect("compile")).collect()
    }

    fn ids(set: &RuleSet) -> Vec<&str> {
        set.rules().iter().map(Rule::id).collect()
    }

    #[test]
    fn test_category_pass_puts_prefix_before_keyword_keeping_declaration_order() {
        let set = RuleSet::category(compile(&[
            RuleSpec::keyword("kw:desk", "desk").assign_category("Furniture"),
            RuleSpec::prefix("pf:cn", "CN", "Furniture"),
            RuleSpec::keyword("kw:lamp", "lamp").assign_category("Lighting"),
            RuleSpec::prefix("pf:nb", "NB", "Furniture"),
        ]))
        .expect("valid");
        assert_eq!(ids(&set), vec!["pf:cn", "pf:nb", "kw:desk", "kw:lamp"]);
    }

    #[test]
    fn test_specificity_ordering_is_stable() {
        let set = RuleSet::refinement(
            "Furniture",
            "Other Furniture",
            RuleOrdering::Specificity,
            compile(&[
                RuleSpec::keyword("set", "set")
                    .assign_subcategory("Sets")
                    .with_specificity(1),
                RuleSpec::keyword("dining", "dining")
                    .assign_subcategory("Dining Furniture")
                    .with_specificity(5),
                RuleSpec::keyword("furniture-set", "furniture set")
                    .assign_subcategory("Furniture Sets")
                    .with_specificity(5),
            ]),
        )
        .expect("valid");
        assert_eq!(ids(&set), vec!["dining", "furniture-set", "set"]);
    }

    #[test]
    fn test_specificity_ordering_requires_ranks() {
        let err = RuleSet::refinement(
            "Furniture",
            "Other Furniture",
            RuleOrdering::Specificity,
            compile(&[RuleSpec::keyword("set", "set").assign_subcategory("Sets")]),
        )
        .expect_err("missing rank");
        assert!(err.to_string().contains("specificity"));
    }

    #[test]
    fn test_tier_and_field_mismatches_are_rejected() {
        let wrong_tier = RuleSet::category(compile(&[RuleSpec::new(
            "o",
            RuleTier::Override,
            Condition::Always,
        )
        .assign_category("X")]));
        assert!(wrong_tier.is_err());

        let wrong_field = RuleSet::subcategory(
            "Furniture",
            compile(&[RuleSpec::keyword("k", "desk").assign_category("Furniture")]),
        );
        assert!(wrong_field.is_err());

        let foreign_scope = RuleSet::subcategory(
            "Furniture",
            compile(&[RuleSpec::keyword("k", "desk")
                .assign_subcategory("Desks")
                .scoped_to("Office")]),
        );
        assert!(foreign_scope.is_err());
    }

    #[test]
    fn test_fallback_requires_unconditional_rule_per_field() {
        let only_category = RuleSet::fallback(compile(&[RuleSpec::new(
            "fb:cat",
            RuleTier::Fallback,
            Condition::Always,
        )
        .assign_category("Other")]));
        let err = only_category.expect_err("no subcategory terminal");
        assert!(err.to_string().contains("subcategory"));

        let scoped_only = RuleSet::fallback(compile(&[
            RuleSpec::new("fb:cat", RuleTier::Fallback, Condition::Always).assign_category("Other"),
            RuleSpec::new("fb:furn", RuleTier::Fallback, Condition::Always)
                .assign_subcategory("Other Furniture")
                .scoped_to("Furniture"),
        ]));
        assert!(scoped_only.is_err());

        assert!(RuleSet::default_fallback().is_ok());
    }

    #[test]
    fn test_taxonomy_requires_terminal_fallback_and_order() {
        let category = RuleSet::category(compile(&[RuleSpec::prefix("cn", "CN", "Furniture")]))
            .expect("valid");
        let overrides = RuleSet::overrides(vec![]).expect("valid");
        let fallback = RuleSet::default_fallback().expect("valid");

        assert!(Taxonomy::new(vec![category.clone()]).is_err());
        assert!(Taxonomy::new(vec![overrides.clone(), category.clone(), fallback.clone()]).is_err());
        assert!(Taxonomy::new(vec![fallback.clone(), fallback.clone()]).is_err());
        assert!(Taxonomy::new(vec![category, overrides, fallback]).is_ok());
    }

    #[test]
    fn test_duplicate_rule_ids_across_passes_are_rejected() {
        let category = RuleSet::category(compile(&[RuleSpec::prefix("dup", "CN", "Furniture")]))
            .expect("valid");
        let sub = RuleSet::subcategory(
            "Furniture",
            compile(&[RuleSpec::keyword("dup", "desk").assign_subcategory("Desks")]),
        )
        .expect("valid");
        let err = Taxonomy::new(vec![category, sub, RuleSet::default_fallback().expect("valid")])
            .expect_err("duplicate");
        assert!(err.to_string().contains("dup"));
    }

    #[test]
    fn test_override_may_not_target_refinement_bucket() {
        let refinement = RuleSet::refinement(
            "Furniture",
            "Other Furniture",
            RuleOrdering::Declared,
            compile(&[RuleSpec::keyword("dining", "dining").assign_subcategory("Dining Furniture")]),
        )
        .expect("valid");
        let overrides = RuleSet::overrides(compile(&[RuleSpec::new(
            "ov",
            RuleTier::Override,
            Condition::SkuPrefix("ZZ".into()),
        )
        .assign_category("Furniture")
        .assign_subcategory("Other Furniture")]))
        .expect("valid");
        let err = Taxonomy::new(vec![
            refinement,
            overrides,
            RuleSet::default_fallback().expect("valid"),
        ])
        .expect_err("conflict");
        assert!(err.to_string().contains("refinement bucket"));
    }

    fn dining_refinement() -> RuleSet {
        RuleSet::refinement(
            "Furniture",
            "Other Furniture",
            RuleOrdering::Declared,
            compile(&[RuleSpec::keyword("dining", "dining").assign_subcategory("Dining Furniture")]),
        )
        .expect("valid")
    }

    #[test]
    fn test_refinement_must_follow_its_subcategory_pass() {
        let category = RuleSet::category(compile(&[RuleSpec::prefix("nb", "NB", "Furniture")]))
            .expect("valid");
        let sub = RuleSet::subcategory("Furniture", vec![]).expect("valid");
        let err = Taxonomy::new(vec![
            category.clone(),
            dining_refinement(),
            sub.clone(),
            RuleSet::default_fallback().expect("valid"),
        ])
        .expect_err("refinement before subcategory");
        assert!(err.to_string().contains("must run before"));

        // Another category's subcategory pass may still follow.
        let lighting = RuleSet::subcategory("Lighting", vec![]).expect("valid");
        assert!(
            Taxonomy::new(vec![
                category,
                sub,
                dining_refinement(),
                lighting,
                RuleSet::default_fallback().expect("valid"),
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_later_refinement_may_not_refill_earlier_bucket() {
        let misc = RuleSet::new(
            "refinement:Furniture:misc",
            PassKind::Refinement {
                category: "Furniture".into(),
                bucket: "Misc Furniture".into(),
            },
            RuleOrdering::Declared,
            compile(&[RuleSpec::keyword("bench", "bench").assign_subcategory("Benches")]),
        )
        .expect("valid");
        let into_other = RuleSet::new(
            "refinement:Furniture:back",
            PassKind::Refinement {
                category: "Furniture".into(),
                bucket: "Misc Furniture".into(),
            },
            RuleOrdering::Declared,
            compile(&[RuleSpec::keyword("odd", "odd").assign_subcategory("Other Furniture")]),
        )
        .expect("valid");
        let err = Taxonomy::new(vec![
            dining_refinement(),
            misc,
            into_other,
            RuleSet::default_fallback().expect("valid"),
        ])
        .expect_err("chained bucket");
        assert!(err.to_string().contains("`odd`"));
    }

    #[test]
    fn test_fallback_may_not_fill_refinement_bucket() {
        let mut fallback_rules = compile(&[RuleSpec::new(
            "fb:furniture",
            RuleTier::Fallback,
            Condition::Always,
        )
        .assign_subcategory("Other Furniture")
        .scoped_to("Furniture")]);
        fallback_rules.extend(RuleSet::default_fallback().expect("fb").rules().iter().cloned());
        let fallback = RuleSet::fallback(fallback_rules).expect("valid");

        let err = Taxonomy::new(vec![dining_refinement(), fallback.clone()])
            .expect_err("scoped fallback bucket");
        assert!(err.to_string().contains("fb:furniture"));

        // Without a refinement pass the same catch-all is fine.
        assert!(Taxonomy::new(vec![fallback]).is_ok());

        let unscoped_bucket = RuleSet::refinement(
            "Furniture",
            "Uncategorized",
            RuleOrdering::Declared,
            compile(&[RuleSpec::keyword("desk", "desk").assign_subcategory("Desks")]),
        )
        .expect("valid");
        let err = Taxonomy::new(vec![unscoped_bucket, RuleSet::default_fallback().expect("fb")])
            .expect_err("unscoped fallback bucket");
        assert!(err.to_string().contains("fallback:subcategory"));
    }

    #[test]
    fn test_override_may_not_leave_its_scope() {
        let wheel = || {
            RuleSpec::new(
                "ov:wheel",
                RuleTier::Override,
                Condition::NameContains("wheel".into()),
            )
            .scoped_to("Furniture")
        };

        let leaves = RuleSet::overrides(compile(&[wheel().assign_category("Automotive")]))
            .expect("valid");
        let err = Taxonomy::new(vec![leaves, RuleSet::default_fallback().expect("fb")])
            .expect_err("scope escape");
        assert!(err.to_string().contains("scoped to `Furniture`"));

        let stays = RuleSet::overrides(compile(&[wheel().assign_subcategory("Wheels")]))
            .expect("valid");
        assert!(Taxonomy::new(vec![stays, RuleSet::default_fallback().expect("fb")]).is_ok());
    }

    #[test]
    fn test_document_round_trip_and_catch_alls() {
        let taxonomy = Taxonomy::from_toml_str(
            r#"
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

            [[pass.rule]]
            id = "sub:desk"
            tier = "keyword"
            when = { name_contains = "desk" }
            subcategory = "Desks"

            [[pass]]
            kind = "fallback"

            [[pass.rule]]
            id = "fb:cat"
            tier = "fallback"
            when = "always"
            category = "Other"

            [[pass.rule]]
            id = "fb:sub"
            tier = "fallback"
            when = "always"
            subcategory = "Uncategorized"
            "#,
        )
        .expect("valid document");

        assert_eq!(taxonomy.passes().len(), 3);
        assert_eq!(taxonomy.rule_count(), 4);
        assert_eq!(taxonomy.fingerprint().len(), 64);
        assert_eq!(
            taxonomy.catch_all_buckets(),
            vec![
                CatchAll {
                    category: None,
                    label: "Uncategorized".into()
                },
                CatchAll {
                    category: Some("Furniture".into()),
                    label: "Other Furniture".into()
                },
            ]
        );
    }

    #[test]
    fn test_document_rejects_misplaced_fields_and_versions() {
        let misplaced = r#"
            [[pass]]
            kind = "category"
            bucket = "Other Furniture"
        "#;
        assert!(Taxonomy::from_toml_str(misplaced).is_err());

        let version = r#"
            schema_version = 2
            [[pass]]
            kind = "fallback"
        "#;
        let err = Taxonomy::from_toml_str(version).expect_err("version");
        assert!(err.to_string().contains("schema_version"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let build = || {
            Taxonomy::new(vec![
                RuleSet::category(compile(&[RuleSpec::prefix("cn", "CN", "Furniture")]))
                    .expect("valid"),
                RuleSet::default_fallback().expect("valid"),
            ])
            .expect("valid")
        };
        assert_eq!(build().fingerprint(), build().fingerprint());
    }

    #[test]
    fn test_catch_all_wildcard_matches_any_category() {
        let wildcard = CatchAll {
            category: None,
            label: "Uncategorized".into(),
        };
        assert!(wildcard.applies_to("Other", "Uncategorized"));
        assert!(!wildcard.applies_to("Other", "Desks"));
    }
}
