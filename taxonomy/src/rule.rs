//! Rules: a predicate over a product record plus the labels it assigns
//!
//! Rules are authored as data ([`RuleSpec`] with a [`Condition`]) and compiled
//! into [`Rule`] values whose predicates are ready to evaluate. Callers that
//! need logic beyond the built-in conditions implement [`Predicate`] and use
//! [`Rule::custom`].

use crate::errors::{PredicateError, Result, TaxonomyError};
use crate::record::{Field, ProductRecord};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Prefix reserved for rule identities generated by the engine itself
pub const SYNTHETIC_PREFIX: &str = "synthetic:";

/// Identity of the terminal rule that drops unmatched records into a
/// category's catch-all bucket during its subcategory pass.
pub fn synthetic_rule_id(category: &str) -> String {
    format!("{SYNTHETIC_PREFIX}{category}:other")
}

/// Priority class of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTier {
    Prefix,
    Keyword,
    Override,
    Fallback,
}

impl RuleTier {
    /// Evaluation rank; lower tiers are consulted first inside a pass
    pub fn rank(&self) -> u8 {
        match self {
            Self::Prefix => 0,
            Self::Keyword => 1,
            Self::Override => 2,
            Self::Fallback => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Keyword => "keyword",
            Self::Override => "override",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RuleTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative predicate over `sku_code` / `display_name`.
///
/// SKU prefixes compare case-insensitively against the trimmed SKU; name
/// keywords are lowercase substring matches against the display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    SkuPrefix(String),
    SkuPrefixAny(Vec<String>),
    NameContains(String),
    NameContainsAny(Vec<String>),
    NameContainsAll(Vec<String>),
    /// Case-insensitive regular expression over the display name
    NameMatches(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Always,
}

/// Borrowed record plus the normalized keys conditions match against.
///
/// Built once per record per pass so every rule sees the same keys.
pub struct RecordView<'a> {
    record: &'a ProductRecord,
    sku: String,
    name: String,
}

impl<'a> RecordView<'a> {
    pub fn new(record: &'a ProductRecord) -> Self {
        Self {
            record,
            sku: record.sku_key(),
            name: record.name_key(),
        }
    }

    pub fn record(&self) -> &ProductRecord {
        self.record
    }

    /// Trimmed, uppercased SKU
    pub fn sku(&self) -> &str {
        &self.sku
    }

    /// Lowercased display name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A pure, side-effect-free test over one record.
pub trait Predicate: fmt::Debug + Send + Sync {
    fn evaluate(&self, view: &RecordView<'_>) -> std::result::Result<bool, PredicateError>;

    /// True when the predicate holds for every record
    fn is_unconditional(&self) -> bool {
        false
    }
}

/// Compiled form of a [`Condition`]
#[derive(Debug)]
enum Matcher {
    SkuPrefix(Vec<String>),
    NameAny(Vec<String>),
    NameAll(Vec<String>),
    NamePattern(regex_lite::Regex),
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Not(Box<Matcher>),
    Always,
}

impl Matcher {
    fn compile(condition: &Condition) -> std::result::Result<Self, String> {
        let matcher = match condition {
            Condition::SkuPrefix(prefix) => {
                Self::SkuPrefix(vec![normalize_needle(prefix, "sku_prefix")?.to_ascii_uppercase()])
            }
            Condition::SkuPrefixAny(prefixes) => Self::SkuPrefix(
                non_empty_list(prefixes, "sku_prefix_any")?
                    .iter()
                    .map(|p| normalize_needle(p, "sku_prefix_any").map(|p| p.to_ascii_uppercase()))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Condition::NameContains(keyword) => {
                Self::NameAny(vec![normalize_needle(keyword, "name_contains")?.to_lowercase()])
            }
            Condition::NameContainsAny(keywords) => {
                Self::NameAny(lowercase_list(keywords, "name_contains_any")?)
            }
            Condition::NameContainsAll(keywords) => {
                Self::NameAll(lowercase_list(keywords, "name_contains_all")?)
            }
            Condition::NameMatches(pattern) => {
                let pattern = normalize_needle(pattern, "name_matches")?;
                let regex = regex_lite::RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| format!("invalid name_matches pattern `{pattern}`: {e}"))?;
                Self::NamePattern(regex)
            }
            Condition::All(conditions) => Self::All(
                non_empty_list(conditions, "all")?
                    .iter()
                    .map(Self::compile)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Condition::Any(conditions) => Self::Any(
                non_empty_list(conditions, "any")?
                    .iter()
                    .map(Self::compile)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Condition::Not(inner) => Self::Not(Box::new(Self::compile(inner)?)),
            Condition::Always => Self::Always,
        };
        Ok(matcher)
    }

    fn test(&self, view: &RecordView<'_>) -> bool {
        match self {
            Self::SkuPrefix(prefixes) => prefixes.iter().any(|p| view.sku().starts_with(p.as_str())),
            Self::NameAny(keywords) => keywords.iter().any(|k| view.name().contains(k.as_str())),
            Self::NameAll(keywords) => keywords.iter().all(|k| view.name().contains(k.as_str())),
            Self::NamePattern(regex) => regex.is_match(&view.record().display_name),
            Self::All(matchers) => matchers.iter().all(|m| m.test(view)),
            Self::Any(matchers) => matchers.iter().any(|m| m.test(view)),
            Self::Not(inner) => !inner.test(view),
            Self::Always => true,
        }
    }
}

impl Predicate for Matcher {
    fn evaluate(&self, view: &RecordView<'_>) -> std::result::Result<bool, PredicateError> {
        Ok(self.test(view))
    }

    fn is_unconditional(&self) -> bool {
        matches!(self, Self::Always)
    }
}

fn normalize_needle(value: &str, what: &str) -> std::result::Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{what} needs a non-empty value"));
    }
    Ok(trimmed.to_string())
}

fn non_empty_list<'a, T>(items: &'a [T], what: &str) -> std::result::Result<&'a [T], String> {
    if items.is_empty() {
        return Err(format!("{what} needs at least one entry"));
    }
    Ok(items)
}

fn lowercase_list(items: &[String], what: &str) -> std::result::Result<Vec<String>, String> {
    non_empty_list(items, what)?
        .iter()
        .map(|k| normalize_needle(k, what).map(|k| k.to_lowercase()))
        .collect()
}

/// Labels a rule writes when it matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
}

impl Assignment {
    pub fn category(value: impl Into<String>) -> Self {
        Self {
            category: Some(value.into()),
            subcategory: None,
        }
    }

    pub fn subcategory(value: impl Into<String>) -> Self {
        Self {
            category: None,
            subcategory: Some(value.into()),
        }
    }

    pub fn both(category: impl Into<String>, subcategory: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            subcategory: Some(subcategory.into()),
        }
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        match field {
            Field::Category => self.category.as_deref(),
            Field::Subcategory => self.subcategory.as_deref(),
        }
    }

    pub fn assigns(&self, field: Field) -> bool {
        self.get(field).is_some()
    }

    /// Field writes in application order (category before subcategory)
    pub fn writes(&self) -> impl Iterator<Item = (Field, &str)> {
        [Field::Category, Field::Subcategory]
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
    }

    fn normalized(&self) -> std::result::Result<Self, String> {
        let trim = |value: &Option<String>, field: Field| match value {
            Some(v) if v.trim().is_empty() => Err(format!("{field} assignment is blank")),
            Some(v) => Ok(Some(v.trim().to_string())),
            None => Ok(None),
        };
        let normalized = Self {
            category: trim(&self.category, Field::Category)?,
            subcategory: trim(&self.subcategory, Field::Subcategory)?,
        };
        if normalized.category.is_none() && normalized.subcategory.is_none() {
            return Err("rule assigns neither category nor subcategory".to_string());
        }
        Ok(normalized)
    }
}

/// Authored form of a rule, as it appears in a rules document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub id: String,
    pub tier: RuleTier,
    #[serde(default)]
    pub when: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    /// Category the record must already carry for the rule to apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specificity: Option<u32>,
}

impl RuleSpec {
    pub fn new(id: impl Into<String>, tier: RuleTier, when: Condition) -> Self {
        Self {
            id: id.into(),
            tier,
            when: Some(when),
            category: None,
            subcategory: None,
            scope: None,
            specificity: None,
        }
    }

    pub fn prefix(id: impl Into<String>, sku_prefix: &str, category: &str) -> Self {
        Self::new(id, RuleTier::Prefix, Condition::SkuPrefix(sku_prefix.to_string()))
            .assign_category(category)
    }

    pub fn keyword(id: impl Into<String>, keyword: &str) -> Self {
        Self::new(id, RuleTier::Keyword, Condition::NameContains(keyword.to_string()))
    }

    pub fn assign_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn assign_subcategory(mut self, subcategory: &str) -> Self {
        self.subcategory = Some(subcategory.to_string());
        self
    }

    pub fn scoped_to(mut self, category: &str) -> Self {
        self.scope = Some(category.to_string());
        self
    }

    pub fn with_specificity(mut self, rank: u32) -> Self {
        self.specificity = Some(rank);
        self
    }
}

/// A compiled rule, ready for evaluation
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    tier: RuleTier,
    predicate: Arc<dyn Predicate>,
    assign: Assignment,
    scope: Option<String>,
    specificity: Option<u32>,
}

impl Rule {
    /// Compile an authored rule, rejecting malformed definitions.
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        let id = validate_id(&spec.id)?;
        let condition = spec.when.as_ref().ok_or_else(|| {
            TaxonomyError::config(format!("rule `{id}` has no predicate (`when` is missing)"))
        })?;
        let matcher = Matcher::compile(condition)
            .map_err(|msg| TaxonomyError::config(format!("rule `{id}`: {msg}")))?;
        let assign = Assignment {
            category: spec.category.clone(),
            subcategory: spec.subcategory.clone(),
        }
        .normalized()
        .map_err(|msg| TaxonomyError::config(format!("rule `{id}`: {msg}")))?;

        Ok(Self {
            id,
            tier: spec.tier,
            predicate: Arc::new(matcher),
            assign,
            scope: validate_scope(&spec.id, spec.scope.as_deref())?,
            specificity: spec.specificity,
        })
    }

    /// Build a rule around a caller-supplied predicate
    pub fn custom(
        id: impl Into<String>,
        tier: RuleTier,
        predicate: Arc<dyn Predicate>,
        assign: Assignment,
    ) -> Result<Self> {
        let id = validate_id(&id.into())?;
        let assign = assign
            .normalized()
            .map_err(|msg| TaxonomyError::config(format!("rule `{id}`: {msg}")))?;
        Ok(Self {
            id,
            tier,
            predicate,
            assign,
            scope: None,
            specificity: None,
        })
    }

    pub fn with_scope(mut self, category: impl Into<String>) -> Result<Self> {
        let category = category.into();
        self.scope = validate_scope(&self.id, Some(&category))?;
        Ok(self)
    }

    pub fn with_specificity(mut self, rank: u32) -> Self {
        self.specificity = Some(rank);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tier(&self) -> RuleTier {
        self.tier
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assign
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn specificity(&self) -> Option<u32> {
        self.specificity
    }

    /// Unscoped and true for every record
    pub fn is_unconditional(&self) -> bool {
        self.scope.is_none() && self.predicate.is_unconditional()
    }

    /// Scope precondition first, then the predicate.
    pub fn matches(&self, view: &RecordView<'_>) -> std::result::Result<bool, PredicateError> {
        if let Some(scope) = &self.scope
            && view.record().label(Field::Category) != Some(scope.as_str())
        {
            return Ok(false);
        }
        self.predicate.evaluate(view)
    }

    /// Field writes this rule performs when it matches
    pub fn apply(&self) -> impl Iterator<Item = (Field, &str)> {
        self.assign.writes()
    }
}

fn validate_id(id: &str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(TaxonomyError::config("rule id must not be empty"));
    }
    if id.starts_with(SYNTHETIC_PREFIX) {
        return Err(TaxonomyError::config(format!(
            "rule id `{id}` uses the reserved `{SYNTHETIC_PREFIX}` prefix"
        )));
    }
    Ok(id.to_string())
}

fn validate_scope(id: &str, scope: Option<&str>) -> Result<Option<String>> {
    match scope {
        Some(s) if s.trim().is_empty() => Err(TaxonomyError::config(format!(
            "rule `{id}` declares a blank scope"
        ))),
        Some(s) => Ok(Some(s.trim().to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(spec: &RuleSpec, record: &ProductRecord) -> bool {
        let rule = Rule::compile(spec).expect("compile");
        rule.matches(&RecordView::new(record)).expect("evaluate")
    }

    #[test]
    fn test_sku_prefix_is_case_insensitive_and_trimmed() {
        let spec = RuleSpec::prefix("cat:cn", "cn", "Furniture");
        assert!(check(&spec, &ProductRecord::new(1, " CN1139-42", "wheel stand")));
        assert!(!check(&spec, &ProductRecord::new(2, "XCN1", "wheel stand")));
    }

    #[test]
    fn test_empty_inputs_fail_predicates_without_error() {
        let record = ProductRecord::new(1, "", "");
        assert!(!check(&RuleSpec::prefix("p", "CN", "Furniture"), &record));
        assert!(!check(
            &RuleSpec::keyword("k", "desk").assign_category("Furniture"),
            &record
        ));
    }

    #[test]
    fn test_name_keywords_match_substrings_case_insensitively() {
        let record = ProductRecord::new(1, "NB200", "Modern DINING Set");
        let any = RuleSpec::new(
            "any",
            RuleTier::Keyword,
            Condition::NameContainsAny(vec!["sofa".into(), "Dining".into()]),
        )
        .assign_subcategory("Dining Furniture");
        let all = RuleSpec::new(
            "all",
            RuleTier::Keyword,
            Condition::NameContainsAll(vec!["dining".into(), "chair".into()]),
        )
        .assign_subcategory("Dining Chairs");
        assert!(check(&any, &record));
        assert!(!check(&all, &record));
    }

    #[test]
    fn test_composite_and_regex_conditions() {
        let record = ProductRecord::new(1, "HIFINE-PJHW-004WH", "Wall Hook 4pc White");
        let spec = RuleSpec::new(
            "hooks",
            RuleTier::Keyword,
            Condition::All(vec![
                Condition::SkuPrefix("HIFINE".into()),
                Condition::NameMatches(r"\bhook\b".into()),
                Condition::Not(Box::new(Condition::NameContains("rack".into()))),
            ]),
        )
        .assign_category("Home Improvement");
        assert!(check(&spec, &record));
    }

    #[test]
    fn test_scope_gates_the_predicate() {
        let spec = RuleSpec::keyword("sub:desk", "desk")
            .assign_subcategory("Desks")
            .scoped_to("Furniture");
        let furniture = ProductRecord::new(1, "X", "desk lamp").with_labels(Some("Furniture"), None);
        let lighting = ProductRecord::new(2, "X", "desk lamp").with_labels(Some("Lighting"), None);
        assert!(check(&spec, &furniture));
        assert!(!check(&spec, &lighting));
    }

    #[test]
    fn test_missing_predicate_is_config_error() {
        let mut spec = RuleSpec::prefix("p", "CN", "Furniture");
        spec.when = None;
        let err = Rule::compile(&spec).expect_err("missing predicate");
        assert!(err.to_string().contains("no predicate"));
    }

    #[test]
    fn test_missing_or_blank_assignment_is_config_error() {
        let spec = RuleSpec::keyword("k", "desk");
        assert!(Rule::compile(&spec).is_err());
        let blank = RuleSpec::keyword("k", "desk").assign_category("  ");
        assert!(Rule::compile(&blank).is_err());
    }

    #[test]
    fn test_empty_needles_and_lists_are_rejected() {
        let empty_prefix = RuleSpec::prefix("p", " ", "Furniture");
        assert!(Rule::compile(&empty_prefix).is_err());
        let empty_any = RuleSpec::new("a", RuleTier::Keyword, Condition::Any(vec![]))
            .assign_category("Furniture");
        assert!(Rule::compile(&empty_any).is_err());
        let bad_regex = RuleSpec::new("r", RuleTier::Keyword, Condition::NameMatches("(".into()))
            .assign_category("Furniture");
        assert!(Rule::compile(&bad_regex).is_err());
    }

    #[test]
    fn test_reserved_and_blank_ids_are_rejected() {
        assert!(Rule::compile(&RuleSpec::prefix("synthetic:x", "CN", "Furniture")).is_err());
        assert!(Rule::compile(&RuleSpec::prefix("  ", "CN", "Furniture")).is_err());
    }

    #[test]
    fn test_unconditional_requires_always_and_no_scope() {
        let always = RuleSpec::new("fb", RuleTier::Fallback, Condition::Always).assign_category("Other");
        assert!(Rule::compile(&always).expect("compile").is_unconditional());
        let scoped = always.clone().scoped_to("Furniture");
        assert!(!Rule::compile(&scoped).expect("compile").is_unconditional());
    }

    #[test]
    fn test_apply_writes_category_before_subcategory() {
        let rule = Rule::compile(
            &RuleSpec::new("o", RuleTier::Override, Condition::Always)
                .assign_subcategory("Racing Accessories")
                .assign_category("Automotive"),
        )
        .expect("compile");
        let writes: Vec<_> = rule.apply().collect();
        assert_eq!(
            writes,
            vec![
                (Field::Category, "Automotive"),
                (Field::Subcategory, "Racing Accessories")
            ]
        );
    }

    #[test]
    fn test_condition_deserializes_from_toml() {
        let spec: RuleSpec = toml::from_str(
            r#"
            id = "cat:cn"
            tier = "prefix"
            when = { sku_prefix_any = ["CN", "NB"] }
            category = "Furniture"
            "#,
        )
        .expect("parse");
        assert_eq!(
            spec.when,
            Some(Condition::SkuPrefixAny(vec!["CN".into(), "NB".into()]))
        );

        let always: RuleSpec = toml::from_str(
            r#"
            id = "fb"
            tier = "fallback"
            when = "always"
            category = "Other"
            "#,
        )
        .expect("parse");
        assert_eq!(always.when, Some(Condition::Always));
    }

    #[test]
    fn test_synthetic_rule_id_format() {
        assert_eq!(synthetic_rule_id("Furniture"), "synthetic:Furniture:other");
    }
}
