//! Product records as seen by the classification engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Product identity, the `dim_product` surrogate key.
pub type ProductId = i64;

/// A product dimension row carrying the two mutable classification fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: ProductId,
    #[serde(default)]
    pub sku_code: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
}

impl ProductRecord {
    pub fn new(
        product_id: ProductId,
        sku_code: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            sku_code: sku_code.into(),
            display_name: display_name.into(),
            category: None,
            subcategory: None,
        }
    }

    /// Builder-style helper for records that arrive already labelled
    pub fn with_labels(
        mut self,
        category: Option<&str>,
        subcategory: Option<&str>,
    ) -> Self {
        self.category = category.map(String::from);
        self.subcategory = subcategory.map(String::from);
        self
    }

    /// Current value of a field, trimmed; blank values read as unset.
    pub fn label(&self, field: Field) -> Option<&str> {
        let value = match field {
            Field::Category => self.category.as_deref(),
            Field::Subcategory => self.subcategory.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn is_unset(&self, field: Field) -> bool {
        self.label(field).is_none()
    }

    pub(crate) fn set_label(&mut self, field: Field, value: Option<String>) {
        match field {
            Field::Category => self.category = value,
            Field::Subcategory => self.subcategory = value,
        }
    }

    /// Lowercased display name used by keyword conditions
    pub fn name_key(&self) -> String {
        self.display_name.to_lowercase()
    }

    /// Trimmed, uppercased SKU used by prefix conditions
    pub fn sku_key(&self) -> String {
        self.sku_code.trim().to_ascii_uppercase()
    }
}

/// One of the two classification fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Category,
    Subcategory,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Subcategory => "subcategory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "category" => Some(Self::Category),
            "subcategory" => Some(Self::Subcategory),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_labels_read_as_unset() {
        let record = ProductRecord::new(1, "CN1", "desk").with_labels(Some("  "), Some(""));
        assert!(record.is_unset(Field::Category));
        assert!(record.is_unset(Field::Subcategory));
    }

    #[test]
    fn test_labels_are_trimmed() {
        let record =
            ProductRecord::new(1, "CN1", "desk").with_labels(Some(" Furniture "), Some("Desks\t"));
        assert_eq!(record.label(Field::Category), Some("Furniture"));
        assert_eq!(record.label(Field::Subcategory), Some("Desks"));
    }

    #[test]
    fn test_keys_normalize_case() {
        let record = ProductRecord::new(1, "  nb200 ", "Modern Dining SET");
        assert_eq!(record.sku_key(), "NB200");
        assert_eq!(record.name_key(), "modern dining set");
    }

    #[test]
    fn test_field_round_trip() {
        for field in [Field::Category, Field::Subcategory] {
            assert_eq!(Field::parse(field.as_str()), Some(field));
        }
        assert_eq!(Field::parse("brand"), None);
    }
}
