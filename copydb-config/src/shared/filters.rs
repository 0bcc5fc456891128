use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// A `schema.name` pair naming a relation in a filter rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedName {
    pub schema: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn matches(&self, schema: &str, name: &str) -> bool {
        self.schema == schema && self.name == name
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl TryFrom<String> for QualifiedName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
                Ok(QualifiedName::new(schema, name))
            }
            _ => Err(ValidationError::InvalidQualifiedName(value)),
        }
    }
}

impl From<QualifiedName> for String {
    fn from(value: QualifiedName) -> Self {
        value.to_string()
    }
}

/// How the filter rules select objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    /// No rule is set, everything is copied.
    None,
    /// Only the listed tables are copied.
    Include,
    /// Everything except the listed schemas and tables is copied.
    Exclude,
    /// Only index and table-data exclusions are set.
    ExcludeOnlyData,
}

/// User filtering rules.
///
/// The serialized form of this struct is recorded in the catalog setup record and compared
/// byte-for-byte on later runs, so field order and naming are part of the on-disk contract.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include_only_schema: Vec<String>,
    #[serde(default)]
    pub exclude_schema: Vec<String>,
    #[serde(default)]
    pub include_only_table: Vec<QualifiedName>,
    #[serde(default)]
    pub exclude_table: Vec<QualifiedName>,
    #[serde(default)]
    pub exclude_table_data: Vec<QualifiedName>,
    #[serde(default)]
    pub exclude_index: Vec<QualifiedName>,
}

impl FilterConfig {
    pub fn filter_type(&self) -> FilterType {
        if !self.include_only_table.is_empty() || !self.include_only_schema.is_empty() {
            FilterType::Include
        } else if !self.exclude_schema.is_empty() || !self.exclude_table.is_empty() {
            FilterType::Exclude
        } else if !self.exclude_table_data.is_empty() || !self.exclude_index.is_empty() {
            FilterType::ExcludeOnlyData
        } else {
            FilterType::None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filter_type() == FilterType::None
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.include_only_table.is_empty() && !self.exclude_table.is_empty() {
            return Err(ValidationError::ConflictingFilters(
                "include_only_table",
                "exclude_table",
            ));
        }

        if !self.include_only_schema.is_empty() && !self.exclude_schema.is_empty() {
            return Err(ValidationError::ConflictingFilters(
                "include_only_schema",
                "exclude_schema",
            ));
        }

        Ok(())
    }

    /// Whether objects of `schema` are kept by the schema rules.
    pub fn retains_schema(&self, schema: &str) -> bool {
        if self.exclude_schema.iter().any(|s| s == schema) {
            return false;
        }

        self.include_only_schema.is_empty() || self.include_only_schema.iter().any(|s| s == schema)
    }

    /// Whether the table `schema.name` is kept by the schema and table rules.
    pub fn retains_table(&self, schema: &str, name: &str) -> bool {
        if !self.retains_schema(schema) {
            return false;
        }

        if !self.include_only_table.is_empty() {
            return self
                .include_only_table
                .iter()
                .any(|table| table.matches(schema, name));
        }

        !self
            .exclude_table
            .iter()
            .any(|table| table.matches(schema, name))
    }

    pub fn excludes_data(&self, schema: &str, name: &str) -> bool {
        self.exclude_table_data
            .iter()
            .any(|table| table.matches(schema, name))
    }

    pub fn excludes_index(&self, schema: &str, name: &str) -> bool {
        self.exclude_index
            .iter()
            .any(|index| index.matches(schema, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_parse_from_strings() {
        let name = QualifiedName::try_from("public.users".to_string()).unwrap();
        assert_eq!(name, QualifiedName::new("public", "users"));
        assert!(QualifiedName::try_from("users".to_string()).is_err());
    }

    #[test]
    fn filter_type_reflects_rules() {
        let mut filters = FilterConfig::default();
        assert_eq!(filters.filter_type(), FilterType::None);

        filters.exclude_index.push(QualifiedName::new("public", "idx"));
        assert_eq!(filters.filter_type(), FilterType::ExcludeOnlyData);

        filters.exclude_table.push(QualifiedName::new("public", "t1"));
        assert_eq!(filters.filter_type(), FilterType::Exclude);
    }

    #[test]
    fn include_and_exclude_tables_conflict() {
        let filters = FilterConfig {
            include_only_table: vec![QualifiedName::new("public", "a")],
            exclude_table: vec![QualifiedName::new("public", "b")],
            ..Default::default()
        };
        assert_eq!(
            filters.validate(),
            Err(ValidationError::ConflictingFilters(
                "include_only_table",
                "exclude_table"
            ))
        );
    }

    #[test]
    fn retains_table_applies_schema_and_table_rules() {
        let filters = FilterConfig {
            exclude_schema: vec!["audit".to_string()],
            exclude_table: vec![QualifiedName::new("public", "t1")],
            ..Default::default()
        };

        assert!(!filters.retains_schema("audit"));
        assert!(!filters.retains_table("audit", "log"));
        assert!(!filters.retains_table("public", "t1"));
        assert!(filters.retains_table("public", "t2"));
    }
}
