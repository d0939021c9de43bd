use serde::{Deserialize, Serialize};

use crate::error::{OdmError, OdmResult};

/// How a flush asks the store to treat conflicts inside its bulk write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkWriteMode {
    /// Apply every non-conflicting document; conflicts come back per
    /// document. The batch always makes progress.
    #[default]
    AllOrNothing,
    /// Apply nothing if any document conflicts.
    Strict,
}

impl BulkWriteMode {
    /// Value of the `all_or_nothing` flag sent to the store.
    pub fn all_or_nothing(self) -> bool {
        matches!(self, Self::AllOrNothing)
    }
}

/// Configuration for a [`DocumentManager`](crate::DocumentManager).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Database holding the documents.
    pub database: String,
    /// Prepended to `database`; lets test suites share a store.
    pub database_prefix: String,
    /// UUIDs fetched per `_uuids` round trip.
    pub uuid_buffer_size: usize,
    pub bulk_mode: BulkWriteMode,
    /// Write the `odm_metadata.type` tag on every document.
    pub write_type_metadata: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            database: "ottoman".into(),
            database_prefix: String::new(),
            uuid_buffer_size: 20,
            bulk_mode: BulkWriteMode::AllOrNothing,
            write_type_metadata: true,
        }
    }
}

impl Configuration {
    /// Parse a TOML configuration. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> OdmResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| OdmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OdmResult<()> {
        if self.database_name().is_empty() {
            return Err(OdmError::Config("database name must not be empty".into()));
        }
        if self.uuid_buffer_size == 0 {
            return Err(OdmError::Config("uuid_buffer_size must be at least 1".into()));
        }
        Ok(())
    }

    /// The effective database name: prefix followed by database.
    pub fn database_name(&self) -> String {
        format!("{}{}", self.database_prefix, self.database)
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_database_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.database_prefix = prefix.into();
        self
    }

    pub fn with_uuid_buffer_size(mut self, size: usize) -> Self {
        self.uuid_buffer_size = size;
        self
    }

    pub fn with_bulk_mode(mut self, mode: BulkWriteMode) -> Self {
        self.bulk_mode = mode;
        self
    }

    pub fn with_type_metadata(mut self, enabled: bool) -> Self {
        self.write_type_metadata = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::default();
        assert_eq!(config.database_name(), "ottoman");
        assert_eq!(config.uuid_buffer_size, 20);
        assert_eq!(config.bulk_mode, BulkWriteMode::AllOrNothing);
        assert!(config.write_type_metadata);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn prefix_is_prepended() {
        let config = Configuration::default()
            .with_database("blog")
            .with_database_prefix("test_");
        assert_eq!(config.database_name(), "test_blog");
    }

    #[test]
    fn toml_overrides_and_defaults() {
        let config = Configuration::from_toml_str(
            r#"
            database = "cms"
            uuid_buffer_size = 5
            bulk_mode = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.database, "cms");
        assert_eq!(config.uuid_buffer_size, 5);
        assert_eq!(config.bulk_mode, BulkWriteMode::Strict);
        assert!(config.write_type_metadata);
        assert_eq!(config.database_prefix, "");
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let err = Configuration::from_toml_str("uuid_buffer_size = 0").unwrap_err();
        assert!(matches!(err, OdmError::Config(msg) if msg.contains("uuid_buffer_size")));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(
            Configuration::from_toml_str("database = ["),
            Err(OdmError::Config(_))
        ));
    }

    #[test]
    fn bulk_mode_flag() {
        assert!(BulkWriteMode::AllOrNothing.all_or_nothing());
        assert!(!BulkWriteMode::Strict.all_or_nothing());
    }
}
