//! Compile request configuration
//!
//! Everything the host supplies besides the query text. Requests can be built
//! in code or loaded from TOML:
//!
//! ```toml
//! [options]
//! database = "default"
//! table = "requests"
//! interval = "1m"
//!
//! [time_range]
//! from = "2024-01-01T00:00:00Z"
//! to = "2024-01-01T06:00:00Z"
//!
//! [[variables]]
//! name = "host"
//! type = "custom"
//! current = ["a", "b"]
//! multi = true
//!
//! [[ad_hoc_filters]]
//! key = "default.requests.status"
//! operator = "="
//! value = 500
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::adhoc::AdHocFilter;
use crate::error::{CompileError, Result};
use crate::template::Variable;
use crate::time::{DateTimeType, TimeRange};

/// Target table, time bucketing and output options
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryOptions {
    /// Bucket width, e.g. `15s`
    #[serde(default = "default_interval")]
    pub interval: String,

    #[serde(default = "default_interval_factor")]
    pub interval_factor: u32,

    /// Duration or `$step` to round the time range to
    #[serde(default)]
    pub round: Option<String>,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub table: String,

    /// Optional `Date` column used to prune partitions
    #[serde(default)]
    pub date_column: Option<String>,

    #[serde(default = "default_date_time_column")]
    pub date_time_column: String,

    #[serde(default)]
    pub date_time_type: DateTimeType,

    #[serde(default)]
    pub skip_comments: bool,

    #[serde(default)]
    pub use_window_functions: bool,
}

fn default_interval() -> String {
    "30s".to_string()
}

fn default_interval_factor() -> u32 {
    1
}

fn default_date_time_column() -> String {
    "timestamp".to_string()
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            interval_factor: default_interval_factor(),
            round: None,
            database: String::new(),
            table: String::new(),
            date_column: None,
            date_time_column: default_date_time_column(),
            date_time_type: DateTimeType::default(),
            skip_comments: false,
            use_window_functions: false,
        }
    }
}

/// Everything needed to compile one query
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompileRequest {
    #[serde(default)]
    pub options: QueryOptions,

    /// Host-resolved template variables, in declaration order
    #[serde(default)]
    pub variables: Vec<Variable>,

    pub time_range: TimeRange,

    #[serde(default)]
    pub ad_hoc_filters: Vec<AdHocFilter>,
}

impl CompileRequest {
    pub fn new(options: QueryOptions, time_range: TimeRange) -> Self {
        Self {
            options,
            variables: Vec::new(),
            time_range,
            ad_hoc_filters: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: Vec<Variable>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_ad_hoc_filters(mut self, filters: Vec<AdHocFilter>) -> Self {
        self.ad_hoc_filters = filters;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CompileError::Config(e.to_string()))
    }

    /// Load a request from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CompileError::Config(format!("{}: {e}", path.display())))?;
        let request = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded compile request");
        Ok(request)
    }
}
