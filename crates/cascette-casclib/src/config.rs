//! Configuration for storages and the handles they create

use crate::{CascLibError, Result};
use serde::{Deserialize, Serialize};

/// Default chunk size for native reads.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default ceiling on the formats a line iterator captures.
pub const DEFAULT_MAX_LINE_FORMATS: usize = 250;

/// Default engine mask used when a finder binds its cursor.
pub const DEFAULT_FIND_MASK: &str = "*";

/// Configuration shared by a storage and every file and finder it opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascLibConfig {
    /// Largest span requested from the engine in a single read call
    pub read_buffer_size: usize,

    /// Maximum number of formats accepted by `File::lines`
    pub max_line_formats: usize,

    /// Wildcard mask handed to the engine when enumeration starts
    pub find_mask: String,
}

impl Default for CascLibConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_line_formats: DEFAULT_MAX_LINE_FORMATS,
            find_mask: DEFAULT_FIND_MASK.to_string(),
        }
    }
}

impl CascLibConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CascLibError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the native read chunk size
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the line iterator format ceiling
    #[must_use]
    pub const fn with_max_line_formats(mut self, count: usize) -> Self {
        self.max_line_formats = count;
        self
    }

    /// Set the enumeration mask
    #[must_use]
    pub fn with_find_mask(mut self, mask: impl Into<String>) -> Self {
        self.find_mask = mask.into();
        self
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(CascLibError::Config(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.max_line_formats == 0 {
            return Err(CascLibError::Config(
                "max_line_formats must be greater than zero".to_string(),
            ));
        }
        if self.find_mask.is_empty() {
            return Err(CascLibError::Config("find_mask must not be empty".to_string()));
        }
        Ok(())
    }
}
