//! Per-vat runtime configuration, loaded from a JSON file or defaulted.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// How a result slot's swiss number is derived from its swissbase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotNaming {
    /// `hash-of-<base>`
    #[default]
    Readable,
    /// `h-` followed by the hex SHA-256 of the base.
    Sha256,
}

/// Per-vat runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VatConfig {
    pub slot_naming: SlotNaming,
    /// Unacknowledged messages a connection may hold before it warns.
    pub max_unacked: usize,
    /// First number handed out by the swiss allocator; 0 is left to the root.
    pub first_swiss: u64,
}

impl Default for VatConfig {
    fn default() -> Self {
        Self {
            slot_naming: SlotNaming::Readable,
            max_unacked: 1024,
            first_swiss: 1,
        }
    }
}

impl VatConfig {
    /// Read a JSON config file; unspecified fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: VatConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_swiss == 0 {
            bail!("first_swiss must be at least 1; 0 is reserved for the root object");
        }
        if self.max_unacked == 0 {
            bail!("max_unacked must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "slot_naming": "sha256" }}"#)?;
        let config = VatConfig::load(file.path())?;
        assert_eq!(config.slot_naming, SlotNaming::Sha256);
        assert_eq!(config.max_unacked, 1024);
        assert_eq!(config.first_swiss, 1);
        Ok(())
    }

    #[test]
    fn rejects_unknown_fields_and_zero_swiss() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "retries": 3 }}"#)?;
        assert!(VatConfig::load(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "first_swiss": 0 }}"#)?;
        let err = VatConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("first_swiss"));
        Ok(())
    }

    #[test]
    fn missing_path_means_defaults() -> Result<()> {
        assert_eq!(VatConfig::load_or_default(None)?, VatConfig::default());
        let dir = tempfile::tempdir()?;
        assert!(VatConfig::load(&dir.path().join("absent.json")).is_err());
        Ok(())
    }
}
