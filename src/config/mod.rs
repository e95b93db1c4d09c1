//! The declarative customization document: model and validation.
//!
//! Validation happens once, before the engine touches disk. Every
//! aggregate exposes `is_valid`, and errors name the offending list index
//! and field.

mod os;
mod storage;

pub use os::*;
pub use storage::*;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: Option<Storage>,
    #[serde(default)]
    pub iso: Option<Iso>,
    #[serde(default)]
    pub os: Os,
}

impl Config {
    pub fn is_valid(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.is_valid().context("invalid storage value")?;
        }

        if let Some(iso) = &self.iso {
            iso.is_valid().context("invalid iso value")?;
        }

        self.os.is_valid().context("invalid os value")?;

        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Config> {
        serde_yaml::from_str(content).context("failed to parse config document")
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file ({})", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("invalid config file ({})", path.display()))
    }
}

/// ISO output settings. Accepted and validated for config compatibility;
/// ISO emission itself is handled outside the customization engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Iso {
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default)]
    pub additional_files: AdditionalFiles,
}

impl Iso {
    pub fn is_valid(&self) -> Result<()> {
        self.kernel_command_line
            .is_valid()
            .context("invalid kernelCommandLine value")?;

        for (source_path, file_configs) in &self.additional_files {
            for file_config in file_configs {
                file_config
                    .is_valid()
                    .with_context(|| format!("invalid file configs for ({source_path})"))?;
            }
        }

        Ok(())
    }
}
