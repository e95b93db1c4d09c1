//! Ordered parser and writer for dnf-style repo configuration files.
//!
//! Section order is preserved: the package manager is not priority-aware,
//! so the aggregated repo file encodes priority by listing sections in the
//! order the caller appended them.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl RepoSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a key, replacing an existing value in place or appending.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoConfig {
    pub sections: Vec<RepoSection>,
}

impl RepoConfig {
    pub fn parse(content: &str) -> Result<RepoConfig> {
        let mut config = RepoConfig::default();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    bail!("invalid repo section header ({trimmed})");
                };
                config.sections.push(RepoSection::new(name.trim()));
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                bail!("invalid repo config line ({trimmed})");
            };

            let Some(section) = config.sections.last_mut() else {
                bail!("repo config entry ({trimmed}) appears outside of any section");
            };
            section.set(key.trim(), value.trim());
        }

        Ok(config)
    }

    pub fn push(&mut self, section: RepoSection) {
        self.sections.push(section);
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();

        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }

        out
    }
}
