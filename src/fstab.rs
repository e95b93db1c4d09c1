//! Reading and writing /etc/fstab entries.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: String,
    pub freq: u32,
    pub pass_no: u32,
}

impl FstabEntry {
    fn parse(line: &str) -> Result<FstabEntry> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(4..=6).contains(&fields.len()) {
            bail!(
                "invalid fstab line ({line}): expected 4 to 6 fields, found {}",
                fields.len()
            );
        }

        let freq = fields
            .get(4)
            .map(|f| f.parse())
            .transpose()
            .with_context(|| format!("invalid fstab dump frequency in line ({line})"))?
            .unwrap_or(0);
        let pass_no = fields
            .get(5)
            .map(|f| f.parse())
            .transpose()
            .with_context(|| format!("invalid fstab pass number in line ({line})"))?
            .unwrap_or(0);

        Ok(FstabEntry {
            source: fields[0].to_string(),
            target: fields[1].to_string(),
            fs_type: fields[2].to_string(),
            options: fields[3].to_string(),
            freq,
            pass_no,
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.source, self.target, self.fs_type, self.options, self.freq, self.pass_no
        )
    }
}

pub fn parse_fstab(content: &str) -> Result<Vec<FstabEntry>> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        entries.push(FstabEntry::parse(trimmed)?);
    }

    Ok(entries)
}

pub fn read_fstab_file(path: &Path) -> Result<Vec<FstabEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read fstab file ({})", path.display()))?;
    parse_fstab(&content)
}

pub fn write_fstab_file(entries: &[FstabEntry], path: &Path) -> Result<()> {
    let mut content = String::new();
    for entry in entries {
        content.push_str(&entry.to_line());
        content.push('\n');
    }

    fs::write(path, content)
        .with_context(|| format!("failed to write fstab file ({})", path.display()))?;
    Ok(())
}
