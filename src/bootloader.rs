//! Kernel command-line editing in the grub configuration.
//!
//! The rewriter deliberately does not parse the whole grub config; it
//! locates the single `linux` line and makes one insertion. Deeper
//! analyses belong to [`crate::grub`].

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;

use crate::chroot::Chroot;

const GRUB_CONFIG_PATH: &str = "boot/grub2/grub.cfg";

/// Matches the kernel line; the capture group is the `$kernelopts`
/// placeholder the insertion lands in front of.
const LINUX_COMMAND_LINE_PATTERN: &str = r"\tlinux .* (\$kernelopts)";

/// Insert extra kernel command-line arguments immediately before the
/// `$kernelopts` placeholder, so environment-driven options remain last
/// and can still override them.
pub fn add_kernel_command_line(extra_command_line: &str, chroot: &Chroot) -> Result<()> {
    let grub_config_path = chroot.host_path(GRUB_CONFIG_PATH);

    let grub_config = fs::read_to_string(&grub_config_path).with_context(|| {
        format!(
            "failed to read existing grub config file ({})",
            grub_config_path.display()
        )
    })?;

    let updated = insert_kernel_args(&grub_config, extra_command_line)?;

    fs::write(&grub_config_path, updated).with_context(|| {
        format!(
            "failed to write new grub config file ({})",
            grub_config_path.display()
        )
    })?;

    Ok(())
}

fn insert_kernel_args(grub_config: &str, extra_command_line: &str) -> Result<String> {
    let line_regex = Regex::new(LINUX_COMMAND_LINE_PATTERN)
        .context("failed to compile kernel command line pattern")?;

    let captures = line_regex
        .captures(grub_config)
        .context("failed to find the linux kernel command line in the grub config file")?;
    let kernelopts = captures
        .get(1)
        .context("kernel command line match is missing its capture group")?;

    let insert_index = kernelopts.start();

    let mut updated = String::with_capacity(grub_config.len() + extra_command_line.len() + 1);
    updated.push_str(&grub_config[..insert_index]);
    updated.push_str(extra_command_line);
    updated.push(' ');
    updated.push_str(&grub_config[insert_index..]);

    Ok(updated)
}
