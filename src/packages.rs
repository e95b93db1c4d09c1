//! Package install/remove/update inside the image chroot.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::chroot::Chroot;
use crate::config::{PackageList, Packages};
use crate::rpmsources::RPMS_MOUNT_PARENT_DIR_IN_CHROOT;

const TDNF_INSTALL_PREFIX: &str = "Installing/Updating: ";

/// The flattened package operations for one run: inline names plus the
/// contents of the referenced package list files.
#[derive(Debug, Default)]
pub struct PackagePlan {
    pub remove: Vec<String>,
    pub install: Vec<String>,
    pub update: Vec<String>,
    pub update_existing: bool,
}

pub fn collect_package_plan(base_config_path: &Path, packages: &Packages) -> Result<PackagePlan> {
    Ok(PackagePlan {
        remove: collect_packages(base_config_path, &packages.remove_lists, &packages.remove)?,
        install: collect_packages(base_config_path, &packages.install_lists, &packages.install)?,
        update: collect_packages(base_config_path, &packages.update_lists, &packages.update)?,
        update_existing: packages.update_existing_packages,
    })
}

fn collect_packages(
    base_config_path: &Path,
    list_paths: &[String],
    inline: &[String],
) -> Result<Vec<String>> {
    let mut all_packages = Vec::new();

    for list_path in list_paths {
        let full_path = base_config_path.join(list_path);
        let content = fs::read_to_string(&full_path)
            .with_context(|| format!("failed to read package list file ({})", full_path.display()))?;
        let package_list: PackageList = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse package list file ({})", full_path.display()))?;
        all_packages.extend(package_list.packages);
    }

    all_packages.extend(inline.iter().cloned());
    Ok(all_packages)
}

/// Apply the package plan with the in-chroot package manager, pointed at
/// the composed repo directory (which replaces the default repos).
pub fn update_packages(chroot: &Chroot, plan: &PackagePlan) -> Result<()> {
    for package in &plan.remove {
        println!("  Removing package: {package}");
        run_tdnf(chroot, "remove", Some(package))?;
    }

    if plan.update_existing {
        println!("  Updating base image packages");
        run_tdnf(chroot, "update", None)?;
    }

    // One package per invocation: batch installs can exhaust memory
    // inside the chroot.
    for package in &plan.install {
        println!("  Installing package: {package}");
        run_tdnf(chroot, "install", Some(package))?;
    }

    for package in &plan.update {
        println!("  Updating package: {package}");
        run_tdnf(chroot, "update", Some(package))?;
    }

    Ok(())
}

fn run_tdnf(chroot: &Chroot, operation: &str, package: Option<&str>) -> Result<()> {
    let repos_arg = format!("--setopt=reposdir={RPMS_MOUNT_PARENT_DIR_IN_CHROOT}");

    let mut args = vec![
        "-v",
        operation,
        "--nogpgcheck",
        "--assumeyes",
        repos_arg.as_str(),
    ];
    if let Some(package) = package {
        args.push(package);
    }

    chroot
        .run_live_filtered("tdnf", &args, tdnf_output_line)
        .with_context(|| match package {
            Some(package) => format!("failed to {operation} package ({package})"),
            None => format!("failed to {operation} packages"),
        })
}

fn tdnf_output_line(line: &str) {
    if line.starts_with(TDNF_INSTALL_PREFIX) {
        debug!("{line}");
    } else {
        warn!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Packages;

    #[test]
    fn test_collect_package_plan_merges_lists_and_inline_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            "packages:\n  - openssh-server\n  - vim\n",
        )
        .unwrap();

        let packages = Packages {
            install_lists: vec!["base.yaml".to_string()],
            install: vec!["curl".to_string()],
            ..Default::default()
        };

        let plan = collect_package_plan(dir.path(), &packages).unwrap();

        assert_eq!(plan.install, vec!["openssh-server", "vim", "curl"]);
        assert!(plan.remove.is_empty());
        assert!(!plan.update_existing);
    }

    #[test]
    fn test_collect_package_plan_missing_list_file_fails() {
        let dir = tempfile::tempdir().unwrap();

        let packages = Packages {
            install_lists: vec!["missing.yaml".to_string()],
            ..Default::default()
        };

        let err = collect_package_plan(dir.path(), &packages).unwrap_err();
        assert!(format!("{err:#}").contains("missing.yaml"));
    }
}
