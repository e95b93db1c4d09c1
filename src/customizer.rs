//! Orchestrates one full image customization run.
//!
//! The order is fixed: validate, convert the input to raw, connect to the
//! image, then the in-chroot mutations, then teardown and the output
//! conversion. Every resource acquired from step 4 onward is released in
//! reverse order on every exit path; teardown failures are reported but
//! never mask the error that caused the unwind.

use anyhow::{bail, Context, Result};
use rustix::mount::MountFlags;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::bootloader;
use crate::chroot::Chroot;
use crate::common::files;
use crate::config::{self, AdditionalFiles, Config, Modules, Os, Script, SeLinuxMode, Services};
use crate::image;
use crate::overlays;
use crate::packages;
use crate::process::Cmd;
use crate::rpmsources;
use crate::users;

const BASE_IMAGE_NAME: &str = "image.raw";
const IMAGE_ROOT_DIR_NAME: &str = "imageroot";

/// Where the config directory is bind-mounted for script runs, as seen
/// inside the chroot.
const CONFIG_DIR_MOUNT_IN_CHROOT: &str = "/_imageconfigs";

const RESOLV_CONF_PATH: &str = "etc/resolv.conf";
const HOST_RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
const SELINUX_CONFIG_PATH: &str = "etc/selinux/config";
const SELINUX_FORCE_ENFORCING_ARGS: &str = "security=selinux selinux=1 enforcing=1";
const MODULES_LOAD_PATH: &str = "etc/modules-load.d/modules-load.conf";
const MODULES_DISABLE_PATH: &str = "etc/modprobe.d/modules-disabled.conf";
const KERNEL_MODULES_DIR: &str = "lib/modules";

/// Customize an image, reading the config document from `config_file`.
/// Relative paths in the config resolve against the config file's
/// directory.
pub fn customize_image_with_config_file(
    build_dir: &Path,
    config_file: &Path,
    image_file: &Path,
    rpm_sources: &[PathBuf],
    output_image_file: &Path,
    output_image_format: &str,
    use_base_image_repos: bool,
) -> Result<()> {
    let config = Config::from_file(config_file)?;

    let base_config_path = match config_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base_config_path = base_config_path
        .canonicalize()
        .context("failed to get absolute path of config file directory")?;

    customize_image(
        build_dir,
        &base_config_path,
        &config,
        image_file,
        rpm_sources,
        output_image_file,
        output_image_format,
        use_base_image_repos,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn customize_image(
    build_dir: &Path,
    base_config_path: &Path,
    config: &Config,
    image_file: &Path,
    rpm_sources: &[PathBuf],
    output_image_file: &Path,
    output_image_format: &str,
    use_base_image_repos: bool,
) -> Result<()> {
    let qemu_output_format = to_qemu_image_format(output_image_format)?;

    validate_config(base_config_path, config).context("invalid image config")?;

    fs::create_dir_all(build_dir)
        .with_context(|| format!("failed to create build directory ({})", build_dir.display()))?;
    let build_dir = build_dir
        .canonicalize()
        .context("failed to get absolute path of build directory")?;

    // Convert to raw so a kernel loop device can expose the partitions.
    let build_image_file = build_dir.join(BASE_IMAGE_NAME);
    println!("Converting base image to raw: {}", build_image_file.display());
    Cmd::new("qemu-img")
        .args(["convert", "-O", "raw"])
        .arg_path(image_file)
        .arg_path(&build_image_file)
        .error_msg("failed to convert image file to raw format")
        .run()?;

    customize_image_helper(
        &build_dir,
        base_config_path,
        config,
        &build_image_file,
        rpm_sources,
        use_base_image_repos,
    )?;

    println!("Writing: {}", output_image_file.display());
    if let Some(out_dir) = output_image_file.parent() {
        if !out_dir.as_os_str().is_empty() {
            fs::create_dir_all(out_dir).with_context(|| {
                format!("failed to create output directory ({})", out_dir.display())
            })?;
        }
    }
    Cmd::new("qemu-img")
        .args(["convert", "-O", qemu_output_format])
        .arg_path(&build_image_file)
        .arg_path(output_image_file)
        .error_msg(format!(
            "failed to convert image file to format ({output_image_format})"
        ))
        .run()?;

    Ok(())
}

fn to_qemu_image_format(image_format: &str) -> Result<&'static str> {
    match image_format {
        "vhd" => Ok("vpc"),
        "vhdx" => Ok("vhdx"),
        "raw" => Ok("raw"),
        "qcow2" => Ok("qcow2"),
        _ => bail!("unsupported image format (supported: vhd, vhdx, raw, qcow2): {image_format}"),
    }
}

/// Full config validation: the structural `is_valid` tree plus the checks
/// that need the filesystem (additional-file sources, script files).
pub fn validate_config(base_config_path: &Path, config: &Config) -> Result<()> {
    config.is_valid()?;

    for source_file in config.os.additional_files.keys() {
        let full_path = base_config_path.join(source_file);
        if !full_path.is_file() {
            bail!("invalid additionalFiles source file ({source_file}): not a file");
        }
    }

    for (i, script) in config.os.post_install_scripts.iter().enumerate() {
        validate_script(base_config_path, script)
            .with_context(|| format!("invalid postInstallScripts item at index {i}"))?;
    }

    for (i, script) in config.os.finalize_image_scripts.iter().enumerate() {
        validate_script(base_config_path, script)
            .with_context(|| format!("invalid finalizeImageScripts item at index {i}"))?;
    }

    Ok(())
}

fn validate_script(base_config_path: &Path, script: &Script) -> Result<()> {
    // Locality of the path itself is enforced by the config model; here
    // the file is checked on disk.
    let full_path = base_config_path.join(&script.path);

    let metadata = fs::metadata(&full_path)
        .with_context(|| format!("couldn't read install script ({})", script.path))?;

    if metadata.permissions().mode() & 0o111 == 0 {
        bail!(
            "install script ({}) does not have executable bit set",
            script.path
        );
    }

    Ok(())
}

fn customize_image_helper(
    build_dir: &Path,
    base_config_path: &Path,
    config: &Config,
    build_image_file: &Path,
    rpm_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    let mut connection =
        image::connect_to_existing_image(build_image_file, build_dir, IMAGE_ROOT_DIR_NAME)?;

    let result = do_customizations(
        build_dir,
        base_config_path,
        config,
        connection.chroot(),
        rpm_sources,
        use_base_image_repos,
    );

    let close_result = connection.close();
    result?;
    close_result?;

    Ok(())
}

fn do_customizations(
    build_dir: &Path,
    base_config_path: &Path,
    config: &Config,
    chroot: &Chroot,
    rpm_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    override_resolv_conf(chroot)?;

    let mut rpm_mounts =
        rpmsources::mount_rpm_sources(build_dir, chroot, rpm_sources, use_base_image_repos)?;

    let result = apply_os_customizations(
        base_config_path,
        &config.os,
        chroot,
        rpm_sources,
        use_base_image_repos,
    );

    // Teardown runs even when a step failed; the first error wins.
    let resolv_result =
        delete_resolv_conf(chroot).context("failed to delete overridden resolv.conf");
    let close_result = rpm_mounts.close();

    result?;
    resolv_result?;
    close_result?;

    Ok(())
}

fn apply_os_customizations(
    base_config_path: &Path,
    os: &Os,
    chroot: &Chroot,
    rpm_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<()> {
    let plan = packages::collect_package_plan(base_config_path, &os.packages)?;
    if !plan.install.is_empty() && rpm_sources.is_empty() && !use_base_image_repos {
        bail!(
            "have {} packages to install but no RPM sources were specified",
            plan.install.len()
        );
    }
    packages::update_packages(chroot, &plan)?;

    update_hostname(&os.hostname, chroot)?;

    copy_additional_files(base_config_path, &os.additional_files, chroot)?;

    run_scripts(base_config_path, &os.post_install_scripts, chroot)
        .context("failed to run post-install scripts")?;

    handle_selinux_mode(os.selinux.mode, chroot)?;

    handle_kernel_command_line(os, chroot).context("failed to add extra kernel command line")?;

    for user in &os.users {
        users::add_or_update_user(base_config_path, user, chroot)
            .with_context(|| format!("failed to configure user ({})", user.name))?;
    }

    handle_services(&os.services, chroot)?;
    handle_modules(&os.modules, chroot)?;

    let overlays_added = overlays::handle_overlays(&os.overlays, chroot)?;
    if overlays_added {
        regenerate_initramfs(chroot)?;
    }

    run_scripts(base_config_path, &os.finalize_image_scripts, chroot)
        .context("failed to run finalize image scripts")?;

    Ok(())
}

/// Point the chroot at the host's DNS configuration so in-chroot package
/// installs can reach the network. Deleted again at teardown.
fn override_resolv_conf(chroot: &Chroot) -> Result<()> {
    let dest = chroot.host_path(RESOLV_CONF_PATH);

    // The base image's resolv.conf is often a dangling symlink into /run.
    match fs::remove_file(&dest) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to remove ({})", dest.display()));
        }
    }

    fs::copy(HOST_RESOLV_CONF_PATH, &dest)
        .context("failed to override chroot resolv.conf with the host's")?;
    Ok(())
}

fn delete_resolv_conf(chroot: &Chroot) -> Result<()> {
    let dest = chroot.host_path(RESOLV_CONF_PATH);
    match fs::remove_file(&dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove ({})", dest.display())),
    }
}

fn update_hostname(hostname: &str, chroot: &Chroot) -> Result<()> {
    if hostname.is_empty() {
        return Ok(());
    }

    println!("Setting hostname: {hostname}");
    files::write_file_with_dirs(chroot.host_path("etc/hostname"), hostname)
        .context("failed to write hostname file")
}

fn copy_additional_files(
    base_config_path: &Path,
    additional_files: &AdditionalFiles,
    chroot: &Chroot,
) -> Result<()> {
    for (source_file, file_configs) in additional_files {
        for file_config in file_configs {
            println!("Copying: {}", file_config.path);

            let source = base_config_path.join(source_file);
            let dest = chroot.host_path(&file_config.path);

            files::copy_file_with_dirs(&source, &dest).with_context(|| {
                format!(
                    "failed to copy additional file ({source_file}) to ({})",
                    file_config.path
                )
            })?;

            if let Some(permissions) = &file_config.permissions {
                let mode = config::parse_permissions(permissions)?;
                files::set_mode(&dest, mode)?;
            }
        }
    }

    Ok(())
}

fn run_scripts(base_config_path: &Path, scripts: &[Script], chroot: &Chroot) -> Result<()> {
    if scripts.is_empty() {
        return Ok(());
    }

    // The config directory is made visible read-only inside the chroot so
    // scripts can reference their sibling files.
    let mount_target = chroot.host_path(CONFIG_DIR_MOUNT_IN_CHROOT);
    let mut config_mount = crate::mount::MountHandle::new(
        base_config_path,
        &mount_target,
        "",
        MountFlags::BIND | MountFlags::RDONLY,
        "",
        true,
    )
    .context("failed to mount config directory into chroot")?;

    let result = run_scripts_helper(scripts, chroot);
    let close_result = config_mount.close();

    result?;
    close_result?;

    Ok(())
}

fn run_scripts_helper(scripts: &[Script], chroot: &Chroot) -> Result<()> {
    for script in scripts {
        println!("Running script: {}", script.path);

        let mut command = format!("{CONFIG_DIR_MOUNT_IN_CHROOT}/{}", script.path);
        if !script.args.is_empty() {
            command.push(' ');
            command.push_str(&script.args);
        }

        chroot
            .run_shell(&command)
            .with_context(|| format!("script ({}) failed", script.path))?;
    }

    Ok(())
}

fn handle_selinux_mode(mode: SeLinuxMode, chroot: &Chroot) -> Result<()> {
    // Default is the identity transform: keep the base image's mode.
    if mode == SeLinuxMode::Default {
        return Ok(());
    }

    let config_value = mode.config_value();
    println!("Setting SELinux mode: {config_value}");

    let config_path = chroot.host_path(SELINUX_CONFIG_PATH);
    let content = fs::read_to_string(&config_path).with_context(|| {
        format!(
            "failed to read SELinux config ({}); is an SELinux policy installed in the base image?",
            config_path.display()
        )
    })?;

    let updated = set_selinux_config_mode(&content, config_value);
    fs::write(&config_path, updated)
        .with_context(|| format!("failed to write SELinux config ({})", config_path.display()))?;

    Ok(())
}

fn set_selinux_config_mode(content: &str, config_value: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if line.starts_with("SELINUX=") {
            out.push_str("SELINUX=");
            out.push_str(config_value);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn handle_kernel_command_line(os: &Os, chroot: &Chroot) -> Result<()> {
    let mut extra = os.kernel_command_line.extra_command_line.trim().to_string();

    if os.selinux.mode == SeLinuxMode::ForceEnforcing {
        if !extra.is_empty() {
            extra.push(' ');
        }
        extra.push_str(SELINUX_FORCE_ENFORCING_ARGS);
    }

    // Nothing to insert; leave the grub config untouched.
    if extra.is_empty() {
        return Ok(());
    }

    println!("Adding kernel command line args: {extra}");
    bootloader::add_kernel_command_line(&extra, chroot)
}

fn handle_services(services: &Services, chroot: &Chroot) -> Result<()> {
    for service in &services.enable {
        println!("Enabling service: {service}");
        chroot
            .run_live(false, "systemctl", &["enable", service])
            .with_context(|| format!("failed to enable service ({service})"))?;
    }

    for service in &services.disable {
        println!("Disabling service: {service}");
        chroot
            .run_live(false, "systemctl", &["disable", service])
            .with_context(|| format!("failed to disable service ({service})"))?;
    }

    Ok(())
}

fn handle_modules(modules: &Modules, chroot: &Chroot) -> Result<()> {
    if !modules.load.is_empty() {
        let content: String = modules.load.iter().map(|m| format!("{m}\n")).collect();
        files::write_file_with_dirs(chroot.host_path(MODULES_LOAD_PATH), content)
            .context("failed to write modules-load config")?;
    }

    if !modules.disable.is_empty() {
        let content: String = modules
            .disable
            .iter()
            .map(|m| format!("blacklist {m}\n"))
            .collect();
        files::write_file_with_dirs(chroot.host_path(MODULES_DISABLE_PATH), content)
            .context("failed to write modprobe blacklist config")?;
    }

    Ok(())
}

fn regenerate_initramfs(chroot: &Chroot) -> Result<()> {
    println!("Regenerating initramfs");

    for kernel_version in installed_kernel_versions(chroot)? {
        chroot
            .run_live(false, "dracut", &["--force", "--kver", &kernel_version])
            .with_context(|| {
                format!("failed to regenerate initramfs for kernel ({kernel_version})")
            })?;
    }

    Ok(())
}

fn installed_kernel_versions(chroot: &Chroot) -> Result<Vec<String>> {
    let modules_dir = chroot.host_path(KERNEL_MODULES_DIR);

    let entries = fs::read_dir(&modules_dir).with_context(|| {
        format!(
            "failed to read kernel modules directory ({})",
            modules_dir.display()
        )
    })?;

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    versions.sort();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_qemu_image_format() {
        assert_eq!(to_qemu_image_format("vhd").unwrap(), "vpc");
        assert_eq!(to_qemu_image_format("vhdx").unwrap(), "vhdx");
        assert_eq!(to_qemu_image_format("raw").unwrap(), "raw");
        assert_eq!(to_qemu_image_format("qcow2").unwrap(), "qcow2");
        assert!(to_qemu_image_format("vmdk").is_err());
    }

    #[test]
    fn test_set_selinux_config_mode() {
        let content = "# SELinux configuration\nSELINUX=disabled\nSELINUXTYPE=targeted\n";

        let updated = set_selinux_config_mode(content, "enforcing");

        assert_eq!(
            updated,
            "# SELinux configuration\nSELINUX=enforcing\nSELINUXTYPE=targeted\n"
        );
    }

    #[test]
    fn test_validate_script_requires_executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("setup.sh"), "#!/bin/sh\n").unwrap();

        let script = Script {
            path: "setup.sh".to_string(),
            args: String::new(),
        };

        let err = validate_script(dir.path(), &script).unwrap_err();
        assert!(err.to_string().contains("executable bit"));

        files::set_mode(&dir.path().join("setup.sh"), 0o755).unwrap();
        validate_script(dir.path(), &script).unwrap();
    }

    #[test]
    fn test_validate_script_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();

        let script = Script {
            path: "missing.sh".to_string(),
            args: String::new(),
        };

        let err = validate_script(dir.path(), &script).unwrap_err();
        assert!(format!("{err:#}").contains("couldn't read install script"));
    }

    #[test]
    fn test_validate_config_checks_additional_file_sources() {
        let dir = tempfile::tempdir().unwrap();

        let config = Config::from_yaml(
            "os:\n  additionalFiles:\n    a.txt:\n      - path: /a.txt\n",
        )
        .unwrap();

        let err = validate_config(dir.path(), &config).unwrap_err();
        assert!(format!("{err:#}").contains("not a file"));

        fs::write(dir.path().join("a.txt"), "abcdefg\n").unwrap();
        validate_config(dir.path(), &config).unwrap();
    }
}
