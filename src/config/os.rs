//! OS-level customization settings: packages, users, scripts, overlays.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;

/// Mapping from config-relative source path to the in-image destinations.
pub type AdditionalFiles = BTreeMap<String, Vec<FileConfig>>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Os {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub selinux: SeLinux,
    #[serde(default)]
    pub kernel_command_line: KernelCommandLine,
    #[serde(default)]
    pub additional_files: AdditionalFiles,
    #[serde(default)]
    pub post_install_scripts: Vec<Script>,
    #[serde(default)]
    pub finalize_image_scripts: Vec<Script>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub services: Services,
    #[serde(default)]
    pub modules: Modules,
    #[serde(default)]
    pub verity: Option<Verity>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
}

impl Os {
    pub fn is_valid(&self) -> Result<()> {
        if !self.hostname.is_empty() && !hostname_is_valid(&self.hostname) {
            bail!("invalid hostname: {}", self.hostname);
        }

        self.selinux.is_valid().context("invalid selinux value")?;

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

        for (i, script) in self.post_install_scripts.iter().enumerate() {
            script
                .is_valid()
                .with_context(|| format!("invalid postInstallScripts item at index {i}"))?;
        }

        for (i, script) in self.finalize_image_scripts.iter().enumerate() {
            script
                .is_valid()
                .with_context(|| format!("invalid finalizeImageScripts item at index {i}"))?;
        }

        for (i, user) in self.users.iter().enumerate() {
            user.is_valid()
                .with_context(|| format!("invalid users item at index {i}"))?;
        }

        self.services.is_valid()?;
        self.modules.is_valid()?;

        if let Some(verity) = &self.verity {
            verity.is_valid().context("invalid verity value")?;
        }

        for (i, overlay) in self.overlays.iter().enumerate() {
            overlay
                .is_valid()
                .with_context(|| format!("invalid overlays item at index {i}"))?;
        }

        Ok(())
    }
}

/// DNS name check: dot-separated labels of up to 63 alphanumeric-or-hyphen
/// characters, not starting or ending with a hyphen. Underscores are
/// rejected outright.
fn hostname_is_valid(hostname: &str) -> bool {
    if hostname.len() > 253 || hostname.contains('_') {
        return false;
    }

    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Packages {
    /// Update all packages already present in the base image.
    #[serde(default)]
    pub update_existing_packages: bool,
    #[serde(default)]
    pub install_lists: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub remove_lists: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub update_lists: Vec<String>,
    #[serde(default)]
    pub update: Vec<String>,
}

/// The contents of a package list file referenced by `installLists` et al.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackageList {
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeLinux {
    #[serde(default)]
    pub mode: SeLinuxMode,
}

impl SeLinux {
    pub fn is_valid(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeLinuxMode {
    /// Keep the base image's existing SELinux mode.
    #[default]
    Default,
    Disabled,
    Enforcing,
    Permissive,
    /// Set enforcing mode and also force it via the kernel command line.
    ForceEnforcing,
}

impl SeLinuxMode {
    /// The value written to the `SELINUX=` line of /etc/selinux/config.
    pub fn config_value(&self) -> &'static str {
        match self {
            SeLinuxMode::Default => "",
            SeLinuxMode::Disabled => "disabled",
            SeLinuxMode::Enforcing | SeLinuxMode::ForceEnforcing => "enforcing",
            SeLinuxMode::Permissive => "permissive",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KernelCommandLine {
    /// Extra kernel command line args.
    #[serde(default)]
    pub extra_command_line: String,
}

impl KernelCommandLine {
    pub fn is_valid(&self) -> Result<()> {
        command_line_is_valid(&self.extra_command_line, "extraCommandLine")
    }
}

/// Disallow characters that would break the grub.cfg file, plus the sed
/// escape character used by the user-manager edits.
fn command_line_is_valid(command_line: &str, field_name: &str) -> Result<()> {
    let invalid = command_line
        .chars()
        .any(|c| matches!(c, '\n' | '\'' | '"' | '\\' | '$' | '`'));
    if invalid {
        bail!("the {field_name} value contains invalid characters");
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    /// Destination path inside the image.
    pub path: String,
    /// Octal permission bits, e.g. "664" or "0664".
    #[serde(default)]
    pub permissions: Option<String>,
}

impl FileConfig {
    pub fn is_valid(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            bail!("destination path ({}) must be an absolute path", self.path);
        }

        if let Some(permissions) = &self.permissions {
            parse_permissions(permissions)?;
        }

        Ok(())
    }
}

/// Parse a 3- or 4-digit octal permissions string.
pub fn parse_permissions(permissions: &str) -> Result<u32> {
    if !(3..=4).contains(&permissions.len()) {
        bail!("invalid permissions ({permissions}): must be 3 or 4 octal digits");
    }

    u32::from_str_radix(permissions, 8)
        .with_context(|| format!("invalid permissions ({permissions}): must be 3 or 4 octal digits"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Script {
    /// Path of the script, local to the config document's directory.
    pub path: String,
    #[serde(default)]
    pub args: String,
}

impl Script {
    pub fn is_valid(&self) -> Result<()> {
        // The script must sit under the config directory, which gets
        // bind-mounted into the chroot for the run.
        if self.path.is_empty() || !path_is_local(&self.path) {
            bail!("script path ({}) must be local to the config directory", self.path);
        }

        Ok(())
    }
}

fn path_is_local(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub password: Password,
    /// -1 means the password never expires.
    #[serde(default)]
    pub password_expires_days: Option<i64>,
    #[serde(default)]
    pub ssh_public_key_paths: Vec<String>,
    #[serde(default)]
    pub primary_group: String,
    #[serde(default)]
    pub secondary_groups: Vec<String>,
    #[serde(default)]
    pub startup_command: String,
}

impl User {
    pub fn is_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("user name may not be empty");
        }

        self.password.is_valid().context("invalid password value")?;

        if let Some(days) = self.password_expires_days {
            if days < -1 {
                bail!("invalid passwordExpiresDays value ({days}): must be -1 or greater");
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Password {
    #[serde(default, rename = "type")]
    pub password_type: PasswordType,
    #[serde(default)]
    pub value: String,
}

impl Password {
    pub fn is_valid(&self) -> Result<()> {
        match self.password_type {
            PasswordType::Default | PasswordType::Locked => {
                if !self.value.is_empty() {
                    bail!("value must be empty when type is ({:?})", self.password_type);
                }
            }
            PasswordType::PlainText
            | PasswordType::Hashed
            | PasswordType::PlainTextFile
            | PasswordType::HashedFile => {
                if self.value.is_empty() {
                    bail!(
                        "value must not be empty when type is ({:?})",
                        self.password_type
                    );
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PasswordType {
    #[default]
    Default,
    Locked,
    PlainText,
    Hashed,
    PlainTextFile,
    HashedFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Services {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

impl Services {
    pub fn is_valid(&self) -> Result<()> {
        for (i, service) in self.enable.iter().enumerate() {
            name_is_valid(service)
                .with_context(|| format!("invalid services enable item at index {i}"))?;
        }
        for (i, service) in self.disable.iter().enumerate() {
            name_is_valid(service)
                .with_context(|| format!("invalid services disable item at index {i}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Modules {
    #[serde(default)]
    pub load: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

impl Modules {
    pub fn is_valid(&self) -> Result<()> {
        for (i, module) in self.load.iter().enumerate() {
            name_is_valid(module)
                .with_context(|| format!("invalid modules load item at index {i}"))?;
        }
        for (i, module) in self.disable.iter().enumerate() {
            name_is_valid(module)
                .with_context(|| format!("invalid modules disable item at index {i}"))?;
        }
        Ok(())
    }
}

fn name_is_valid(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name may not be empty");
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        bail!("name ({name}) may not contain whitespace or '/'");
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Verity {
    pub data_partition: VerityPartition,
    pub hash_partition: VerityPartition,
}

impl Verity {
    pub fn is_valid(&self) -> Result<()> {
        self.data_partition
            .is_valid()
            .context("invalid dataPartition value")?;
        self.hash_partition
            .is_valid()
            .context("invalid hashPartition value")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerityPartition {
    pub id_type: IdType,
    pub id: String,
}

impl VerityPartition {
    pub fn is_valid(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("id may not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    PartLabel,
    Uuid,
    PartUuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Overlay {
    pub lower: String,
    pub upper: String,
    pub work: String,
    /// The target directory path of the mount.
    pub target: String,
    /// Additional options for the mount.
    #[serde(default)]
    pub options: String,
}

impl Overlay {
    pub fn is_valid(&self) -> Result<()> {
        for (field, value) in [
            ("lower", &self.lower),
            ("upper", &self.upper),
            ("work", &self.work),
            ("target", &self.target),
        ] {
            if !value.starts_with('/') {
                bail!("overlay {field} path ({value}) must be an absolute path");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_rules() {
        assert!(hostname_is_valid("my-host.example.com"));
        assert!(hostname_is_valid("host1"));
        assert!(!hostname_is_valid("my_host"));
        assert!(!hostname_is_valid("-host"));
        assert!(!hostname_is_valid("host-"));
        assert!(!hostname_is_valid("a..b"));
    }

    #[test]
    fn test_command_line_rejects_special_characters() {
        for bad in ["a\nb", "a'b", "a\"b", "a\\b", "a$b", "a`b"] {
            assert!(command_line_is_valid(bad, "extraCommandLine").is_err(), "{bad}");
        }

        assert!(command_line_is_valid("console=tty0 console=ttyS0", "extraCommandLine").is_ok());
    }

    #[test]
    fn test_password_value_requirements() {
        let password = Password {
            password_type: PasswordType::PlainText,
            value: String::new(),
        };
        assert!(password.is_valid().is_err());

        let password = Password {
            password_type: PasswordType::Locked,
            value: "x".to_string(),
        };
        assert!(password.is_valid().is_err());

        let password = Password {
            password_type: PasswordType::Hashed,
            value: "$6$salt$hash".to_string(),
        };
        assert!(password.is_valid().is_ok());
    }

    #[test]
    fn test_user_rejects_expiration_below_never_expires() {
        let user = User {
            name: "alice".to_string(),
            uid: None,
            password: Password::default(),
            password_expires_days: Some(-2),
            ssh_public_key_paths: Vec::new(),
            primary_group: String::new(),
            secondary_groups: Vec::new(),
            startup_command: String::new(),
        };

        assert!(user.is_valid().is_err());
    }

    #[test]
    fn test_script_path_must_be_local() {
        for bad in ["/abs/path.sh", "../escape.sh", "a/../../b.sh", ""] {
            let script = Script {
                path: bad.to_string(),
                args: String::new(),
            };
            assert!(script.is_valid().is_err(), "{bad}");
        }

        let script = Script {
            path: "scripts/setup.sh".to_string(),
            args: String::new(),
        };
        assert!(script.is_valid().is_ok());
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions("664").unwrap(), 0o664);
        assert_eq!(parse_permissions("0755").unwrap(), 0o755);
        assert!(parse_permissions("9755").is_err());
        assert!(parse_permissions("77").is_err());
        assert!(parse_permissions("07777").is_err());
    }

    #[test]
    fn test_overlay_paths_must_be_absolute() {
        let overlay = Overlay {
            lower: "/usr".to_string(),
            upper: "overlays/usr/upper".to_string(),
            work: "/overlays/usr/work".to_string(),
            target: "/usr".to_string(),
            options: String::new(),
        };

        let err = overlay.is_valid().unwrap_err();
        assert!(err.to_string().contains("upper"));
    }
}
