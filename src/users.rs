//! Local user creation and update inside the image chroot.
//!
//! All mutations go through chroot-confined invocations of the image's
//! own tools (`useradd`, `usermod`, `id`) or direct edits of the shadow
//! and passwd files at their staged host paths.

use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::chroot::Chroot;
use crate::common::files;
use crate::config::{Password, PasswordType, User};
use crate::process::Cmd;

const SHADOW_FILE: &str = "etc/shadow";
const PASSWD_FILE: &str = "etc/passwd";
const ROOT_USER: &str = "root";
const ROOT_HOME_DIR: &str = "/root";
const USER_HOME_DIR_PREFIX: &str = "/home";

/// The shadow password field of a locked account.
const LOCKED_PASSWORD: &str = "!";

/// Apply one user entry: create the user if missing, then password,
/// aging, group membership, ssh keys and startup command, in that order.
pub fn add_or_update_user(base_config_path: &Path, user: &User, chroot: &Chroot) -> Result<()> {
    let hashed_password = resolve_password(base_config_path, &user.password)?;

    println!("  Configuring user: {}", user.name);

    if user_exists(&user.name, chroot)? {
        if let Some(hashed) = &hashed_password {
            update_user_password(&user.name, hashed, chroot)?;
        }
    } else {
        add_user(&user.name, hashed_password.as_deref(), user.uid, chroot)?;
    }

    if let Some(days) = user.password_expires_days {
        chage(chroot, days, &user.name)?;
    }

    configure_group_membership(&user.name, &user.primary_group, &user.secondary_groups, chroot)?;
    provision_ssh_keys(base_config_path, &user.name, &user.ssh_public_key_paths, chroot)?;

    if !user.startup_command.is_empty() {
        configure_startup_command(&user.name, &user.startup_command, chroot)?;
    }

    Ok(())
}

/// Resolve the password sum type to a shadow-ready hash, or `None` when
/// no password change is requested.
fn resolve_password(base_config_path: &Path, password: &Password) -> Result<Option<String>> {
    match password.password_type {
        PasswordType::Default => Ok(None),
        PasswordType::Locked => Ok(Some(LOCKED_PASSWORD.to_string())),
        PasswordType::PlainText => hash_password(&password.value).map(Some),
        PasswordType::Hashed => Ok(Some(password.value.clone())),
        PasswordType::PlainTextFile => {
            let plain = read_password_file(base_config_path, &password.value)?;
            hash_password(&plain).map(Some)
        }
        PasswordType::HashedFile => read_password_file(base_config_path, &password.value).map(Some),
    }
}

fn read_password_file(base_config_path: &Path, relative_path: &str) -> Result<String> {
    let path = base_config_path.join(relative_path);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read password file ({})", path.display()))?;
    Ok(content.trim_end_matches('\n').to_string())
}

pub fn user_exists(username: &str, chroot: &Chroot) -> Result<bool> {
    let result = chroot.run_unchecked("id", &["-u", username])?;

    if result.success() {
        return Ok(true);
    }
    if result.stderr.contains("no such user") {
        return Ok(false);
    }

    bail!(
        "failed to check if user exists ({username}): {}",
        result.stderr_trimmed()
    )
}

pub fn add_user(
    username: &str,
    hashed_password: Option<&str>,
    uid: Option<u32>,
    chroot: &Chroot,
) -> Result<()> {
    let uid_string = uid.map(|uid| uid.to_string());

    let mut args: Vec<&str> = vec!["-m"];
    if let Some(hashed) = hashed_password {
        args.push("-p");
        args.push(hashed);
    }
    if let Some(uid_string) = &uid_string {
        args.push("-u");
        args.push(uid_string);
    }
    args.push(username);

    chroot
        .run_live(false, "useradd", &args)
        .with_context(|| format!("failed to add user ({username})"))
}

/// Hash a plain-text password with SHA-512-crypt and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    const SALT_LENGTH: usize = 12;

    let salt = generate_salt(SALT_LENGTH);

    // The -6 option selects the SHA-512 algorithm.
    let result = Cmd::new("openssl")
        .args(["passwd", "-6", "-salt", &salt, password])
        .error_msg("failed to generate hashed password")
        .run()?;

    Ok(result.stdout_trimmed().to_string())
}

fn generate_salt(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn update_user_password(username: &str, hashed_password: &str, chroot: &Chroot) -> Result<()> {
    let find = format!("{username}:x:");
    let replace = format!("{username}:{hashed_password}:");
    let shadow_path = chroot.host_path(SHADOW_FILE);

    sed(&find, &replace, "|", &shadow_path).with_context(|| {
        format!(
            "failed to write ({username}) hashed password to shadow file ({})",
            shadow_path.display()
        )
    })
}

/// Set the account's password expiration the way `chage -M <days> <name>`
/// would: -1 blanks the aging fields (never expires), otherwise the
/// expiration becomes last-change + days.
pub fn chage(chroot: &Chroot, password_expires_days: i64, username: &str) -> Result<()> {
    let shadow_path = chroot.host_path(SHADOW_FILE);
    let content = fs::read_to_string(&shadow_path)
        .with_context(|| format!("failed to read shadow file ({})", shadow_path.display()))?;

    let updated =
        apply_password_expiration(&content, username, password_expires_days, days_since_epoch()?)?;

    files::replace_file(&shadow_path, updated)
        .with_context(|| format!("failed to rewrite shadow file ({})", shadow_path.display()))
}

fn days_since_epoch() -> Result<i64> {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;
    Ok((elapsed.as_secs() / 86_400) as i64)
}

fn apply_password_expiration(
    shadow: &str,
    username: &str,
    password_expires_days: i64,
    today: i64,
) -> Result<String> {
    // Each shadow entry has 9 colon-separated fields: login name,
    // encrypted password, date of last password change, minimum password
    // age, maximum password age, warning period, inactivity period,
    // account expiration date, and a reserved field.
    const TOTAL_FIELDS: usize = 9;
    const LAST_CHANGE_FIELD: usize = 2;
    const MAX_AGE_FIELD: usize = 4;
    const EXPIRATION_FIELD: usize = 7;
    const RESERVED_FIELD: usize = 8;
    const NEVER_EXPIRES: i64 = -1;

    if password_expires_days < NEVER_EXPIRES {
        bail!(
            "invalid password expiration value ({password_expires_days}) for user ({username}): must be {NEVER_EXPIRES} or greater"
        );
    }

    let entry_prefix = format!("{username}:");
    let mut lines: Vec<String> = shadow.lines().map(str::to_string).collect();

    for line in &mut lines {
        if !line.starts_with(&entry_prefix) {
            continue;
        }

        let mut fields: Vec<String> = line.split(':').map(str::to_string).collect();
        if fields.len() != TOTAL_FIELDS {
            bail!(
                "invalid shadow entry for user ({username}): {TOTAL_FIELDS} fields expected, but {} found",
                fields.len()
            );
        }

        if password_expires_days == NEVER_EXPIRES {
            // Never expires: expressed by blanking the aging fields.
            for field in &mut fields[MAX_AGE_FIELD..=RESERVED_FIELD] {
                field.clear();
            }
        } else {
            if fields[LAST_CHANGE_FIELD].is_empty() {
                fields[LAST_CHANGE_FIELD] = today.to_string();
            }
            let last_change: i64 = fields[LAST_CHANGE_FIELD].parse().with_context(|| {
                format!(
                    "invalid last-change value ({}) in shadow entry for user ({username})",
                    fields[LAST_CHANGE_FIELD]
                )
            })?;
            fields[EXPIRATION_FIELD] = (last_change + password_expires_days).to_string();
        }

        *line = fields.join(":");
        return Ok(lines.join("\n") + "\n");
    }

    bail!("user ({username}) not found when changing the password expiration date")
}

pub fn configure_group_membership(
    username: &str,
    primary_group: &str,
    secondary_groups: &[String],
    chroot: &Chroot,
) -> Result<()> {
    if !primary_group.is_empty() {
        chroot
            .run_live(false, "usermod", &["-g", primary_group, username])
            .with_context(|| format!("failed to set primary group of user ({username})"))?;
    }

    if !secondary_groups.is_empty() {
        let all_groups = secondary_groups.join(",");
        chroot
            .run_live(false, "usermod", &["-a", "-G", &all_groups, username])
            .with_context(|| format!("failed to set secondary groups of user ({username})"))?;
    }

    Ok(())
}

/// Copy the public key files into `<home>/.ssh`, build authorized_keys
/// from their lines, and fix up ownership and permissions.
pub fn provision_ssh_keys(
    base_config_path: &Path,
    username: &str,
    ssh_public_key_paths: &[String],
    chroot: &Chroot,
) -> Result<()> {
    // With no keys, leave the directory to SSH to create on first use.
    if ssh_public_key_paths.is_empty() {
        return Ok(());
    }

    let home_dir = user_home_directory(username);
    let ssh_dir = format!("{home_dir}/.ssh");
    let ssh_dir_host = chroot.host_path(&ssh_dir);
    fs::create_dir_all(&ssh_dir_host)
        .with_context(|| format!("failed to create ssh directory ({})", ssh_dir_host.display()))?;

    let mut authorized_keys = String::new();
    for key_path in ssh_public_key_paths {
        let source = base_config_path.join(key_path);
        let file_name = source
            .file_name()
            .with_context(|| format!("ssh public key path ({key_path}) has no file name"))?
            .to_os_string();

        println!(
            "  Adding ssh key ({}) to user ({username})",
            file_name.to_string_lossy()
        );

        files::copy_file_with_dirs(&source, &ssh_dir_host.join(&file_name))
            .with_context(|| format!("failed to copy ssh public key ({key_path})"))?;

        let content = fs::read_to_string(&source)
            .with_context(|| format!("failed to read ssh public key ({key_path})"))?;
        for line in content.lines() {
            authorized_keys.push_str(line);
            authorized_keys.push('\n');
        }
    }

    fs::write(ssh_dir_host.join("authorized_keys"), authorized_keys)
        .with_context(|| format!("failed to write authorized_keys for user ({username})"))?;

    // Ownership follows the user's primary group inside the image.
    let result = chroot
        .run("id", &["-g", username])
        .with_context(|| format!("failed to find primary group of user ({username})"))?;
    let primary_group = result.stdout_trimmed().to_string();
    debug!("Primary group for user ({username}) is ({primary_group})");

    let ownership = format!("{username}:{primary_group}");
    chroot
        .run_live(false, "chown", &["-R", &ownership, &ssh_dir])
        .with_context(|| format!("failed to change ownership of ({ssh_dir})"))?;
    chroot
        .run_live(false, "chmod", &["-R", "0700", &ssh_dir])
        .with_context(|| format!("failed to change permissions of ({ssh_dir})"))?;

    Ok(())
}

pub fn user_home_directory(username: &str) -> String {
    if username == ROOT_USER {
        ROOT_HOME_DIR.to_string()
    } else {
        format!("{USER_HOME_DIR_PREFIX}/{username}")
    }
}

/// Replace the user's login shell field in /etc/passwd.
pub fn configure_startup_command(
    username: &str,
    startup_command: &str,
    chroot: &Chroot,
) -> Result<()> {
    debug!("Updating user ({username}) startup command to ({startup_command})");

    let find = format!("^\\({username}.*\\):[^:]*$");
    let replace = format!("\\1:{startup_command}");
    let passwd_path = chroot.host_path(PASSWD_FILE);

    sed(&find, &replace, "|", &passwd_path).with_context(|| {
        format!("failed to update user's ({username}) startup command ({startup_command})")
    })
}

fn sed(find: &str, replace: &str, delimiter: &str, file: &Path) -> Result<()> {
    let expression = format!("s{delimiter}{find}{delimiter}{replace}{delimiter}");
    Cmd::new("sed")
        .arg("-i")
        .arg(expression)
        .arg_path(file)
        .run()?;
    Ok(())
}
