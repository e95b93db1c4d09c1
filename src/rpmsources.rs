//! Composition of RPM package sources into a single repo config inside
//! the chroot.
//!
//! Each source (directory of *.rpm files, tarball of packages, or repo
//! .conf file) is materialized as a read-only bind mount under a parent
//! directory in the chroot, and one aggregated repo file points the
//! in-chroot package manager at all of them. The aggregated file lists
//! sections in source-iteration order: callers arrange sources by
//! priority, highest first, because the package manager itself is not
//! priority-aware.

use anyhow::{bail, Context, Result};
use rustix::mount::MountFlags;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::chroot::Chroot;
use crate::common::files;
use crate::mount::MountHandle;
use crate::process::Cmd;
use crate::repofile::{RepoConfig, RepoSection};

/// Parent directory of the RPM source mounts, as seen inside the chroot.
pub const RPMS_MOUNT_PARENT_DIR_IN_CHROOT: &str = "/_localrpms";

/// Name of the aggregated repo file, placed directly under the parent.
pub const ALL_REPOS_FILE_NAME: &str = "allrepos.repo";

const EXTRACTED_RPMS_DIR_NAME: &str = "extracted_rpms";
const BASE_IMAGE_REPOS_DIR: &str = "etc/yum.repos.d";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpmSourceKind {
    Directory,
    Tarball,
    RepoConfigFile,
}

/// The mounted RPM sources plus the emitted aggregated repo file.
///
/// `close` deletes the repo file, releases the mounts in reverse order,
/// then removes the parent directory with a non-recursive call; a leaked
/// mount turns that removal into a loud failure instead of a silent
/// delete-through.
pub struct RpmSourcesMounts {
    rpms_mount_parent_dir: PathBuf,
    parent_dir_created: bool,
    repo_file_path: Option<PathBuf>,
    mounts: Vec<MountHandle>,
}

/// Materialize `rpm_sources` into the chroot and write the aggregated
/// repo file. With `use_base_image_repos`, the base image's own repo
/// sections are appended after the provided sources.
pub fn mount_rpm_sources(
    build_dir: &Path,
    chroot: &Chroot,
    rpm_sources: &[PathBuf],
    use_base_image_repos: bool,
) -> Result<RpmSourcesMounts> {
    let mut mounts = RpmSourcesMounts {
        rpms_mount_parent_dir: chroot.host_path(RPMS_MOUNT_PARENT_DIR_IN_CHROOT),
        parent_dir_created: false,
        repo_file_path: None,
        mounts: Vec::new(),
    };

    if let Err(err) =
        mounts.mount_rpm_sources_helper(build_dir, chroot, rpm_sources, use_base_image_repos)
    {
        if let Err(cleanup_err) = mounts.close() {
            warn!("rpm sources mount cleanup failed: {cleanup_err:#}");
        }
        return Err(err);
    }

    Ok(mounts)
}

impl RpmSourcesMounts {
    fn mount_rpm_sources_helper(
        &mut self,
        build_dir: &Path,
        chroot: &Chroot,
        rpm_sources: &[PathBuf],
        use_base_image_repos: bool,
    ) -> Result<()> {
        let extracted_rpms_dir = build_dir.join(EXTRACTED_RPMS_DIR_NAME);

        // Fail if the directory already exists: a leftover from a previous
        // run means mounts may still be live under it.
        fs::create_dir(&self.rpms_mount_parent_dir).with_context(|| {
            format!(
                "failed to create source rpms directory ({})",
                self.rpms_mount_parent_dir.display()
            )
        })?;
        self.parent_dir_created = true;

        let mut all_repos = RepoConfig::default();

        for rpm_source in rpm_sources {
            match classify_rpm_source(rpm_source)? {
                RpmSourceKind::Directory => {
                    self.add_repo_from_directory(rpm_source, &mut all_repos, chroot)?
                }
                RpmSourceKind::Tarball => self.add_repo_from_tarball(
                    &extracted_rpms_dir,
                    rpm_source,
                    &mut all_repos,
                    chroot,
                )?,
                RpmSourceKind::RepoConfigFile => {
                    self.add_repo_from_repo_config(rpm_source, &mut all_repos, chroot)?
                }
            }
        }

        if use_base_image_repos {
            add_base_image_repos(chroot, &mut all_repos)?;
        }

        let repo_file_path = self.rpms_mount_parent_dir.join(ALL_REPOS_FILE_NAME);
        fs::write(&repo_file_path, all_repos.serialize()).with_context(|| {
            format!(
                "failed to write aggregated repo file ({})",
                repo_file_path.display()
            )
        })?;
        self.repo_file_path = Some(repo_file_path);

        Ok(())
    }

    /// Turn a directory of *.rpm files into a repo and mount it.
    fn add_repo_from_directory(
        &mut self,
        rpm_source: &Path,
        all_repos: &mut RepoConfig,
        chroot: &Chroot,
    ) -> Result<()> {
        Cmd::new("createrepo")
            .arg("--update")
            .arg_path(rpm_source)
            .error_msg(format!(
                "failed to create RPMs repo from directory ({})",
                rpm_source.display()
            ))
            .run()?;

        let name = directory_source_name(rpm_source)?;
        let chroot_dir = self.mount_rpms_directory(&name, rpm_source, chroot)?;
        all_repos.push(local_repo_section(&name, &chroot_dir));

        Ok(())
    }

    /// Extract a tarball of *.rpm files (content-addressed by its SHA-256,
    /// so repeated runs reuse the extraction), turn it into a repo, and
    /// mount it.
    fn add_repo_from_tarball(
        &mut self,
        extracted_rpms_dir: &Path,
        rpm_source: &Path,
        all_repos: &mut RepoConfig,
        chroot: &Chroot,
    ) -> Result<()> {
        debug!("Calculating SHA-256 of rpms tarball ({})", rpm_source.display());
        let rpm_source_hash = files::sha256_file(rpm_source)
            .with_context(|| format!("failed to get hash of RPM tarball ({})", rpm_source.display()))?;

        let extract_directory = extracted_rpms_dir.join(&rpm_source_hash);
        if !extract_directory.is_dir() {
            fs::create_dir_all(&extract_directory).with_context(|| {
                format!(
                    "failed to create RPMs extract directory ({})",
                    extract_directory.display()
                )
            })?;

            if let Err(err) = extract_and_index_tarball(rpm_source, &extract_directory) {
                if fs::remove_dir_all(&extract_directory).is_err() {
                    warn!(
                        "failed to delete tarball extract directory ({})",
                        extract_directory.display()
                    );
                }
                return Err(err);
            }
        }

        let name = tarball_source_name(rpm_source)?;
        let chroot_dir = self.mount_rpms_directory(&name, &extract_directory, chroot)?;
        all_repos.push(local_repo_section(&name, &chroot_dir));

        Ok(())
    }

    /// Append the sections of a repo .conf file, bind-mounting any
    /// `file://` baseurl into the chroot and rewriting the url to the new
    /// location.
    fn add_repo_from_repo_config(
        &mut self,
        rpm_source: &Path,
        all_repos: &mut RepoConfig,
        chroot: &Chroot,
    ) -> Result<()> {
        let content = fs::read_to_string(rpm_source)
            .with_context(|| format!("failed to read repo config file ({})", rpm_source.display()))?;
        let repos = RepoConfig::parse(&content)
            .with_context(|| format!("failed to load repo config file ({})", rpm_source.display()))?;

        for mut section in repos.sections {
            if section.name.is_empty() {
                bail!(
                    "rpm repo config files must not contain nameless sections ({})",
                    rpm_source.display()
                );
            }

            if let Some(local_path) = section
                .get("baseurl")
                .and_then(|baseurl| baseurl.strip_prefix("file://"))
            {
                let name = section.name.clone();
                let chroot_dir =
                    self.mount_rpms_directory(&name, Path::new(local_path), chroot)?;
                section.set("baseurl", format!("file://{}", chroot_dir.display()));
            }

            all_repos.push(section);
        }

        Ok(())
    }

    /// Bind-mount an RPM directory read-only under the parent directory.
    /// Returns the mount path as seen from inside the chroot.
    fn mount_rpms_directory(
        &mut self,
        name: &str,
        rpms_directory: &Path,
        chroot: &Chroot,
    ) -> Result<PathBuf> {
        let target_name = format!("{:02}{}", self.mounts.len(), name);
        let target_in_chroot = Path::new(RPMS_MOUNT_PARENT_DIR_IN_CHROOT).join(target_name);
        let mount_target = chroot.host_path(&target_in_chroot);

        let mount = MountHandle::new(
            rpms_directory,
            &mount_target,
            "",
            MountFlags::BIND | MountFlags::RDONLY,
            "",
            true,
        )
        .with_context(|| {
            format!(
                "failed to mount RPM source directory from ({}) to ({})",
                rpms_directory.display(),
                mount_target.display()
            )
        })?;

        self.mounts.push(mount);
        Ok(target_in_chroot)
    }

    /// Delete the aggregated repo file, release the mounts in reverse
    /// order, then remove the parent directory non-recursively.
    pub fn close(&mut self) -> Result<()> {
        if let Some(repo_file_path) = self.repo_file_path.take() {
            match fs::remove_file(&repo_file_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    self.repo_file_path = Some(repo_file_path.clone());
                    return Err(err).with_context(|| {
                        format!(
                            "failed to delete aggregated repo file ({})",
                            repo_file_path.display()
                        )
                    });
                }
            }
        }

        let mut errors: Vec<String> = Vec::new();
        while let Some(mut mount) = self.mounts.pop() {
            if let Err(err) = mount.close() {
                errors.push(format!("{err:#}"));
            }
        }
        if !errors.is_empty() {
            bail!("failed to clean up RPM sources mounts:\n{}", errors.join("\n"));
        }

        if self.parent_dir_created {
            // Non-recursive on purpose: if a mount leaked, this fails
            // instead of deleting through it.
            fs::remove_dir(&self.rpms_mount_parent_dir).with_context(|| {
                format!(
                    "failed to delete source rpms directory ({})",
                    self.rpms_mount_parent_dir.display()
                )
            })?;
            self.parent_dir_created = false;
        }

        Ok(())
    }
}

impl Drop for RpmSourcesMounts {
    fn drop(&mut self) {
        if self.parent_dir_created || !self.mounts.is_empty() {
            if let Err(err) = self.close() {
                warn!("rpm sources mounts leaked during drop: {err:#}");
            }
        }
    }
}

fn extract_and_index_tarball(rpm_source: &Path, extract_directory: &Path) -> Result<()> {
    debug!("Extracting rpms tarball ({})", rpm_source.display());
    Cmd::new("tar")
        .arg("-xf")
        .arg_path(rpm_source)
        .arg("-C")
        .arg_path(extract_directory)
        .error_msg(format!(
            "failed to extract RPMs tarball ({})",
            rpm_source.display()
        ))
        .run()?;

    Cmd::new("createrepo")
        .arg_path(extract_directory)
        .error_msg(format!(
            "failed to create RPMs repo from RPMs tarball ({})",
            rpm_source.display()
        ))
        .run()?;

    Ok(())
}

/// Append the base image's own repo sections. Their paths already point
/// inside the chroot, so no rewriting is needed.
fn add_base_image_repos(chroot: &Chroot, all_repos: &mut RepoConfig) -> Result<()> {
    let repos_dir = chroot.host_path(BASE_IMAGE_REPOS_DIR);
    if !repos_dir.is_dir() {
        return Ok(());
    }

    let mut repo_paths: Vec<PathBuf> = fs::read_dir(&repos_dir)
        .with_context(|| format!("failed to read base image repos directory ({})", repos_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "repo"))
        .collect();
    repo_paths.sort();

    for repo_path in repo_paths {
        let content = fs::read_to_string(&repo_path)
            .with_context(|| format!("failed to read base image repo file ({})", repo_path.display()))?;
        let repos = RepoConfig::parse(&content)
            .with_context(|| format!("failed to parse base image repo file ({})", repo_path.display()))?;

        for section in repos.sections {
            all_repos.push(section);
        }
    }

    Ok(())
}

fn local_repo_section(name: &str, chroot_dir: &Path) -> RepoSection {
    let mut section = RepoSection::new(name);
    section.set("name", name);
    section.set("baseurl", format!("file://{}", chroot_dir.display()));
    section.set("enabled", "1");
    section
}

fn classify_rpm_source(path: &Path) -> Result<RpmSourceKind> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to get type of RPM source ({})", path.display()))?;
    if metadata.is_dir() {
        return Ok(RpmSourceKind::Directory);
    }

    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open RPM source ({})", path.display()))?;
    let mut magic = [0u8; 2];
    let read_count = file
        .read(&mut magic)
        .with_context(|| format!("failed to read RPM source ({})", path.display()))?;

    if read_count >= 2 && magic == GZIP_MAGIC {
        return Ok(RpmSourceKind::Tarball);
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("tar") => Ok(RpmSourceKind::Tarball),
        Some("conf") => Ok(RpmSourceKind::RepoConfigFile),
        _ => bail!("unknown RPM source type ({})", path.display()),
    }
}

fn directory_source_name(rpm_source: &Path) -> Result<String> {
    let name = rpm_source
        .file_name()
        .with_context(|| format!("RPM source path ({}) has no name", rpm_source.display()))?;
    Ok(name.to_string_lossy().into_owned())
}

/// The tarball's file name up to its first '.', so `rpms.tar.gz` becomes
/// `rpms`.
fn tarball_source_name(rpm_source: &Path) -> Result<String> {
    let name = directory_source_name(rpm_source)?;
    let name = match name.find('.') {
        Some(index) => name[..index].to_string(),
        None => name,
    };
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_classify_directory() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(
            classify_rpm_source(dir.path()).unwrap(),
            RpmSourceKind::Directory
        );
    }

    #[test]
    fn test_classify_gzip_tarball_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpms.tgz");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[0x1f, 0x8b, 0x08, 0x00]).unwrap();

        assert_eq!(classify_rpm_source(&path).unwrap(), RpmSourceKind::Tarball);
    }

    #[test]
    fn test_classify_plain_tarball_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpms.tar");
        fs::write(&path, "ustar").unwrap();

        assert_eq!(classify_rpm_source(&path).unwrap(), RpmSourceKind::Tarball);
    }

    #[test]
    fn test_classify_repo_config_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.conf");
        fs::write(&path, "[extra]\nbaseurl=https://example.com\n").unwrap();

        assert_eq!(
            classify_rpm_source(&path).unwrap(),
            RpmSourceKind::RepoConfigFile
        );
    }

    #[test]
    fn test_classify_unknown_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery.bin");
        fs::write(&path, "xx").unwrap();

        assert!(classify_rpm_source(&path).is_err());
    }

    #[test]
    fn test_tarball_source_name_strips_extensions() {
        assert_eq!(
            tarball_source_name(Path::new("/a/b/rpms.tar.gz")).unwrap(),
            "rpms"
        );
        assert_eq!(tarball_source_name(Path::new("rpms")).unwrap(), "rpms");
    }

    #[test]
    fn test_local_repo_section_shape() {
        let section = local_repo_section("myrpms", Path::new("/_localrpms/00myrpms"));

        assert_eq!(section.name, "myrpms");
        assert_eq!(section.get("name"), Some("myrpms"));
        assert_eq!(section.get("baseurl"), Some("file:///_localrpms/00myrpms"));
        assert_eq!(section.get("enabled"), Some("1"));
    }
}
