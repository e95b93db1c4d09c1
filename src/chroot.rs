//! Confined invocation of host binaries against a staged image root.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, CommandResult};

/// A filesystem subtree treated as the root for confined command
/// execution. The lifecycle of the tree itself (mounts, teardown) is
/// owned by [`crate::image::ImageConnection`]; this type only resolves
/// paths and runs commands.
pub struct Chroot {
    root_dir: PathBuf,
}

impl Chroot {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolve an absolute in-image path to its location on the host.
    pub fn host_path(&self, inner: impl AsRef<Path>) -> PathBuf {
        let inner = inner.as_ref();
        let relative = inner.strip_prefix("/").unwrap_or(inner);
        self.root_dir.join(relative)
    }

    fn cmd(&self, program: &str, args: &[&str]) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&self.root_dir)
            .arg(program)
            .args(args.iter().copied())
    }

    /// Run a command inside the image root, capturing its output.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        self.cmd(program, args).run()
    }

    /// Run a command inside the image root without failing on a non-zero
    /// exit; the caller inspects the result.
    pub fn run_unchecked(&self, program: &str, args: &[&str]) -> Result<CommandResult> {
        self.cmd(program, args).allow_fail().run()
    }

    /// Run a command inside the image root, streaming output to the log
    /// sink.
    pub fn run_live(&self, squash_errors: bool, program: &str, args: &[&str]) -> Result<()> {
        self.cmd(program, args).run_live(squash_errors)
    }

    /// Run a command inside the image root, handing each stdout line to
    /// `on_stdout`.
    pub fn run_live_filtered(
        &self,
        program: &str,
        args: &[&str],
        on_stdout: impl FnMut(&str),
    ) -> Result<()> {
        self.cmd(program, args).run_live_filtered(false, on_stdout)
    }

    /// Run a single shell command string inside the image root, streaming
    /// its output. The only place where a caller-assembled string reaches
    /// a shell.
    pub fn run_shell(&self, command: &str) -> Result<()> {
        Cmd::new("chroot")
            .arg_path(&self.root_dir)
            .args(["sh", "-c"])
            .arg(command)
            .run_live(false)
    }
}
