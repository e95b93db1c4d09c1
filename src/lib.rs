//! imageforge customizes a pre-built Linux disk image from a declarative
//! configuration: it installs and removes packages, writes files, runs
//! confined scripts, edits the bootloader command line, declares
//! OverlayFS mounts, and emits the result in a requested image format.
//!
//! The engine opens the image through a loopback device, mounts its
//! partitions into a chroot, applies the mutations in a fixed order, and
//! releases every acquired resource in reverse order on every exit path.

pub mod bootloader;
pub mod chroot;
pub mod common;
pub mod config;
pub mod customizer;
pub mod disk;
pub mod fstab;
pub mod grub;
pub mod image;
pub mod mount;
pub mod overlays;
pub mod packages;
pub mod process;
pub mod repofile;
pub mod rpmsources;
pub mod users;
