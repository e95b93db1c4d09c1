//! Validation tests for the customization config document.

use imageforge::config::Config;

fn parse(yaml: &str) -> Config {
    Config::from_yaml(yaml).unwrap()
}

fn parse_and_validate(yaml: &str) -> anyhow::Result<()> {
    parse(yaml).is_valid()
}

const VALID_STORAGE: &str = r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 4096
      partitions:
        - id: esp
          start: 1
          size: 8
          bootPartitionType: esp
        - id: rootfs
          start: 9
  fileSystems:
    - deviceId: esp
      fsType: fat32
      path: /boot/efi
    - deviceId: rootfs
      fsType: ext4
      path: /
os:
  hostname: my-host
"#;

#[test]
fn test_valid_config_passes() {
    parse_and_validate(VALID_STORAGE).unwrap();
}

#[test]
fn test_empty_config_passes() {
    parse_and_validate("{}").unwrap();
}

#[test]
fn test_unknown_top_level_key_is_rejected() {
    let err = Config::from_yaml("bogus: 1\n").unwrap_err();
    assert!(format!("{err:#}").contains("bogus"));
}

#[test]
fn test_storage_requires_exactly_one_disk() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks: []
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("at least 1 disk"));

    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
    - partitionTableType: gpt
      maxSize: 1024
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("multiple disks"));
}

#[test]
fn test_efi_boot_requires_esp_partition() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: rootfs
          start: 1
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("'esp' partition must be provided"));
}

#[test]
fn test_legacy_boot_requires_bios_grub_partition() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: legacy
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: rootfs
          start: 1
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("'bios-grub' partition must be provided"));
}

#[test]
fn test_esp_partition_requires_fat32() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: esp
          start: 1
          size: 8
          bootPartitionType: esp
  fileSystems:
    - deviceId: esp
      fsType: ext4
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("'esp' partition (esp) must use 'fat32'"));
}

#[test]
fn test_file_system_device_id_must_name_a_partition() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: esp
          start: 1
          bootPartitionType: esp
  fileSystems:
    - deviceId: ghost
      fsType: ext4
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("no partition with matching ID (ghost)"));
}

#[test]
fn test_duplicate_file_system_device_ids_are_rejected() {
    let err = parse_and_validate(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: esp
          start: 1
          bootPartitionType: esp
  fileSystems:
    - deviceId: esp
      fsType: fat32
    - deviceId: esp
      fsType: fat32
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("duplicate fileSystems deviceId"));
}

#[test]
fn test_partition_table_type_must_be_gpt() {
    let err = Config::from_yaml(
        r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: mbr
      maxSize: 1024
os: {}
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("mbr"));
}

#[test]
fn test_partition_label_boundaries() {
    let yaml = |label: &str| {
        format!(
            r#"
storage:
  bootType: efi
  disks:
    - partitionTableType: gpt
      maxSize: 1024
      partitions:
        - id: esp
          start: 1
          bootPartitionType: esp
          label: "{label}"
os: {{}}
"#
        )
    };

    parse_and_validate(&yaml(&"a".repeat(35))).unwrap();

    let err = parse_and_validate(&yaml(&"a".repeat(36))).unwrap_err();
    assert!(format!("{err:#}").contains("too long"));

    let err = parse_and_validate(&yaml("caf\u{00e9}")).unwrap_err();
    assert!(format!("{err:#}").contains("ASCII"));
}

#[test]
fn test_hostname_with_underscore_is_rejected() {
    let err = parse_and_validate("os:\n  hostname: my_host\n").unwrap_err();
    assert!(format!("{err:#}").contains("invalid hostname"));
}

#[test]
fn test_kernel_command_line_character_set() {
    for bad in ["a\nb", "a'b", "a\"b", "a\\b", "a$b", "a`b"] {
        let config = Config {
            os: imageforge::config::Os {
                kernel_command_line: imageforge::config::KernelCommandLine {
                    extra_command_line: bad.to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.is_valid().is_err(), "{bad:?}");
    }

    parse_and_validate(
        "os:\n  kernelCommandLine:\n    extraCommandLine: console=tty0 console=ttyS0\n",
    )
    .unwrap();
}

#[test]
fn test_password_requires_value_only_for_value_types() {
    let err = parse_and_validate(
        r#"
os:
  users:
    - name: alice
      password:
        type: plain-text
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("value must not be empty"));

    parse_and_validate(
        r#"
os:
  users:
    - name: alice
      password:
        type: locked
"#,
    )
    .unwrap();
}

#[test]
fn test_password_expiration_boundaries() {
    let yaml = |days: i64| {
        format!(
            "os:\n  users:\n    - name: alice\n      passwordExpiresDays: {days}\n"
        )
    };

    parse_and_validate(&yaml(-1)).unwrap();
    parse_and_validate(&yaml(0)).unwrap();

    let err = parse_and_validate(&yaml(-2)).unwrap_err();
    assert!(format!("{err:#}").contains("passwordExpiresDays"));
}

#[test]
fn test_script_must_be_local_to_config_directory() {
    let err = parse_and_validate(
        "os:\n  postInstallScripts:\n    - path: /usr/bin/evil.sh\n",
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("local to the config directory"));
}

#[test]
fn test_overlay_paths_must_be_absolute() {
    let err = parse_and_validate(
        r#"
os:
  overlays:
    - lower: /usr
      upper: overlays/usr/upper
      work: /overlays/usr/work
      target: /usr
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("must be an absolute path"));
}

#[test]
fn test_selinux_mode_values() {
    for mode in ["default", "disabled", "enforcing", "permissive", "force-enforcing"] {
        parse_and_validate(&format!("os:\n  selinux:\n    mode: {mode}\n")).unwrap();
    }

    let err = Config::from_yaml("os:\n  selinux:\n    mode: strict\n").unwrap_err();
    assert!(format!("{err:#}").contains("strict"));
}

#[test]
fn test_error_names_offending_index() {
    let err = parse_and_validate(
        r#"
os:
  users:
    - name: alice
    - name: ""
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("index 1"));
}
