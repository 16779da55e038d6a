// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon/i2c sysfs discovery.
//!
//! Scans `/sys/class/hwmon` and `/sys/bus/i2c/devices` for hardware
//! monitoring controllers and collects their temperature inputs, PWM
//! outputs and fan tachometer inputs. Optional attributes (name,
//! modalias, type, labels) degrade to empty strings; a missing root
//! yields an empty device list, not an error.

use crate::error::Error;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const HWMON_ROOT: &str = "/sys/class/hwmon";
pub const I2C_ROOT: &str = "/sys/bus/i2c/devices";

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A discovered hardware-monitoring controller.
///
/// Immutable after discovery. The `platform` string is the binding key
/// used to match declarative fan/sensor configs to this controller.
#[derive(Debug, Clone)]
pub struct Controller {
    /// Stable identifier, e.g. "nct6798" or "amdgpu-03.0"
    pub identifier: String,
    /// Contents of `device/type`, if any
    pub device_type: String,
    /// Contents of `device/modalias`, if any
    pub modalias: String,
    /// Platform segment of the sysfs path, or the identifier when the
    /// device is not platform-attached
    pub platform: String,
    /// Resolved device directory
    pub path: PathBuf,
    /// Index -> `tempN_input` path
    pub temp_inputs: BTreeMap<u8, PathBuf>,
    /// Index -> `pwmN` path
    pub pwm_outputs: BTreeMap<u8, PathBuf>,
    /// Index -> `fanN_input` path
    pub rpm_inputs: BTreeMap<u8, PathBuf>,
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Enumerates controllers under configurable sysfs roots.
pub struct SysfsProbe {
    hwmon_root: PathBuf,
    i2c_root: PathBuf,
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_roots(HWMON_ROOT, I2C_ROOT)
    }

    /// Probe alternative roots. Tests point this at a temp directory.
    pub fn with_roots(hwmon_root: impl Into<PathBuf>, i2c_root: impl Into<PathBuf>) -> Self {
        Self {
            hwmon_root: hwmon_root.into(),
            i2c_root: i2c_root.into(),
        }
    }

    /// Scan both roots and return every controller that exposes at least
    /// one fan or temperature input.
    pub fn find_controllers(&self) -> Vec<Controller> {
        let hwmon_name = Regex::new("^hwmon").unwrap();
        let i2c_name = Regex::new("^.+-.+$").unwrap();

        let mut device_dirs = list_matching_dirs(&self.hwmon_root, &hwmon_name);
        device_dirs.extend(list_matching_dirs(&self.i2c_root, &i2c_name));

        let mut controllers = Vec::new();
        for dir in device_dirs {
            // hwmon class entries are symlinks into the device tree; the
            // resolved path is what carries the platform/pci segments.
            let path = fs::canonicalize(&dir).unwrap_or(dir);

            let name = read_device_name(&path);
            let identifier = identifier(&path, &name);
            let platform = platform(&path).unwrap_or_else(|| identifier.clone());

            let temp_inputs = find_indexed_children(&path, r"^temp([1-9])_input$");
            let pwm_outputs = find_indexed_children(&path, r"^pwm([1-9])$");
            let rpm_inputs = find_indexed_children(&path, r"^fan([1-9])_input$");

            if temp_inputs.is_empty() && pwm_outputs.is_empty() && rpm_inputs.is_empty() {
                continue;
            }

            controllers.push(Controller {
                identifier,
                device_type: read_string(&path.join("device").join("type")),
                modalias: read_string(&path.join("device").join("modalias")),
                platform,
                path,
                temp_inputs,
                pwm_outputs,
                rpm_inputs,
            });
        }

        controllers.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        controllers
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Compute a stable controller identifier from the device path and name.
///
/// PCI-attached devices get a short slug derived from the last PCI
/// address in the path, e.g. `0000:03:00.0` -> "03.0", so that two
/// cards driven by the same module stay distinguishable.
pub fn identifier(path: &Path, name: &str) -> String {
    let mut id = name.trim().to_string();
    if id.is_empty() {
        id = basename(path);
    }

    let path_str = path.to_string_lossy();
    if path_str.contains("/pci") {
        let pci = Regex::new(r"\w+:\w{2}:\w{2}\.\d").unwrap();
        if let Some(m) = pci.find_iter(&path_str).last() {
            if let Some(slug) = short_pci_slug(m.as_str()) {
                id = format!("{id}-{slug}");
            }
        }
    }

    id
}

/// Reduce a full PCI address to "<bus>.<function>".
fn short_pci_slug(address: &str) -> Option<String> {
    let mut parts = address.rsplit(':');
    let devfn = parts.next()?;
    let bus = parts.next()?;
    let function = devfn.split('.').nth(1)?;
    Some(format!("{bus}.{function}"))
}

/// Extract the platform segment from a device path, e.g.
/// ".../devices/platform/nct6775.656/hwmon/hwmon2" -> "nct6775.656".
pub fn platform(path: &Path) -> Option<String> {
    let re = Regex::new(r".*/platform/([^/]+)/.*").unwrap();
    re.captures(&path.to_string_lossy())
        .map(|c| c[1].to_string())
}

// ---------------------------------------------------------------------------
// Attribute reads
// ---------------------------------------------------------------------------

/// Read a sysfs attribute, trimming trailing whitespace. Missing or
/// unreadable files come back as the empty string.
pub fn read_string(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Read a sysfs attribute that must hold an ASCII integer. Unlike the
/// optional attributes above, failures here are surfaced to the caller.
pub fn read_integer(path: &Path) -> Result<i64, Error> {
    let raw = fs::read_to_string(path).map_err(|source| Error::SysfsRead {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim().parse().map_err(|_| Error::SysfsParse {
        path: path.to_path_buf(),
        value: raw.trim().to_string(),
    })
}

/// Write an ASCII integer to a sysfs attribute.
pub fn write_integer(path: &Path, value: i64) -> Result<(), Error> {
    fs::write(path, value.to_string()).map_err(|source| Error::SysfsWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// The device `name` attribute, falling back to the directory basename.
fn read_device_name(path: &Path) -> String {
    let name = read_string(&path.join("name"));
    if name.is_empty() {
        basename(path)
    } else {
        name
    }
}

/// Read the `_label` sibling of an input file: `temp1_input` ->
/// `temp1_label`, `fan2_input` -> `fan2_label`. Falls back to the input
/// file's stem when no label is exported.
pub fn read_label(input_path: &Path) -> String {
    let file = basename(input_path);
    let stem = file.strip_suffix("input").unwrap_or(&file);
    let label_file = format!("{stem}label");
    let label = read_string(&input_path.with_file_name(label_file));
    if label.is_empty() {
        file.strip_suffix("_input").unwrap_or(&file).to_string()
    } else {
        label
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn list_matching_dirs(root: &Path, pattern: &Regex) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| pattern.is_match(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}

/// Find children of `dir` matching `pattern` (with a single numeric
/// capture group) and map index -> path, ascending.
fn find_indexed_children(dir: &Path, pattern: &str) -> BTreeMap<u8, PathBuf> {
    let re = Regex::new(pattern).unwrap();
    let mut map = BTreeMap::new();

    let Ok(entries) = fs::read_dir(dir) else {
        return map;
    };
    for entry in entries.flatten() {
        let file = entry.file_name().to_string_lossy().to_string();
        if let Some(caps) = re.captures(&file) {
            if let Ok(index) = caps[1].parse::<u8>() {
                map.insert(index, entry.path());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_identifier_plain_name() {
        assert_eq!(
            identifier(Path::new("/sys/devices/platform/nct6775.656"), "nct6798"),
            "nct6798"
        );
    }

    #[test]
    fn test_identifier_falls_back_to_basename() {
        assert_eq!(
            identifier(Path::new("/sys/class/hwmon/hwmon4"), ""),
            "hwmon4"
        );
    }

    #[test]
    fn test_identifier_pci_slug() {
        let path = Path::new("/sys/devices/pci0000:00/0000:00:03.1/0000:03:00.0/hwmon/hwmon3");
        assert_eq!(identifier(path, "amdgpu"), "amdgpu-03.0");
    }

    #[test]
    fn test_platform_segment() {
        let path = Path::new("/sys/devices/platform/nct6775.656/hwmon/hwmon2");
        assert_eq!(platform(path).as_deref(), Some("nct6775.656"));
        assert_eq!(platform(Path::new("/sys/class/hwmon/hwmon0")), None);
    }

    #[test]
    fn test_probe_collects_indexed_children() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("hwmon0");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("name"), "mockchip\n").unwrap();
        fs::write(dev.join("pwm1"), "128\n").unwrap();
        fs::write(dev.join("pwm2"), "255\n").unwrap();
        fs::write(dev.join("fan1_input"), "900\n").unwrap();
        fs::write(dev.join("fan2_input"), "1200\n").unwrap();
        fs::write(dev.join("temp1_input"), "42000\n").unwrap();
        fs::write(dev.join("temp1_label"), "CPU\n").unwrap();

        let probe = SysfsProbe::with_roots(tmp.path(), tmp.path().join("missing-i2c"));
        let controllers = probe.find_controllers();
        assert_eq!(controllers.len(), 1);

        let c = &controllers[0];
        assert_eq!(c.identifier, "mockchip");
        assert_eq!(c.platform, "mockchip");
        assert_eq!(c.pwm_outputs.len(), 2);
        assert_eq!(c.rpm_inputs.len(), 2);
        assert_eq!(c.temp_inputs.len(), 1);
        assert_eq!(read_label(&c.temp_inputs[&1]), "CPU");
        assert_eq!(read_label(&c.rpm_inputs[&2]), "fan2");
    }

    #[test]
    fn test_missing_roots_yield_empty_list() {
        let probe = SysfsProbe::with_roots("/nonexistent/hwmon", "/nonexistent/i2c");
        assert!(probe.find_controllers().is_empty());
    }
}
