//! Host platform detection.

use std::{fs, path::Path};

/// Whether the host is an NVIDIA Jetson board.
pub fn is_jetson() -> bool {
    is_jetson_at(Path::new("/"))
}

/// Jetson check against a filesystem rooted at `root`: the L4T release file, the device-tree
/// model name, or a `tegra` kernel.
pub fn is_jetson_at(root: &Path) -> bool {
    if root.join("etc/nv_tegra_release").exists() {
        return true;
    }
    let contains = |path: &str, needle: &str| {
        fs::read_to_string(root.join(path))
            .map(|text| text.to_lowercase().contains(needle))
            .unwrap_or(false)
    };
    contains("proc/device-tree/model", "jetson")
        || contains("proc/sys/kernel/osrelease", "tegra")
        || contains("proc/version", "tegra")
}
