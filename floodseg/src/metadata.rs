//! Label names, palettes and default locations of the supported datasets.

use std::collections::BTreeMap;

use crate::error::{FloodSegError, FloodSegResult};

/// Static description of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetMetadata {
    pub key: &'static str,
    pub default_root: &'static str,
    /// Class names indexed by class id.
    pub labels: &'static [&'static str],
    /// Display colour per class id.
    pub palette: &'static [[u8; 3]],
}

impl DatasetMetadata {
    pub const fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn id2label(&self) -> BTreeMap<usize, &'static str> {
        self.labels.iter().copied().enumerate().collect()
    }
}

const FLOODNET: DatasetMetadata = DatasetMetadata {
    key: "floodnet",
    default_root: "FloodNet-Supervised_v1.0",
    labels: &[
        "Background",
        "Building-flooded",
        "Building-non-flooded",
        "Road-flooded",
        "Road-non-flooded",
        "Water",
        "Tree",
        "Vehicle",
        "Pool",
        "Grass",
    ],
    palette: &[
        [0, 0, 0],
        [255, 0, 0],
        [255, 165, 0],
        [0, 0, 255],
        [135, 206, 235],
        [0, 255, 255],
        [34, 139, 34],
        [255, 255, 0],
        [255, 0, 255],
        [124, 252, 0],
    ],
};

const RESCUENET: DatasetMetadata = DatasetMetadata {
    key: "rescuenet",
    default_root: "RescueNet",
    labels: &[
        "Background",
        "Water",
        "Building-No-Damage",
        "Building-Minor-Damage",
        "Building-Major-Damage",
        "Building-Total-Destruction",
        "Vehicle",
        "Road-Clear",
        "Road-Blocked",
        "Tree",
        "Pool",
    ],
    palette: &[
        [0, 0, 0],
        [0, 0, 255],
        [0, 200, 0],
        [255, 255, 0],
        [255, 165, 0],
        [255, 0, 0],
        [0, 255, 255],
        [169, 169, 169],
        [238, 130, 238],
        [34, 139, 34],
        [0, 128, 255],
    ],
};

const CATALOG: &[DatasetMetadata] = &[FLOODNET, RESCUENET];

/// Catalogued dataset keys, sorted.
pub fn list_datasets() -> Vec<&'static str> {
    let mut keys: Vec<_> = CATALOG.iter().map(|meta| meta.key).collect();
    keys.sort_unstable();
    keys
}

/// Looks up a dataset by key, ignoring case.
pub fn dataset_metadata(key: &str) -> FloodSegResult<&'static DatasetMetadata> {
    let needle = key.to_lowercase();
    CATALOG
        .iter()
        .find(|meta| meta.key == needle)
        .ok_or_else(|| FloodSegError::UnknownDataset {
            name: key.to_string(),
            available: list_datasets().join(", "),
        })
}

pub fn id2label(key: &str) -> FloodSegResult<BTreeMap<usize, &'static str>> {
    dataset_metadata(key).map(DatasetMetadata::id2label)
}

pub fn palette(key: &str) -> FloodSegResult<&'static [[u8; 3]]> {
    dataset_metadata(key).map(|meta| meta.palette)
}

pub fn num_classes(key: &str) -> FloodSegResult<usize> {
    dataset_metadata(key).map(DatasetMetadata::num_classes)
}
