//! FloodNet-style dataset, batcher and data loaders.
//!
//! Samples live under `<root>/<split>/<split>-org-img/<stem>.jpg` with single-channel label
//! maps at `<root>/<split>/<split>-label-img/<stem>_lab.png`. Items are returned as raw host
//! data; the batcher builds device tensors.
//!
//! A sample that fails to decode still yields an item, zero-filled and carrying the decode
//! error, so the loader keeps iterating and [`SegmentationBatch::validate`] reports the failure.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion, TensorData},
};
use image::imageops::FilterType;
use walkdir::WalkDir;

use crate::{
    config::TrainingConfig,
    error::{FloodSegError, FloodSegResult},
    losses::IGNORE_INDEX,
};

pub const SPLITS: [&str; 3] = ["train", "val", "test"];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn dataset_error(message: impl Into<String>) -> FloodSegError {
    FloodSegError::DatasetError {
        message: message.into(),
    }
}

/// One decoded and resized sample.
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    /// RGB values in `[0, 1]`, `[H, W, 3]` row-major.
    pub image: Vec<f32>,
    /// Class index per pixel, `[H, W]` row-major.
    pub mask: Vec<i64>,
    pub height: usize,
    pub width: usize,
    /// Set when the files could not be decoded.
    pub error: Option<String>,
}

impl SegmentationItem {
    /// Zero-filled `size x size` stand-in for a sample that failed to decode.
    pub fn failed(size: usize, error: String) -> Self {
        Self {
            image: vec![0.0; size * size * 3],
            mask: vec![0; size * size],
            height: size,
            width: size,
            error: Some(error),
        }
    }
}

/// Batched images `[B, 3, H, W]` and class maps `[B, H, W]`.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 3, Int>,
    /// Decode errors of the items in this batch.
    pub errors: Vec<String>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub fn new(images: Tensor<B, 4>, masks: Tensor<B, 3, Int>) -> Self {
        Self {
            images,
            masks,
            errors: Vec::new(),
        }
    }

    /// Checks decode status, shapes and label values; a malformed batch is fatal.
    pub fn validate(&self, num_classes: usize) -> FloodSegResult<()> {
        if let Some(first) = self.errors.first() {
            return Err(dataset_error(format!(
                "{} sample(s) failed to decode: {first}",
                self.errors.len()
            )));
        }

        let [b, c, h, w] = self.images.dims();
        if c != 3 {
            return Err(FloodSegError::InvalidTensorShape {
                expected: "[B, 3, H, W] images".into(),
                actual: format!("{:?}", [b, c, h, w]),
            });
        }
        let mask_dims = self.masks.dims();
        if mask_dims != [b, h, w] {
            return Err(FloodSegError::InvalidTensorShape {
                expected: format!("{:?} labels", [b, h, w]),
                actual: format!("{mask_dims:?}"),
            });
        }

        let masks = self.masks.clone();
        let out_of_range = masks
            .clone()
            .greater_equal_elem(num_classes as i64)
            .bool_and(masks.clone().not_equal_elem(IGNORE_INDEX))
            .bool_or(masks.lower_elem(0));
        let invalid: i64 = out_of_range.int().sum().into_scalar().elem();
        if invalid > 0 {
            return Err(dataset_error(format!(
                "{invalid} label values outside [0, {num_classes}) and not {IGNORE_INDEX}"
            )));
        }
        Ok(())
    }
}

/// Stacks items on a device, optionally applying ImageNet normalization.
#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    imagenet_norm: bool,
    _phantom: PhantomData<B>,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub const fn new(imagenet_norm: bool) -> Self {
        Self {
            imagenet_norm,
            _phantom: PhantomData,
        }
    }
}

/// Per-channel `(x - mean) / std` on `[B, 3, H, W]`.
pub fn imagenet_normalize<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());
        let mut errors = Vec::new();

        for item in items {
            if let Some(error) = item.error {
                errors.push(error);
            }
            let image = Tensor::<B, 3>::from_data(
                TensorData::new(item.image, [item.height, item.width, 3]),
                device,
            )
            .permute([2, 0, 1]);
            let mask = Tensor::<B, 2, Int>::from_data(
                TensorData::new(item.mask, [item.height, item.width]),
                device,
            );
            images.push(image);
            masks.push(mask);
        }

        let images = Tensor::stack(images, 0);
        let images = if self.imagenet_norm {
            imagenet_normalize(images)
        } else {
            images
        };

        SegmentationBatch {
            images,
            masks: Tensor::stack(masks, 0),
            errors,
        }
    }
}

/// Image/label pairs of one split, resized to a square side on load.
#[derive(Debug)]
pub struct SegmentationDataset {
    samples: Vec<(PathBuf, PathBuf)>,
    image_size: u32,
}

impl SegmentationDataset {
    /// Scans `<root>/<split>`. With `strict`, an image without a label is an error; otherwise
    /// it is skipped with a warning.
    pub fn new(root: impl AsRef<Path>, split: &str, image_size: usize, strict: bool) -> FloodSegResult<Self> {
        if !SPLITS.contains(&split) {
            return Err(dataset_error(format!(
                "split must be one of {SPLITS:?}, got '{split}'"
            )));
        }
        let split_dir = root.as_ref().join(split);
        let image_dir = split_dir.join(format!("{split}-org-img"));
        let label_dir = split_dir.join(format!("{split}-label-img"));
        for dir in [&image_dir, &label_dir] {
            if !dir.is_dir() {
                return Err(dataset_error(format!("directory not found: {}", dir.display())));
            }
        }

        let mut images: Vec<PathBuf> = WalkDir::new(&image_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .map(walkdir::DirEntry::into_path)
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"))
            })
            .collect();
        images.sort();

        let mut samples = Vec::with_capacity(images.len());
        for image in images {
            let Some(stem) = image.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let label = label_dir.join(format!("{stem}_lab.png"));
            if label.is_file() {
                samples.push((image, label));
            } else if strict {
                return Err(dataset_error(format!(
                    "missing label for {}: expected {}",
                    image.display(),
                    label.display()
                )));
            } else {
                tracing::warn!(image = %image.display(), "no label found, skipping sample");
            }
        }

        if samples.is_empty() {
            return Err(dataset_error(format!("no samples found in {}", image_dir.display())));
        }
        tracing::info!(split, samples = samples.len(), dir = %image_dir.display(), "dataset scanned");

        let image_size = u32::try_from(image_size)
            .map_err(|_| dataset_error(format!("image size {image_size} is too large")))?;
        Ok(Self {
            samples,
            image_size,
        })
    }

    pub fn samples(&self) -> &[(PathBuf, PathBuf)] {
        &self.samples
    }

    fn load(&self, image_path: &Path, label_path: &Path) -> Result<SegmentationItem, image::ImageError> {
        let size = self.image_size;
        let image = image::open(image_path)?
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb32f();
        let label = image::open(label_path)?.to_luma8();
        let label = image::imageops::resize(&label, size, size, FilterType::Nearest);

        Ok(SegmentationItem {
            image: image.into_raw(),
            mask: label.into_raw().into_iter().map(i64::from).collect(),
            height: size as usize,
            width: size as usize,
            error: None,
        })
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        let (image_path, label_path) = self.samples.get(index)?;
        let item = self.load(image_path, label_path).unwrap_or_else(|err| {
            tracing::error!(image = %image_path.display(), error = %err, "failed to decode sample");
            SegmentationItem::failed(
                self.image_size as usize,
                format!("{}: {err}", image_path.display()),
            )
        });
        Some(item)
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Shuffled training loader on the autodiff backend.
pub fn train_loader<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> FloodSegResult<Arc<dyn DataLoader<B, SegmentationBatch<B>>>> {
    let dataset = SegmentationDataset::new(&config.root, "train", config.image_size, config.strict_pairs)?;
    let builder = DataLoaderBuilder::new(SegmentationBatcher::<B>::new(config.imagenet_norm))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .set_device(device.clone());
    Ok(with_workers(builder, config.num_workers).build(dataset))
}

/// Fixed-order loader of `split` on the inference backend, at half the training batch size.
pub fn eval_loader<B: Backend>(
    config: &TrainingConfig,
    split: &str,
    device: &B::Device,
) -> FloodSegResult<Arc<dyn DataLoader<B, SegmentationBatch<B>>>> {
    let dataset = SegmentationDataset::new(&config.root, split, config.image_size, config.strict_pairs)?;
    let builder = DataLoaderBuilder::new(SegmentationBatcher::<B>::new(config.imagenet_norm))
        .batch_size(config.validation_batch_size())
        .set_device(device.clone());
    Ok(with_workers(builder, config.num_workers).build(dataset))
}

/// Zero workers loads batches on the calling thread.
fn with_workers<B: Backend>(
    builder: DataLoaderBuilder<B, SegmentationItem, SegmentationBatch<B>>,
    num_workers: usize,
) -> DataLoaderBuilder<B, SegmentationItem, SegmentationBatch<B>> {
    if num_workers > 0 {
        builder.num_workers(num_workers)
    } else {
        builder
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use burn::backend::NdArray;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    type TestBackend = NdArray;

    fn write_sample(root: &Path, split: &str, stem: &str, label: Option<u8>) {
        let image_dir = root.join(split).join(format!("{split}-org-img"));
        let label_dir = root.join(split).join(format!("{split}-label-img"));
        fs::create_dir_all(&image_dir).unwrap();
        fs::create_dir_all(&label_dir).unwrap();

        RgbImage::from_pixel(12, 10, Rgb([200, 100, 50]))
            .save(image_dir.join(format!("{stem}.jpg")))
            .unwrap();
        if let Some(value) = label {
            GrayImage::from_pixel(12, 10, Luma([value]))
                .save(label_dir.join(format!("{stem}_lab.png")))
                .unwrap();
        }
    }

    #[test]
    fn scans_pairs_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "train", "7", Some(1));
        write_sample(dir.path(), "train", "10", Some(2));

        let dataset = SegmentationDataset::new(dir.path(), "train", 8, true).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.samples()[0].0.ends_with("10.jpg"));

        let item = dataset.get(1).unwrap();
        assert_eq!((item.height, item.width), (8, 8));
        assert_eq!(item.image.len(), 8 * 8 * 3);
        assert!(item.mask.iter().all(|&v| v == 1));
        assert!(item.image.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn missing_label_is_strict_error_or_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "val", "1", Some(0));
        write_sample(dir.path(), "val", "2", None);

        assert!(SegmentationDataset::new(dir.path(), "val", 8, true).is_err());
        let lenient = SegmentationDataset::new(dir.path(), "val", 8, false).unwrap();
        assert_eq!(lenient.len(), 1);
    }

    #[test]
    fn rejects_bad_split_and_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SegmentationDataset::new(dir.path(), "holdout", 8, true).is_err());
        assert!(SegmentationDataset::new(dir.path(), "train", 8, true).is_err());
    }

    #[test]
    fn batcher_stacks_and_normalizes() {
        let device = Default::default();
        let item = SegmentationItem {
            image: vec![0.5; 4 * 4 * 3],
            mask: vec![1; 16],
            height: 4,
            width: 4,
            error: None,
        };

        let batch: SegmentationBatch<TestBackend> =
            SegmentationBatcher::new(true).batch(vec![item.clone(), item], &device);

        assert_eq!(batch.images.dims(), [2, 3, 4, 4]);
        assert_eq!(batch.masks.dims(), [2, 4, 4]);
        let first: Vec<f32> = batch.images.clone().slice([0..1, 0..1, 0..1, 0..1]).into_data().to_vec().unwrap();
        assert!((first[0] - (0.5 - 0.485) / 0.229).abs() < 1e-5);
        assert!(batch.validate(2).is_ok());
    }

    #[test]
    fn validation_flags_out_of_range_labels() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);

        let ok = SegmentationBatch::new(
            images.clone(),
            Tensor::<TestBackend, 3, Int>::from_ints([[[0, 1], [255, 1]]], &device),
        );
        assert!(ok.validate(2).is_ok());

        let bad = SegmentationBatch::new(
            images.clone(),
            Tensor::<TestBackend, 3, Int>::from_ints([[[0, 2], [0, 0]]], &device),
        );
        assert!(bad.validate(2).is_err());

        let wrong_shape = SegmentationBatch::new(
            images,
            Tensor::<TestBackend, 3, Int>::zeros([1, 3, 2], &device),
        );
        assert!(wrong_shape.validate(2).is_err());
    }

    fn write_corrupt_image(root: &Path, split: &str, stem: &str) {
        let image_dir = root.join(split).join(format!("{split}-org-img"));
        let label_dir = root.join(split).join(format!("{split}-label-img"));
        fs::write(image_dir.join(format!("{stem}.jpg")), b"not a jpeg").unwrap();
        GrayImage::from_pixel(12, 10, Luma([0]))
            .save(label_dir.join(format!("{stem}_lab.png")))
            .unwrap();
    }

    #[test]
    fn corrupt_sample_keeps_iteration_going_and_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "train", "b", Some(1));
        write_sample(dir.path(), "train", "c", Some(0));
        write_corrupt_image(dir.path(), "train", "a");

        let dataset = SegmentationDataset::new(dir.path(), "train", 8, true).unwrap();
        assert_eq!(dataset.len(), 3);
        let items: Vec<SegmentationItem> = dataset.iter().collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].error.as_deref().is_some_and(|err| err.contains("a.jpg")));
        assert!(items[1].error.is_none());

        let device = Default::default();
        let batch: SegmentationBatch<TestBackend> = SegmentationBatcher::new(false).batch(items, &device);
        let err = batch.validate(2).unwrap_err();
        assert!(matches!(err, FloodSegError::DatasetError { .. }));
    }

    #[test]
    fn loader_yields_every_batch_with_a_corrupt_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "val", "b", Some(1));
        write_sample(dir.path(), "val", "c", Some(0));
        write_corrupt_image(dir.path(), "val", "a");

        let config = TrainingConfig::new()
            .with_root(dir.path().to_string_lossy().into_owned())
            .with_image_size(8)
            .with_batch_size(2)
            .with_num_workers(0);
        let loader = eval_loader::<TestBackend>(&config, "val", &Default::default()).unwrap();

        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 3);
        assert!(batches[0].validate(2).is_err());
        assert!(batches[1].validate(2).is_ok());
    }
}
