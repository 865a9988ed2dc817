mod blocks;
mod encoder;
mod head;
mod neck;
mod segmenter;

pub use blocks::{normalize_layout, resize, ConvNormAct, ConvNormActConfig, ResizeMode, NORM_GROUPS};
pub use encoder::{
    stem_depth, BackboneEncoderConfig, EncoderKind, FeatureExtractor, VanillaEncoder,
    VanillaEncoderConfig,
};
pub use head::{Aspp, AsppConfig, SegmentationHead, SegmentationHeadConfig};
pub use neck::{FpnNeck, FpnNeckConfig};
pub use segmenter::{SegmentationModel, SegmentationModelConfig, SegmentationModelRecord};
