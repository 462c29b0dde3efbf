//! pdsn-core: pairwise occluded-face verification.
//!
//! Faces are found by an ONNX detector, embedded by an ArcFace-family ONNX
//! backbone, and compared through a Siamese difference-mask branch whose
//! weights live on the Rust side so they can be trained and checkpointed.

pub mod alignment;
pub mod backbone;
pub mod checkpoint;
pub mod detector;
pub mod layers;
pub mod mask;
pub mod model;
pub mod params;
pub mod session;
pub mod types;

pub use backbone::{Backbone, BackboneConfig, NetMode};
pub use detector::{DetectorConfig, FaceDetector};
pub use layers::Mode;
pub use mask::{DiffMask, DiffMaskConfig, DiffMaskOutput};
pub use model::{select_faces, BioPdsn, CropConfig, PdsnWeights, PipelineError};
pub use params::{Module, Parameter, StateDict};
pub use session::Device;
pub use types::{BoundingBox, Embedding, FaceInput, PairVerdict};
