pub mod device_map;
pub mod error;
pub mod loader;
pub mod mask;
pub mod models;
pub mod pipeline;
pub mod pose;
pub mod preprocess;
pub mod prompt;
pub mod registry;
pub mod request;
pub mod scheduler;
mod util;

pub use device_map::*;
pub use error::{Result, TryOnError};
pub use loader::*;
pub use registry::{ModelRegistry, TryOnLoader};
pub use request::*;
pub use util::{decode_image, encode_data_uri, select_best_device};

/// Width of the canvas every image is normalized to before a model sees it.
pub const WORKING_WIDTH: u32 = 768;
/// Height of the canvas every image is normalized to before a model sees it.
pub const WORKING_HEIGHT: u32 = 1024;

/// Reduced resolution consumed by the pose, parsing and dense-pose models.
pub const AUX_WIDTH: u32 = 384;
pub const AUX_HEIGHT: u32 = 512;

/// A loaded try-on model stack that can serve requests.
///
/// Implementations must be safe to call from several requests at once; they
/// are shared read-only between handlers.
pub trait TryOnModel: Send + Sync {
    fn run(&self, input: TryOnInput) -> Result<TryOnOutput>;
}
