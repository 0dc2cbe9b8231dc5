//! Image captioning and visual question answering with BLIP.
//!
//! A [`Dispatcher`] owns one engine per [`TaskLabel`] and routes each request to it. Every
//! engine resizes and normalizes the image at its own resolution with the
//! [`ImagePreprocessor`] before running its model. The [`InferenceWorker`] runs requests on a
//! background thread for servers that poll for results.
//!
//! ```no_run
//! use kornia_blip::{Dispatcher, DispatcherConfig, read_image};
//!
//! # fn main() -> Result<(), kornia_blip::BlipError> {
//! let dispatcher = Dispatcher::load(&DispatcherConfig::default())?;
//! let image = read_image("bird.jpg")?;
//! let caption = dispatcher.predict(&image, "Image Captioning", None)?;
//! let question = Some("What color is it?");
//! let answer = dispatcher.predict(&image, "Visual Question Answering", question)?;
//! # Ok(())
//! # }
//! ```

pub mod blip;
pub mod caption;
pub mod dispatcher;
mod error;
pub mod generation;
pub mod loader;
mod model;
pub mod preprocessor;
mod task;
pub mod vqa;
pub mod worker;

pub use caption::{CaptionConfig, CaptionEngine};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::BlipError;
pub use generation::{DecodingConfig, DecodingStrategy};
pub use loader::{DeviceConfig, WeightsSource};
pub use model::Engine;
pub use preprocessor::{
    BLIP_MEAN, BLIP_STD, ImagePreprocessor, NormalizedTensor, RawImage, decode_image, read_image,
};
pub use task::TaskLabel;
pub use vqa::{VqaConfig, VqaEngine};
pub use worker::{InferenceWorker, PredictRequest, PredictResponse, WorkerResult, WorkerState};
