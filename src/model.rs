use crate::{BlipError, ImagePreprocessor, NormalizedTensor, RawImage};

/// A loaded model bound to one task and one input resolution.
///
/// Engines are immutable after construction and keep no state between calls, so a
/// single instance can serve concurrent requests.
pub trait Engine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Side of the square image the engine consumes.
    fn resolution(&self) -> usize;

    /// The preprocessing applied before [`Engine::infer`].
    fn preprocessor(&self) -> &ImagePreprocessor;

    /// Runs the model on an image already normalized at [`Engine::resolution`].
    fn infer(&self, pixels: &NormalizedTensor, question: Option<&str>)
    -> Result<String, BlipError>;

    /// Normalizes `image` at the engine resolution and runs the model on it.
    fn run(&self, image: &RawImage, question: Option<&str>) -> Result<String, BlipError> {
        let pixels = self.preprocessor().normalize(image, self.resolution())?;
        self.infer(&pixels, question)
    }
}

/// Fails unless `pixels` were normalized at `resolution`.
pub(crate) fn check_resolution(
    pixels: &NormalizedTensor,
    resolution: usize,
) -> Result<(), BlipError> {
    if pixels.resolution() != resolution {
        return Err(BlipError::InvalidImage(format!(
            "expected a {resolution}x{resolution} tensor, got {0}x{0}",
            pixels.resolution()
        )));
    }
    Ok(())
}
