use crate::BlipError;
use candle_core::{Device, Tensor};
use image::{RgbImage, imageops::FilterType};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use std::path::Path;

/// An rgb8 image of arbitrary size with shape [H, W, 3].
pub type RawImage = Image<u8, 3, CpuAllocator>;

/// Per-channel mean the BLIP vision encoders were trained with.
pub const BLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
/// Per-channel standard deviation the BLIP vision encoders were trained with.
pub const BLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// A normalized image tensor with shape [1, R, R, 3].
///
/// Built fresh for every request since the resolution depends on the engine consuming it.
#[derive(Debug, Clone)]
pub struct NormalizedTensor(Tensor);

impl NormalizedTensor {
    /// Side of the square image in pixels.
    pub fn resolution(&self) -> usize {
        self.0.dims()[1]
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    /// Returns the tensor in the channels-first [1, 3, R, R] layout the vision encoder expects.
    pub fn pixel_values(&self, device: &Device) -> candle_core::Result<Tensor> {
        self.0.permute((0, 3, 1, 2))?.contiguous()?.to_device(device)
    }
}

/// Resizes and normalizes images for the BLIP vision encoders.
#[derive(Clone, Debug)]
pub struct ImagePreprocessor {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub filter: FilterType,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            mean: BLIP_MEAN,
            std: BLIP_STD,
            filter: FilterType::CatmullRom,
        }
    }
}

impl ImagePreprocessor {
    /// Normalize an image into a tensor of shape [1, resolution, resolution, 3].
    ///
    /// The image is resized to a square with a bicubic filter, ignoring its aspect ratio,
    /// scaled to [0, 1] and normalized per channel with `(x - mean) / std`.
    ///
    /// # Arguments
    ///
    /// * `image` - The rgb8 image with shape [H, W, 3].
    /// * `resolution` - The side of the output square.
    pub fn normalize(
        &self,
        image: &RawImage,
        resolution: usize,
    ) -> Result<NormalizedTensor, BlipError> {
        if resolution == 0 {
            return Err(BlipError::InvalidImage(
                "target resolution must be positive".to_string(),
            ));
        }

        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(BlipError::InvalidImage(format!(
                "empty image of size {width}x{height}"
            )));
        }

        let rgb = RgbImage::from_raw(width as u32, height as u32, image.as_slice().to_vec())
            .ok_or_else(|| {
                BlipError::InvalidImage(format!("pixel buffer does not match {width}x{height}x3"))
            })?;

        let side = resolution as u32;
        let resized = image::imageops::resize(&rgb, side, side, self.filter);

        let (mean, std) = (self.mean, self.std);
        let data = resized
            .as_raw()
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = i % 3;
                (v as f32 / 255.0 - mean[c]) / std[c]
            })
            .collect::<Vec<f32>>();

        let tensor = Tensor::from_vec(data, (1, resolution, resolution, 3), &Device::Cpu)?;

        Ok(NormalizedTensor(tensor))
    }
}

/// Decode an encoded image (png, jpeg, ...) into an rgb8 image.
///
/// Fails with [`BlipError::InvalidImage`] when the bytes cannot be decoded or the
/// source has fewer than three color channels. Alpha is dropped.
pub fn decode_image(bytes: &[u8]) -> Result<RawImage, BlipError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| BlipError::InvalidImage(e.to_string()))?;

    let channels = decoded.color().channel_count();
    if channels < 3 {
        return Err(BlipError::InvalidImage(format!(
            "expected a color image, got {channels} channel(s)"
        )));
    }

    let rgb = decoded.to_rgb8();
    let size = ImageSize {
        width: rgb.width() as usize,
        height: rgb.height() as usize,
    };

    Image::new(size, rgb.into_raw(), CpuAllocator)
        .map_err(|e| BlipError::InvalidImage(e.to_string()))
}

/// Read and decode an image file.
pub fn read_image(path: impl AsRef<Path>) -> Result<RawImage, BlipError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| BlipError::InvalidImage(format!("{}: {e}", path.display())))?;
    decode_image(&bytes)
}
