use crate::{
    BlipError, ImagePreprocessor, NormalizedTensor, RawImage,
    blip::{BlipCaptioner, BlipConfig, SpecialTokens},
    generation::{DecodingConfig, generate},
    loader::WeightsSource,
    model::{Engine, check_resolution},
};
use candle_core::{DType, Device};
use tokenizers::Tokenizer;

/// Configuration of the [`CaptionEngine`].
#[derive(Clone, Debug, PartialEq)]
pub struct CaptionConfig {
    pub weights: WeightsSource,
    /// Side of the square image fed to the vision encoder.
    pub resolution: usize,
    pub decoding: DecodingConfig,
    /// Text the decoder is primed with, stripped from the returned caption.
    pub prompt: String,
    pub tokens: SpecialTokens,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            weights: WeightsSource::hub("Salesforce/blip-image-captioning-base"),
            resolution: 384,
            decoding: DecodingConfig::caption(),
            prompt: "a picture of ".to_string(),
            tokens: SpecialTokens::default(),
        }
    }
}

/// Describes an image in one English sentence.
pub struct CaptionEngine {
    model: BlipCaptioner,
    tokenizer: Tokenizer,
    preprocessor: ImagePreprocessor,
    prefix: Vec<u32>,
    decoding: DecodingConfig,
    tokens: SpecialTokens,
    resolution: usize,
    device: Device,
    dtype: DType,
}

impl CaptionEngine {
    /// Build the engine from an already loaded model.
    ///
    /// The decoder prefix is the `bos` token followed by the tokenized prompt. A prompt the
    /// tokenizer cannot encode makes the model unavailable.
    pub fn new(
        model: BlipCaptioner,
        tokenizer: Tokenizer,
        config: &CaptionConfig,
        device: Device,
        dtype: DType,
    ) -> Result<Self, BlipError> {
        let prompt = tokenizer
            .encode(config.prompt.as_str(), false)
            .map_err(|e| BlipError::model_unavailable(&config.weights, e))?;
        let prefix = std::iter::once(config.tokens.bos)
            .chain(prompt.get_ids().iter().copied())
            .collect();

        Ok(Self {
            model,
            tokenizer,
            preprocessor: ImagePreprocessor::default(),
            prefix,
            decoding: config.decoding.clone(),
            tokens: config.tokens,
            resolution: config.resolution,
            device,
            dtype,
        })
    }

    /// Resolve the weights of `config` and load the base architecture on `device`.
    pub fn load(config: &CaptionConfig, device: &Device, dtype: DType) -> Result<Self, BlipError> {
        let weights = config.weights.resolve()?;
        let tokenizer = weights.tokenizer()?;
        let vb = weights.var_builder(dtype, device)?;
        let model = BlipCaptioner::new(&BlipConfig::base(), config.resolution, vb)
            .map_err(|e| BlipError::model_unavailable(&config.weights, e))?;

        log::info!("Caption model loaded from {}", config.weights);

        Self::new(model, tokenizer, config, device.clone(), dtype)
    }

    /// Caption an image of any size.
    pub fn caption(&self, image: &RawImage) -> Result<String, BlipError> {
        self.run(image, None)
    }
}

impl Engine for CaptionEngine {
    fn name(&self) -> &str {
        "caption"
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    fn infer(
        &self,
        pixels: &NormalizedTensor,
        _question: Option<&str>,
    ) -> Result<String, BlipError> {
        check_resolution(pixels, self.resolution)?;

        let pixel_values = pixels.pixel_values(&self.device)?.to_dtype(self.dtype)?;
        let image_embeds = self.model.encode_image(&pixel_values)?;
        let decoder = self.model.text_decoder().conditioned(&image_embeds);

        let tokens = generate(
            &decoder,
            &self.prefix,
            &self.decoding,
            self.tokens.sep,
            &self.device,
        )?;

        let caption = self.tokenizer.decode(&tokens, true)?;
        Ok(caption.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blip::testing::{tiny_config, tiny_tokenizer, tiny_tokens, tokenizer_with_unk};
    use candle_nn::VarBuilder;
    use kornia_image::{Image, ImageSize};

    const RESOLUTION: usize = 48;

    fn tiny_engine() -> Result<CaptionEngine, BlipError> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = BlipCaptioner::new(&tiny_config(), RESOLUTION, vb)?;
        let config = CaptionConfig {
            resolution: RESOLUTION,
            tokens: tiny_tokens(),
            ..Default::default()
        };
        CaptionEngine::new(model, tiny_tokenizer(), &config, Device::Cpu, DType::F32)
    }

    fn gray(width: usize, height: usize) -> Result<RawImage, Box<dyn std::error::Error>> {
        Ok(Image::new(
            ImageSize { width, height },
            vec![128u8; width * height * 3],
            kornia_image::allocator::CpuAllocator,
        )?)
    }

    #[test]
    fn prefix_starts_with_bos_and_prompt() -> Result<(), BlipError> {
        let engine = tiny_engine()?;
        assert_eq!(engine.prefix, vec![10, 0, 1, 2]);
        Ok(())
    }

    #[test]
    fn unencodable_prompt_is_model_unavailable() -> Result<(), BlipError> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = BlipCaptioner::new(&tiny_config(), RESOLUTION, vb)?;
        let config = CaptionConfig {
            resolution: RESOLUTION,
            prompt: "a zebra of ".to_string(),
            tokens: tiny_tokens(),
            ..Default::default()
        };
        let result = CaptionEngine::new(
            model,
            tokenizer_with_unk("[MISSING]"),
            &config,
            Device::Cpu,
            DType::F32,
        );
        assert!(matches!(
            result,
            Err(BlipError::ModelUnavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn caption_length_is_bounded() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine()?;
        let caption = engine.caption(&gray(64, 40)?)?;
        let words = caption.split_whitespace().count();
        assert!((5..=20).contains(&words), "{caption:?}");
        Ok(())
    }

    #[test]
    fn caption_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine()?;
        let image = gray(30, 30)?;
        assert_eq!(engine.caption(&image)?, engine.caption(&image)?);
        Ok(())
    }

    #[test]
    fn question_does_not_change_caption() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine()?;
        let pixels = engine.preprocessor().normalize(&gray(20, 10)?, RESOLUTION)?;
        assert_eq!(
            engine.infer(&pixels, None)?,
            engine.infer(&pixels, Some("which bird is this?"))?
        );
        Ok(())
    }

    #[test]
    fn rejects_tensor_at_other_resolution() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine()?;
        let pixels = engine.preprocessor().normalize(&gray(16, 16)?, 32)?;
        assert!(matches!(
            engine.infer(&pixels, None),
            Err(BlipError::InvalidImage(_))
        ));
        Ok(())
    }
}
