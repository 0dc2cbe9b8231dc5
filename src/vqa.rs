use crate::{
    BlipError, ImagePreprocessor, NormalizedTensor, RawImage,
    blip::{BlipConfig, BlipVqa, SpecialTokens},
    generation::{DecodingConfig, generate},
    loader::WeightsSource,
    model::{Engine, check_resolution},
};
use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;

/// Configuration of the [`VqaEngine`].
#[derive(Clone, Debug, PartialEq)]
pub struct VqaConfig {
    pub weights: WeightsSource,
    pub resolution: usize,
    pub decoding: DecodingConfig,
    pub tokens: SpecialTokens,
    /// Longest encoded question, `[ENC]` and `[SEP]` included. Longer questions are truncated.
    pub max_question_tokens: usize,
}

impl Default for VqaConfig {
    fn default() -> Self {
        Self {
            weights: WeightsSource::hub("Salesforce/blip-vqa-base"),
            resolution: 480,
            decoding: DecodingConfig::answer(),
            tokens: SpecialTokens::default(),
            max_question_tokens: 35,
        }
    }
}

/// Returns the question if it holds anything but whitespace.
pub fn require_question(question: Option<&str>) -> Result<&str, BlipError> {
    match question {
        Some(q) if !q.trim().is_empty() => Ok(q),
        _ => Err(BlipError::MissingQuestion),
    }
}

/// Answers free-form questions about an image with a short phrase.
pub struct VqaEngine {
    model: BlipVqa,
    tokenizer: Tokenizer,
    preprocessor: ImagePreprocessor,
    decoding: DecodingConfig,
    tokens: SpecialTokens,
    max_question_tokens: usize,
    resolution: usize,
    device: Device,
    dtype: DType,
}

impl VqaEngine {
    pub fn new(
        model: BlipVqa,
        tokenizer: Tokenizer,
        config: &VqaConfig,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            model,
            tokenizer,
            preprocessor: ImagePreprocessor::default(),
            decoding: config.decoding.clone(),
            tokens: config.tokens,
            max_question_tokens: config.max_question_tokens.max(2),
            resolution: config.resolution,
            device,
            dtype,
        }
    }

    /// Resolve the weights of `config` and load the base architecture on `device`.
    ///
    /// The vision position embeddings are resampled when `config.resolution` differs from
    /// the resolution the checkpoint was trained at.
    pub fn load(config: &VqaConfig, device: &Device, dtype: DType) -> Result<Self, BlipError> {
        let weights = config.weights.resolve()?;
        let tokenizer = weights.tokenizer()?;
        let vb = weights.var_builder(dtype, device)?;
        let model = BlipVqa::new(&BlipConfig::base(), config.resolution, vb)
            .map_err(|e| BlipError::model_unavailable(&config.weights, e))?;

        log::info!("VQA model loaded from {}", config.weights);

        Ok(Self::new(model, tokenizer, config, device.clone(), dtype))
    }

    /// Answer `question` about an image of any size.
    pub fn answer(&self, image: &RawImage, question: &str) -> Result<String, BlipError> {
        self.run(image, Some(question))
    }

    /// `[ENC]`, the question tokens and `[SEP]`.
    fn question_ids(&self, question: &str) -> Result<Vec<u32>, BlipError> {
        let encoding = self.tokenizer.encode(question.trim(), false)?;
        let body = encoding.get_ids();
        let body = &body[..body.len().min(self.max_question_tokens - 2)];

        let mut ids = Vec::with_capacity(body.len() + 2);
        ids.push(self.tokens.enc);
        ids.extend_from_slice(body);
        ids.push(self.tokens.sep);
        Ok(ids)
    }
}

impl Engine for VqaEngine {
    fn name(&self) -> &str {
        "vqa"
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn preprocessor(&self) -> &ImagePreprocessor {
        &self.preprocessor
    }

    /// The question is checked before the image is resized.
    fn run(&self, image: &RawImage, question: Option<&str>) -> Result<String, BlipError> {
        let question = require_question(question)?;
        let pixels = self.preprocessor.normalize(image, self.resolution)?;
        self.infer(&pixels, Some(question))
    }

    fn infer(
        &self,
        pixels: &NormalizedTensor,
        question: Option<&str>,
    ) -> Result<String, BlipError> {
        let question = require_question(question)?;
        check_resolution(pixels, self.resolution)?;

        let pixel_values = pixels.pixel_values(&self.device)?.to_dtype(self.dtype)?;
        let image_embeds = self.model.encode_image(&pixel_values)?;

        let question_ids =
            Tensor::new(self.question_ids(question)?, &self.device)?.unsqueeze(0)?;
        let question_states = self.model.encode_question(&question_ids, &image_embeds)?;
        let decoder = self.model.text_decoder().conditioned(&question_states);

        let tokens = generate(
            &decoder,
            &[self.tokens.bos],
            &self.decoding,
            self.tokens.sep,
            &self.device,
        )?;

        let answer = self.tokenizer.decode(&tokens, true)?;
        Ok(answer.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blip::testing::{tiny_config, tiny_tokenizer, tiny_tokens};
    use candle_nn::VarBuilder;
    use kornia_image::{Image, ImageSize, allocator::CpuAllocator};

    const RESOLUTION: usize = 40;

    fn tiny_engine(max_question_tokens: usize) -> Result<VqaEngine, BlipError> {
        tiny_engine_at(RESOLUTION, max_question_tokens)
    }

    /// An engine whose preprocessing runs at `resolution` over a network built for 40.
    fn tiny_engine_at(
        resolution: usize,
        max_question_tokens: usize,
    ) -> Result<VqaEngine, BlipError> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = BlipVqa::new(&tiny_config(), RESOLUTION, vb)?;
        let config = VqaConfig {
            resolution,
            tokens: tiny_tokens(),
            max_question_tokens,
            ..Default::default()
        };
        Ok(VqaEngine::new(
            model,
            tiny_tokenizer(),
            &config,
            Device::Cpu,
            DType::F32,
        ))
    }

    fn gray() -> Result<RawImage, Box<dyn std::error::Error>> {
        Ok(Image::new(
            ImageSize {
                width: 24,
                height: 18,
            },
            vec![90u8; 24 * 18 * 3],
            CpuAllocator,
        )?)
    }

    #[test]
    fn require_question_rejects_blank() {
        assert!(matches!(
            require_question(None),
            Err(BlipError::MissingQuestion)
        ));
        assert!(matches!(
            require_question(Some("")),
            Err(BlipError::MissingQuestion)
        ));
        assert!(matches!(
            require_question(Some(" \t\n")),
            Err(BlipError::MissingQuestion)
        ));
        assert_eq!(require_question(Some("why?")).ok(), Some("why?"));
    }

    #[test]
    fn question_is_framed_by_enc_and_sep() -> Result<(), BlipError> {
        let engine = tiny_engine(35)?;
        assert_eq!(
            engine.question_ids("Which bird is this?")?,
            vec![11, 4, 3, 5, 6, 7, 9]
        );
        Ok(())
    }

    #[test]
    fn long_question_is_truncated() -> Result<(), BlipError> {
        let engine = tiny_engine(4)?;
        assert_eq!(engine.question_ids("Which bird is this?")?, vec![11, 4, 3, 9]);
        Ok(())
    }

    #[test]
    fn answer_is_not_empty() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine(35)?;
        let answer = engine.answer(&gray()?, "Which bird is this?")?;
        assert!(!answer.is_empty());
        assert!(answer.split_whitespace().count() <= 10);
        Ok(())
    }

    #[test]
    fn blank_question_fails_before_inference() -> Result<(), Box<dyn std::error::Error>> {
        let engine = tiny_engine(35)?;
        assert!(matches!(
            engine.answer(&gray()?, "   "),
            Err(BlipError::MissingQuestion)
        ));
        Ok(())
    }

    #[test]
    fn blank_question_fails_before_preprocessing() -> Result<(), Box<dyn std::error::Error>> {
        let empty = Image::new(
            ImageSize {
                width: 0,
                height: 0,
            },
            vec![],
            CpuAllocator,
        )?;
        let engine = tiny_engine(35)?;
        assert!(matches!(
            engine.answer(&empty, ""),
            Err(BlipError::MissingQuestion)
        ));
        assert!(matches!(
            engine.answer(&empty, "which bird is this?"),
            Err(BlipError::InvalidImage(_))
        ));

        // a zero resolution makes any preprocessing fail
        let engine = tiny_engine_at(0, 35)?;
        assert!(matches!(
            engine.run(&gray()?, Some(" ")),
            Err(BlipError::MissingQuestion)
        ));
        assert!(matches!(
            engine.run(&gray()?, None),
            Err(BlipError::MissingQuestion)
        ));
        Ok(())
    }

    #[test]
    fn default_decoding_is_beam_search() {
        let config = VqaConfig::default();
        assert_eq!(
            config.decoding.strategy,
            crate::DecodingStrategy::Beam { num_beams: 3 }
        );
        assert_eq!((config.decoding.min_length, config.decoding.max_length), (1, 10));
    }
}
