//! BLIP networks implemented with candle.
//!
//! Weight names follow the Hugging Face BLIP safetensors layout.

mod text;
mod vision;

pub use text::{ConditionedDecoder, TextConfig, TextDecoder, TextModel};
pub use vision::{VisionConfig, VisionModel};

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

/// Architecture of a BLIP checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct BlipConfig {
    pub vision: VisionConfig,
    pub text: TextConfig,
}

impl BlipConfig {
    /// The ViT-B/16 + BERT-base architecture of the BLIP base checkpoints.
    pub fn base() -> Self {
        Self {
            vision: VisionConfig::vit_base(),
            text: TextConfig::bert_base(),
        }
    }
}

/// Token ids with a fixed role in the BLIP vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    /// `[DEC]`, first token of every decoded sequence.
    pub bos: u32,
    /// `[ENC]`, first token of an encoded question.
    pub enc: u32,
    /// `[SEP]`, terminates sequences.
    pub sep: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: 30522,
            enc: 30523,
            sep: 102,
        }
    }
}

/// Image encoder and image-grounded text decoder.
pub struct BlipCaptioner {
    vision_model: VisionModel,
    text_decoder: TextDecoder,
}

impl BlipCaptioner {
    pub fn new(cfg: &BlipConfig, resolution: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            vision_model: VisionModel::new(&cfg.vision, resolution, vb.pp("vision_model"))?,
            text_decoder: TextDecoder::new(&cfg.text, vb.pp("text_decoder"))?,
        })
    }

    /// Image embeddings the decoder attends to, shape [1, N, H].
    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.vision_model.forward(pixel_values)
    }

    pub fn text_decoder(&self) -> &TextDecoder {
        &self.text_decoder
    }
}

/// Image encoder, image-grounded question encoder and answer decoder.
pub struct BlipVqa {
    vision_model: VisionModel,
    text_encoder: TextModel,
    text_decoder: TextDecoder,
}

impl BlipVqa {
    pub fn new(cfg: &BlipConfig, resolution: usize, vb: VarBuilder) -> Result<Self> {
        // the answer decoder attends to the question states, not to the image
        let decoder_cfg = TextConfig {
            encoder_hidden_size: cfg.text.hidden_size,
            ..cfg.text.clone()
        };
        Ok(Self {
            vision_model: VisionModel::new(&cfg.vision, resolution, vb.pp("vision_model"))?,
            text_encoder: TextModel::new(&cfg.text, vb.pp("text_encoder"))?,
            text_decoder: TextDecoder::new(&decoder_cfg, vb.pp("text_decoder"))?,
        })
    }

    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.vision_model.forward(pixel_values)
    }

    /// Question states [1, S, H] for `question_ids` [1, S], grounded on `image_embeds`.
    pub fn encode_question(&self, question_ids: &Tensor, image_embeds: &Tensor) -> Result<Tensor> {
        self.text_encoder.forward(question_ids, image_embeds, false)
    }

    pub fn text_decoder(&self) -> &TextDecoder {
        &self.text_decoder
    }
}
