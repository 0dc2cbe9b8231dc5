use crate::generation::NextTokenLogits;
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder, embedding, layer_norm, linear};

/// Configuration of the BLIP text transformer.
#[derive(Clone, Debug, PartialEq)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    /// Width of the sequence attended to by the cross-attention layers.
    pub encoder_hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub layer_norm_eps: f64,
}

impl TextConfig {
    /// BERT-base with the two extra BLIP tokens, cross-attending a ViT-B image encoder.
    pub fn bert_base() -> Self {
        Self {
            vocab_size: 30524,
            hidden_size: 768,
            encoder_hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 512,
            layer_norm_eps: 1e-12,
        }
    }
}

struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    max_positions: usize,
}

impl TextEmbeddings {
    fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            max_positions: cfg.max_position_embeddings,
        })
    }
}

impl Module for TextEmbeddings {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_positions {
            candle_core::bail!(
                "sequence of {seq_len} tokens exceeds the {} supported positions",
                self.max_positions
            );
        }
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let xs = self
            .word_embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&positions)?)?;
        self.layer_norm.forward(&xs)
    }
}

struct TextAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl TextAttention {
    fn new(cfg: &TextConfig, is_cross_attention: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let kv_size = if is_cross_attention {
            cfg.encoder_hidden_size
        } else {
            hidden
        };
        Ok(Self {
            query: linear(hidden, hidden, vb.pp("query"))?,
            key: linear(kv_size, hidden, vb.pp("key"))?,
            value: linear(kv_size, hidden, vb.pp("value"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: hidden / cfg.num_attention_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_size, seq_len, _) = xs.dims3()?;
        xs.reshape((b_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attend from `xs` to `context`, or to `xs` itself when there is no context.
    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_size, seq_len, hidden) = xs.dims3()?;
        let context = context.unwrap_or(xs);

        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(context)?)?;
        let v = self.split_heads(&self.value.forward(context)?)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_size, seq_len, hidden))
    }
}

/// Attention followed by the residual projection and post layer norm.
struct AttentionBlock {
    attention: TextAttention,
    dense: Linear,
    layer_norm: LayerNorm,
}

impl AttentionBlock {
    fn new(cfg: &TextConfig, is_cross_attention: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: TextAttention::new(cfg, is_cross_attention, vb.pp("self"))?,
            dense: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("output.dense"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("output.LayerNorm"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let ys = self.attention.forward(xs, context, mask)?;
        self.layer_norm.forward(&(self.dense.forward(&ys)? + xs)?)
    }
}

struct TextLayer {
    attention: AttentionBlock,
    crossattention: AttentionBlock,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
}

impl TextLayer {
    fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: AttentionBlock::new(cfg, false, vb.pp("attention"))?,
            crossattention: AttentionBlock::new(cfg, true, vb.pp("crossattention"))?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate.dense"),
            )?,
            output: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("output.dense"))?,
            output_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("output.LayerNorm"),
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_states: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let xs = self.attention.forward(xs, None, mask)?;
        let xs = self.crossattention.forward(&xs, Some(encoder_states), None)?;
        let ys = self.output.forward(&self.intermediate.forward(&xs)?.gelu_erf()?)?;
        self.output_norm.forward(&(ys + xs)?)
    }
}

/// Additive mask hiding future positions, shape [S, S].
fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0. }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

/// The BLIP text transformer, cross-attending an encoder sequence in every layer.
///
/// Used bidirectionally as the question encoder and causally inside [`TextDecoder`].
pub struct TextModel {
    embeddings: TextEmbeddings,
    layers: Vec<TextLayer>,
}

impl TextModel {
    pub fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = TextEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_l = vb.pp("encoder.layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| TextLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// Run the transformer over `input_ids` [B, S] attending `encoder_states` [B or 1, N, E].
    ///
    /// Returns hidden states [B, S, H].
    pub fn forward(
        &self,
        input_ids: &Tensor,
        encoder_states: &Tensor,
        causal: bool,
    ) -> Result<Tensor> {
        let (b_size, seq_len) = input_ids.dims2()?;
        let mut xs = self.embeddings.forward(input_ids)?;

        let (enc_b, enc_len, enc_hidden) = encoder_states.dims3()?;
        let encoder_states = if enc_b == b_size {
            encoder_states.clone()
        } else {
            encoder_states
                .broadcast_as((b_size, enc_len, enc_hidden))?
                .contiguous()?
        };

        let mask = if causal && seq_len > 1 {
            Some(causal_mask(seq_len, xs.dtype(), xs.device())?)
        } else {
            None
        };

        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &encoder_states, mask.as_ref())?;
        }
        Ok(xs)
    }
}

/// Prediction head mapping hidden states to vocabulary logits.
struct LmHead {
    dense: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl LmHead {
    /// `word_embeddings` stands in for the projection of checkpoints storing it tied.
    fn new(cfg: &TextConfig, word_embeddings: &Tensor, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("predictions");
        let weight = if vb.contains_tensor("decoder.weight") {
            vb.get((cfg.vocab_size, cfg.hidden_size), "decoder.weight")?
        } else {
            word_embeddings.clone()
        };
        let bias = vb.get(cfg.vocab_size, "bias")?;
        Ok(Self {
            dense: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("transform.dense"))?,
            layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("transform.LayerNorm"),
            )?,
            decoder: Linear::new(weight, Some(bias)),
        })
    }
}

impl Module for LmHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.layer_norm.forward(&self.dense.forward(xs)?.gelu_erf()?)?;
        self.decoder.forward(&xs)
    }
}

/// The causal text transformer with its language modeling head.
pub struct TextDecoder {
    bert: TextModel,
    cls: LmHead,
}

impl TextDecoder {
    pub fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let bert = TextModel::new(cfg, vb.pp("bert"))?;
        let cls = LmHead::new(cfg, bert.embeddings.word_embeddings.embeddings(), vb.pp("cls"))?;
        Ok(Self { bert, cls })
    }

    /// Logits of the token following `input_ids` [B, S], shape [B, V].
    pub fn next_token_logits(
        &self,
        input_ids: &Tensor,
        encoder_states: &Tensor,
    ) -> Result<Tensor> {
        let hidden = self.bert.forward(input_ids, encoder_states, true)?;
        let seq_len = hidden.dim(1)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        self.cls.forward(&last)
    }

    /// Bind the decoder to the sequence it attends to during generation.
    pub fn conditioned<'a>(&'a self, encoder_states: &'a Tensor) -> ConditionedDecoder<'a> {
        ConditionedDecoder {
            decoder: self,
            encoder_states,
        }
    }
}

/// A [`TextDecoder`] attending a fixed sequence of image or question states.
pub struct ConditionedDecoder<'a> {
    decoder: &'a TextDecoder,
    encoder_states: &'a Tensor,
}

impl NextTokenLogits for ConditionedDecoder<'_> {
    fn next_token_logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.decoder.next_token_logits(input_ids, self.encoder_states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> TextConfig {
        TextConfig {
            vocab_size: 12,
            hidden_size: 16,
            encoder_hidden_size: 8,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            max_position_embeddings: 32,
            layer_norm_eps: 1e-12,
        }
    }

    #[test]
    fn causal_mask_hides_the_future() -> Result<()> {
        let mask = causal_mask(3, DType::F32, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(mask[0][0], 0.);
        assert_eq!(mask[2][1], 0.);
        assert!(mask[0][1].is_infinite() && mask[1][2].is_infinite());
        Ok(())
    }

    #[test]
    fn encoder_broadcasts_states_over_batch() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = TextModel::new(&tiny(), vb)?;
        let ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu)?;
        let states = Tensor::zeros((1, 5, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(model.forward(&ids, &states, false)?.dims(), &[2, 3, 16]);
        Ok(())
    }

    #[test]
    fn decoder_returns_last_position_logits() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = TextDecoder::new(&tiny(), vb)?;
        let ids = Tensor::new(&[[1u32, 2], [3, 4], [5, 6]], &Device::Cpu)?;
        let states = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        let logits = decoder.conditioned(&states).next_token_logits(&ids)?;
        assert_eq!(logits.dims(), &[3, 12]);
        Ok(())
    }

    #[test]
    fn too_long_sequence_is_an_error() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = TextModel::new(&tiny(), vb)?;
        let ids = Tensor::zeros((1, 33), DType::U32, &Device::Cpu)?;
        let states = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(model.forward(&ids, &states, true).is_err());
        Ok(())
    }
}
