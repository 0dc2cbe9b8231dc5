use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder, conv2d, layer_norm, linear};

/// Configuration of the BLIP vision transformer.
#[derive(Clone, Debug, PartialEq)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Resolution the checkpoint position embeddings were stored at.
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    /// ViT-B/16 as used by the BLIP base checkpoints.
    pub fn vit_base() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            image_size: 384,
            patch_size: 16,
            layer_norm_eps: 1e-5,
        }
    }
}

struct VisionEmbeddings {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Tensor,
}

impl VisionEmbeddings {
    fn new(cfg: &VisionConfig, resolution: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embedding = conv2d(
            3,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;
        let class_embedding = vb.get((1, 1, cfg.hidden_size), "class_embedding")?;

        let grid = cfg.image_size / cfg.patch_size;
        let position_embedding =
            vb.get((1, grid * grid + 1, cfg.hidden_size), "position_embedding")?;

        let target = resolution / cfg.patch_size;
        if target == 0 || target * cfg.patch_size != resolution {
            candle_core::bail!(
                "resolution {resolution} is not a positive multiple of the patch size {}",
                cfg.patch_size
            );
        }

        let position_embedding = if target == grid {
            position_embedding
        } else {
            log::debug!("Resampling position embeddings from {grid}x{grid} to {target}x{target}");
            resample_position_embedding(&position_embedding, grid, target)?
        };

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
        })
    }
}

impl Module for VisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b_size = pixel_values.dim(0)?;
        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let (_, _, hidden) = self.class_embedding.dims3()?;
        let class = self
            .class_embedding
            .broadcast_as((b_size, 1, hidden))?
            .contiguous()?;
        Tensor::cat(&[&class, &patches], 1)?.broadcast_add(&self.position_embedding)
    }
}

/// Resample the patch grid of learned position embeddings with bicubic interpolation.
///
/// The class token embedding at index 0 is kept as is.
fn resample_position_embedding(pos: &Tensor, grid: usize, target: usize) -> Result<Tensor> {
    let (_, _, hidden) = pos.dims3()?;
    let dtype = pos.dtype();
    let class = pos.narrow(1, 0, 1)?;
    let patches = pos
        .narrow(1, 1, grid * grid)?
        .squeeze(0)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;

    let taps = cubic_taps(grid, target);

    // rows first, then columns
    let mut rows = vec![0f32; target * grid * hidden];
    for (oy, (idx, w)) in taps.iter().enumerate() {
        for x in 0..grid {
            let dst = &mut rows[(oy * grid + x) * hidden..(oy * grid + x + 1) * hidden];
            for k in 0..4 {
                let src = &patches[idx[k] * grid + x];
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d += w[k] * s;
                }
            }
        }
    }

    let mut out = vec![0f32; target * target * hidden];
    for oy in 0..target {
        for (ox, (idx, w)) in taps.iter().enumerate() {
            let dst = &mut out[(oy * target + ox) * hidden..(oy * target + ox + 1) * hidden];
            for k in 0..4 {
                let start = (oy * grid + idx[k]) * hidden;
                for (d, s) in dst.iter_mut().zip(rows[start..start + hidden].iter()) {
                    *d += w[k] * s;
                }
            }
        }
    }

    let patches =
        Tensor::from_vec(out, (1, target * target, hidden), pos.device())?.to_dtype(dtype)?;
    Tensor::cat(&[&class, &patches], 1)
}

/// Source indices and weights of the four cubic taps for every output position.
fn cubic_taps(input: usize, output: usize) -> Vec<([usize; 4], [f32; 4])> {
    const A: f32 = -0.75;
    let kernel = |x: f32| {
        let x = x.abs();
        if x <= 1.0 {
            ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
        } else if x < 2.0 {
            ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
        } else {
            0.0
        }
    };

    let scale = input as f32 / output as f32;
    let last = input as isize - 1;
    (0..output)
        .map(|o| {
            let src = (o as f32 + 0.5) * scale - 0.5;
            let base = src.floor();
            let t = src - base;
            let base = base as isize;
            let idx = [-1isize, 0, 1, 2].map(|k| (base + k).clamp(0, last) as usize);
            let w = [kernel(t + 1.0), kernel(t), kernel(1.0 - t), kernel(2.0 - t)];
            (idx, w)
        })
        .collect()
}

struct Attention {
    qkv: Linear,
    projection: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        Ok(Self {
            qkv: linear(hidden, 3 * hidden, vb.pp("qkv"))?,
            projection: linear(hidden, hidden, vb.pp("projection"))?,
            num_heads: cfg.num_attention_heads,
            scale: 1. / (head_dim as f64).sqrt(),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_size, seq_len, hidden) = xs.dims3()?;
        let head_dim = hidden / self.num_heads;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b_size, seq_len, 3, self.num_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let ys = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_size, seq_len, hidden))?;
        self.projection.forward(&ys)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

struct EncoderLayer {
    self_attn: Attention,
    layer_norm1: LayerNorm,
    mlp: Mlp,
    layer_norm2: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm1: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            mlp: Mlp {
                fc1: linear(hidden, cfg.intermediate_size, vb.pp("mlp.fc1"))?,
                fc2: linear(cfg.intermediate_size, hidden, vb.pp("mlp.fc2"))?,
            },
            layer_norm2: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.self_attn.forward(&self.layer_norm1.forward(xs)?)?)?;
        &xs + self.mlp.forward(&self.layer_norm2.forward(&xs)?)?
    }
}

/// The BLIP vision transformer.
///
/// Maps pixel values [B, 3, R, R] to image embeddings [B, 1 + (R / P)^2, H].
pub struct VisionModel {
    embeddings: VisionEmbeddings,
    layers: Vec<EncoderLayer>,
    post_layernorm: LayerNorm,
}

impl VisionModel {
    /// Load the vision transformer for inputs of `resolution` pixels per side.
    pub fn new(cfg: &VisionConfig, resolution: usize, vb: VarBuilder) -> Result<Self> {
        let embeddings = VisionEmbeddings::new(cfg, resolution, vb.pp("embeddings"))?;
        let vb_l = vb.pp("encoder.layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let post_layernorm =
            layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("post_layernorm"))?;
        Ok(Self {
            embeddings,
            layers,
            post_layernorm,
        })
    }
}

impl Module for VisionModel {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        self.post_layernorm.forward(&xs)
    }
}
