use candle_core::{D, DType, Device, Result, Tensor};
use candle_transformers::generation::LogitsProcessor;
use std::cmp::Ordering;

/// A language model that scores the next token of a batch of sequences.
pub trait NextTokenLogits {
    /// Logits [B, V] of the token following each row of `input_ids` [B, S].
    ///
    /// All rows share the same length.
    fn next_token_logits(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// How the next token is chosen at every step.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodingStrategy {
    /// Take the most likely token.
    Greedy,
    /// Keep the `num_beams` best partial sequences and return the best finished one.
    Beam { num_beams: usize },
    /// Seeded top-p sampling.
    Nucleus {
        top_p: f64,
        temperature: f64,
        seed: u64,
    },
}

/// Decoding strategy and bounds on the number of generated tokens.
///
/// Lengths count generated tokens only, the prefix and the end token are excluded.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodingConfig {
    pub strategy: DecodingStrategy,
    pub min_length: usize,
    pub max_length: usize,
}

impl DecodingConfig {
    /// Beam search of width 3 producing 5 to 20 tokens.
    pub fn caption() -> Self {
        Self {
            strategy: DecodingStrategy::Beam { num_beams: 3 },
            min_length: 5,
            max_length: 20,
        }
    }

    /// Beam search of width 3 producing 1 to 10 tokens.
    pub fn answer() -> Self {
        Self {
            strategy: DecodingStrategy::Beam { num_beams: 3 },
            min_length: 1,
            max_length: 10,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        !matches!(self.strategy, DecodingStrategy::Nucleus { .. })
    }
}

/// Generate a continuation of `prefix` until `eos` or `config.max_length` tokens.
///
/// # Arguments
///
/// * `model` - The model scoring the next token.
/// * `prefix` - The tokens the sequence starts with, never empty.
/// * `config` - The decoding strategy and length bounds.
/// * `eos` - The token terminating a sequence.
/// * `device` - The device the token tensors are created on.
///
/// # Returns
///
/// The generated tokens, without the prefix and without the end token.
pub fn generate<M: NextTokenLogits + ?Sized>(
    model: &M,
    prefix: &[u32],
    config: &DecodingConfig,
    eos: u32,
    device: &Device,
) -> Result<Vec<u32>> {
    if prefix.is_empty() {
        candle_core::bail!("generation needs at least one prefix token");
    }

    let start = std::time::Instant::now();
    let tokens = match &config.strategy {
        DecodingStrategy::Greedy => greedy(model, prefix, config, eos, device)?,
        DecodingStrategy::Beam { num_beams } => {
            beam_search(model, prefix, config, (*num_beams).max(1), eos, device)?
        }
        DecodingStrategy::Nucleus {
            top_p,
            temperature,
            seed,
        } => {
            let mut processor = LogitsProcessor::new(*seed, Some(*temperature), Some(*top_p));
            sample(model, prefix, config, &mut processor, eos, device)?
        }
    };

    log::debug!(
        "{} tokens generated in {:.2?} ({:?})",
        tokens.len(),
        start.elapsed(),
        config.strategy
    );

    Ok(tokens)
}

fn last_logits<M: NextTokenLogits + ?Sized>(
    model: &M,
    tokens: &[u32],
    device: &Device,
) -> Result<Vec<f32>> {
    let input = Tensor::new(tokens, device)?.unsqueeze(0)?;
    model
        .next_token_logits(&input)?
        .squeeze(0)?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()
}

/// Index of the largest value, the lowest index on ties.
fn argmax(values: &[f32], banned: Option<u32>) -> Option<u32> {
    values
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i as u32) != banned)
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if v <= b => best,
            _ if v.is_nan() => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i as u32)
}

fn greedy<M: NextTokenLogits + ?Sized>(
    model: &M,
    prefix: &[u32],
    config: &DecodingConfig,
    eos: u32,
    device: &Device,
) -> Result<Vec<u32>> {
    let mut tokens = prefix.to_vec();
    while tokens.len() - prefix.len() < config.max_length {
        let generated = tokens.len() - prefix.len();
        let logits = last_logits(model, &tokens, device)?;
        let banned = (generated < config.min_length).then_some(eos);
        let Some(next) = argmax(&logits, banned) else {
            candle_core::bail!("no token left to choose from")
        };
        if next == eos {
            break;
        }
        tokens.push(next);
    }
    Ok(tokens.split_off(prefix.len()))
}

fn sample<M: NextTokenLogits + ?Sized>(
    model: &M,
    prefix: &[u32],
    config: &DecodingConfig,
    processor: &mut LogitsProcessor,
    eos: u32,
    device: &Device,
) -> Result<Vec<u32>> {
    let mut tokens = prefix.to_vec();
    while tokens.len() - prefix.len() < config.max_length {
        let generated = tokens.len() - prefix.len();
        let mut logits = last_logits(model, &tokens, device)?;
        if generated < config.min_length {
            if let Some(l) = logits.get_mut(eos as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
        let next = processor.sample(&Tensor::new(logits.as_slice(), &Device::Cpu)?)?;
        if next == eos {
            break;
        }
        tokens.push(next);
    }
    Ok(tokens.split_off(prefix.len()))
}

/// A partial or finished beam: generated tokens and summed log probabilities.
#[derive(Clone, Debug)]
struct Beam {
    tokens: Vec<u32>,
    log_prob: f32,
}

/// Descending by score, ascending by position on ties.
fn by_score_desc(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

fn beam_search<M: NextTokenLogits + ?Sized>(
    model: &M,
    prefix: &[u32],
    config: &DecodingConfig,
    num_beams: usize,
    eos: u32,
    device: &Device,
) -> Result<Vec<u32>> {
    // finished beams are ranked by their log probability normalized by the sequence length
    let normalized = |beam: &Beam, len: usize| beam.log_prob / (prefix.len() + len) as f32;

    let mut running = vec![Beam {
        tokens: Vec::new(),
        log_prob: 0.,
    }];
    let mut finished: Vec<(f32, Beam)> = Vec::new();
    let mut done = false;

    for step in 0..config.max_length {
        let input_ids = running
            .iter()
            .flat_map(|b| prefix.iter().chain(b.tokens.iter()).copied())
            .collect::<Vec<_>>();
        let input = Tensor::from_vec(input_ids, (running.len(), prefix.len() + step), device)?;
        let logits = model.next_token_logits(&input)?.to_dtype(DType::F32)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
        let vocab = log_probs.first().map(|row| row.len()).unwrap_or(0);
        let ban_eos = step < config.min_length;

        // the best 2 * num_beams extensions over all running beams
        let mut candidates = running
            .iter()
            .zip(log_probs.iter())
            .flat_map(|(beam, row)| row.iter().map(move |lp| beam.log_prob + lp))
            .enumerate()
            .map(|(flat, score)| (score, flat))
            .filter(|&(score, flat)| !(score.is_nan() || (ban_eos && (flat % vocab) as u32 == eos)))
            .collect::<Vec<_>>();
        let keep = (2 * num_beams).min(candidates.len());
        if keep == 0 {
            break;
        }
        if keep < candidates.len() {
            candidates.select_nth_unstable_by(keep - 1, by_score_desc);
            candidates.truncate(keep);
        }
        candidates.sort_by(by_score_desc);

        let mut next = Vec::with_capacity(num_beams);
        for (rank, (score, flat)) in candidates.into_iter().enumerate() {
            let (beam_idx, token) = (flat / vocab, (flat % vocab) as u32);
            let parent = &running[beam_idx];
            if token == eos {
                if rank < num_beams {
                    let beam = Beam {
                        tokens: parent.tokens.clone(),
                        log_prob: score,
                    };
                    finished.push((normalized(&beam, beam.tokens.len()), beam));
                }
            } else {
                let mut tokens = parent.tokens.clone();
                tokens.push(token);
                next.push(Beam {
                    tokens,
                    log_prob: score,
                });
            }
            if next.len() == num_beams {
                break;
            }
        }

        finished.sort_by(|a, b| b.0.total_cmp(&a.0));
        finished.truncate(num_beams);
        running = next;

        if running.is_empty() {
            done = true;
            break;
        }
        if finished.len() == num_beams {
            let best_running = running
                .iter()
                .map(|b| normalized(b, b.tokens.len()))
                .fold(f32::NEG_INFINITY, f32::max);
            let worst_finished = finished.last().map(|f| f.0).unwrap_or(f32::NEG_INFINITY);
            if worst_finished >= best_running {
                done = true;
                break;
            }
        }
    }

    if !done {
        for beam in running {
            let score = normalized(&beam, beam.tokens.len());
            finished.push((score, beam));
        }
    }

    // stable sort keeps the earliest hypothesis on ties
    finished.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(finished
        .into_iter()
        .next()
        .map(|(_, beam)| beam.tokens)
        .unwrap_or_default())
}
