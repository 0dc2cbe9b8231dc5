/// Errors returned by the captioning and question answering pipeline.
///
/// None of these are retried internally: the same input fails the same way twice.
#[derive(thiserror::Error, Debug)]
pub enum BlipError {
    /// The input could not be decoded or is not a usable color image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A visual question answering request came without a question.
    #[error("Visual question answering requires a non-empty question")]
    MissingQuestion,

    /// The task label does not name any known task.
    #[error("Unsupported task: {0:?}")]
    UnsupportedTask(String),

    /// An engine could not be built from its weights source.
    #[error("Model unavailable ({source_name}): {reason}")]
    ModelUnavailable { source_name: String, reason: String },

    #[error(transparent)]
    Inference(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl BlipError {
    pub(crate) fn model_unavailable(source: impl ToString, reason: impl ToString) -> Self {
        BlipError::ModelUnavailable {
            source_name: source.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<tokenizers::Error> for BlipError {
    fn from(e: tokenizers::Error) -> Self {
        BlipError::Tokenizer(e.to_string())
    }
}
