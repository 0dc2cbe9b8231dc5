use crate::BlipError;
use std::{fmt, str::FromStr};

/// The tasks the service can run on an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskLabel {
    /// Describe the image in a short sentence.
    Captioning,
    /// Answer a free-text question about the image.
    VisualQuestionAnswering,
}

impl TaskLabel {
    pub const ALL: [TaskLabel; 2] = [TaskLabel::Captioning, TaskLabel::VisualQuestionAnswering];

    /// Returns the label shown to users, e.g. in a task selector.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLabel::Captioning => "Image Captioning",
            TaskLabel::VisualQuestionAnswering => "Visual Question Answering",
        }
    }
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskLabel {
    type Err = BlipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image captioning" | "captioning" => Ok(TaskLabel::Captioning),
            "visual question answering" | "vqa" => Ok(TaskLabel::VisualQuestionAnswering),
            _ => Err(BlipError::UnsupportedTask(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ui_labels() -> Result<(), BlipError> {
        assert_eq!(
            "Image Captioning".parse::<TaskLabel>()?,
            TaskLabel::Captioning
        );
        assert_eq!(
            "Visual Question Answering".parse::<TaskLabel>()?,
            TaskLabel::VisualQuestionAnswering
        );
        assert_eq!(" VQA ".parse::<TaskLabel>()?, TaskLabel::VisualQuestionAnswering);
        Ok(())
    }

    #[test]
    fn display_round_trips() -> Result<(), BlipError> {
        for task in TaskLabel::ALL {
            assert_eq!(task.to_string().parse::<TaskLabel>()?, task);
        }
        Ok(())
    }

    #[test]
    fn unknown_label_is_rejected() {
        for label in ["Translate", "", "caption me", "Image"] {
            match label.parse::<TaskLabel>() {
                Err(BlipError::UnsupportedTask(l)) => assert_eq!(l, label),
                other => panic!("expected UnsupportedTask for {label:?}, got {other:?}"),
            }
        }
    }
}
