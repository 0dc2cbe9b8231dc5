use crate::{
    BlipError, RawImage, TaskLabel,
    caption::{CaptionConfig, CaptionEngine},
    loader::DeviceConfig,
    model::Engine,
    vqa::{VqaConfig, VqaEngine, require_question},
};
use kornia_image::ImageSize;

/// Configuration of both engines behind a [`Dispatcher`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatcherConfig {
    pub device: DeviceConfig,
    pub caption: CaptionConfig,
    pub vqa: VqaConfig,
}

/// Routes a prediction request to the engine serving its task.
///
/// Both engines are loaded once and shared by every request. Each request runs exactly
/// one of them.
pub struct Dispatcher {
    captioning: Box<dyn Engine>,
    vqa: Box<dyn Engine>,
}

impl Dispatcher {
    pub fn new(captioning: impl Engine + 'static, vqa: impl Engine + 'static) -> Self {
        Self {
            captioning: Box::new(captioning),
            vqa: Box::new(vqa),
        }
    }

    /// Load both engines on the configured device.
    pub fn load(config: &DispatcherConfig) -> Result<Self, BlipError> {
        let (device, dtype) = config.device.resolve();
        log::info!("Loading engines on {device:?} with {dtype:?}");

        let captioning = CaptionEngine::load(&config.caption, &device, dtype)?;
        let vqa = VqaEngine::load(&config.vqa, &device, dtype)?;
        Ok(Self::new(captioning, vqa))
    }

    /// The engine serving `task`.
    pub fn engine(&self, task: TaskLabel) -> &dyn Engine {
        match task {
            TaskLabel::Captioning => self.captioning.as_ref(),
            TaskLabel::VisualQuestionAnswering => self.vqa.as_ref(),
        }
    }

    /// Run the task named by `task` on `image`.
    ///
    /// The question is ignored for captioning and required for visual question answering.
    pub fn predict(
        &self,
        image: &RawImage,
        task: &str,
        question: Option<&str>,
    ) -> Result<String, BlipError> {
        let task = task.parse::<TaskLabel>()?;
        self.predict_task(image, task, question)
    }

    pub fn predict_task(
        &self,
        image: &RawImage,
        task: TaskLabel,
        question: Option<&str>,
    ) -> Result<String, BlipError> {
        let question = match task {
            TaskLabel::Captioning => None,
            TaskLabel::VisualQuestionAnswering => Some(require_question(question)?),
        };

        let engine = self.engine(task);
        let ImageSize { width, height } = image.size();
        log::debug!(
            "{task}: {width}x{height} image to {} at {}",
            engine.name(),
            engine.resolution()
        );

        let start = std::time::Instant::now();
        let output = engine.run(image, question)?;
        log::debug!("{task} done in {:.2?}", start.elapsed());

        Ok(output)
    }
}
