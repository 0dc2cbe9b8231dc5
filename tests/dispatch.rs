use kornia_blip::{
    BlipError, Dispatcher, Engine, ImagePreprocessor, NormalizedTensor, RawImage, TaskLabel,
};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use std::sync::{Arc, Mutex};

/// What an engine saw on each call: resolution of the tensor and the question.
type Calls = Arc<Mutex<Vec<(usize, Option<String>)>>>;

struct Recorder {
    name: &'static str,
    resolution: usize,
    preprocessor: ImagePreprocessor,
    calls: Calls,
}

impl Engine for Recorder {
    fn name(&self) -> &str {
        self.name
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
        question: Option<&str>,
    ) -> Result<String, BlipError> {
        self.calls
            .lock()
            .unwrap()
            .push((pixels.resolution(), question.map(str::to_string)));
        Ok(format!("{} output", self.name))
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    caption_calls: Calls,
    vqa_calls: Calls,
}

// small resolutions keep the resize cheap, the routing logic is the same as at 384 and 480
fn fixture(caption_resolution: usize, vqa_resolution: usize) -> Fixture {
    let caption_calls = Calls::default();
    let vqa_calls = Calls::default();
    let recorder = |name, resolution, calls: &Calls| Recorder {
        name,
        resolution,
        preprocessor: ImagePreprocessor::default(),
        calls: calls.clone(),
    };
    Fixture {
        dispatcher: Dispatcher::new(
            recorder("caption", caption_resolution, &caption_calls),
            recorder("vqa", vqa_resolution, &vqa_calls),
        ),
        caption_calls,
        vqa_calls,
    }
}

fn image(width: usize, height: usize) -> RawImage {
    let data = (0..width * height * 3).map(|i| (i % 256) as u8).collect();
    Image::new(ImageSize { width, height }, data, CpuAllocator).unwrap()
}

#[test]
fn captioning_ignores_the_question() -> Result<(), BlipError> {
    let f = fixture(24, 30);
    let output = f
        .dispatcher
        .predict(&image(16, 12), "Image Captioning", Some("What is this?"))?;
    assert_eq!(output, "caption output");
    assert_eq!(*f.caption_calls.lock().unwrap(), vec![(24, None)]);
    assert!(f.vqa_calls.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn vqa_receives_the_question() -> Result<(), BlipError> {
    let f = fixture(24, 30);
    let output = f.dispatcher.predict(
        &image(16, 12),
        "Visual Question Answering",
        Some("What color is the bird?"),
    )?;
    assert_eq!(output, "vqa output");
    assert_eq!(
        *f.vqa_calls.lock().unwrap(),
        vec![(30, Some("What color is the bird?".to_string()))]
    );
    assert!(f.caption_calls.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn unknown_task_runs_no_engine() {
    let f = fixture(24, 30);
    let result = f.dispatcher.predict(&image(8, 8), "Translate", Some("hola"));
    assert!(matches!(result, Err(BlipError::UnsupportedTask(t)) if t == "Translate"));
    assert!(f.caption_calls.lock().unwrap().is_empty());
    assert!(f.vqa_calls.lock().unwrap().is_empty());
}

#[test]
fn vqa_without_question_runs_no_engine() {
    let f = fixture(24, 30);
    for question in [None, Some(""), Some("   ")] {
        let result = f
            .dispatcher
            .predict(&image(8, 8), "Visual Question Answering", question);
        assert!(matches!(result, Err(BlipError::MissingQuestion)));
    }
    assert!(f.caption_calls.lock().unwrap().is_empty());
    assert!(f.vqa_calls.lock().unwrap().is_empty());
}

#[test]
fn each_task_gets_its_own_resolution() -> Result<(), BlipError> {
    let f = fixture(384, 480);
    let photo = image(640, 480);
    f.dispatcher
        .predict_task(&photo, TaskLabel::Captioning, None)?;
    f.dispatcher
        .predict_task(&photo, TaskLabel::VisualQuestionAnswering, Some("Where?"))?;
    assert_eq!(f.caption_calls.lock().unwrap()[0].0, 384);
    assert_eq!(f.vqa_calls.lock().unwrap()[0].0, 480);
    assert_eq!(f.dispatcher.engine(TaskLabel::Captioning).name(), "caption");
    assert_eq!(
        f.dispatcher
            .engine(TaskLabel::VisualQuestionAnswering)
            .name(),
        "vqa"
    );
    Ok(())
}

#[test]
fn dispatcher_is_shared_across_threads() -> Result<(), BlipError> {
    let f = fixture(16, 20);
    let dispatcher = Arc::new(f.dispatcher);
    let handles = (0..4)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || {
                let question = format!("question {i}");
                dispatcher.predict(&image(10, 10), "vqa", Some(&question))
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert_eq!(handle.join().unwrap()?, "vqa output");
    }
    assert_eq!(f.vqa_calls.lock().unwrap().len(), 4);
    Ok(())
}
