use argh::FromArgs;
use kornia_blip::{DeviceConfig, Dispatcher, DispatcherConfig, TaskLabel, WeightsSource};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Caption an image, or answer a question about it, without a server.
struct PredictArgs {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the question; without one the image is captioned
    #[argh(option, short = 'q')]
    question: Option<String>,

    /// run the models on the given CUDA device
    #[argh(option)]
    cuda: Option<usize>,

    /// local directory with the captioning weights
    #[argh(option)]
    caption_weights: Option<PathBuf>,

    /// local directory with the question answering weights
    #[argh(option)]
    vqa_weights: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: PredictArgs = argh::from_env();

    let mut config = DispatcherConfig {
        device: args.cuda.map(DeviceConfig::Cuda).unwrap_or_default(),
        ..Default::default()
    };
    if let Some(dir) = args.caption_weights {
        config.caption.weights = WeightsSource::Local(dir);
    }
    if let Some(dir) = args.vqa_weights {
        config.vqa.weights = WeightsSource::Local(dir);
    }

    let dispatcher = Dispatcher::load(&config)?;
    let image = kornia_blip::read_image(&args.image_path)?;

    let task = match args.question {
        Some(_) => TaskLabel::VisualQuestionAnswering,
        None => TaskLabel::Captioning,
    };

    let start = std::time::Instant::now();
    let output = dispatcher.predict_task(&image, task, args.question.as_deref())?;
    log::info!("{task} took {:.2?}", start.elapsed());

    println!("{output}");

    Ok(())
}
