use argh::FromArgs;
use std::path::PathBuf;

mod messages;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Client for scheduling predictions on the BLIP server and collecting results
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "predict" or "results"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Predict(PredictCommand),
    Results(ResultsCommand),
}

#[derive(FromArgs)]
/// Schedule a prediction on an image
#[argh(subcommand, name = "predict")]
struct PredictCommand {
    /// the path to the image, as seen by the server
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// the task: "Image Captioning" or "Visual Question Answering"
    #[argh(option, short = 't', default = "String::from(\"Image Captioning\")")]
    task: String,

    /// the question, required for visual question answering
    #[argh(option, short = 'q')]
    question: Option<String>,
}

#[derive(FromArgs)]
/// Fetch the next finished result
#[argh(subcommand, name = "results")]
struct ResultsCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    let addr = format!("{}:{}", args.host, args.port);

    let response = match args.command {
        ClientCommands::Predict(command) => {
            client
                .post(format!("http://{addr}/predict"))
                .json(&messages::PredictRequest {
                    image_path: command.image_path,
                    task: command.task,
                    question: command.question,
                })
                .send()
                .await?
        }
        ClientCommands::Results(_) => client.get(format!("http://{addr}/results")).send().await?,
    };

    let result = response.json::<serde_json::Value>().await?;
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
