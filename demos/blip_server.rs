use argh::FromArgs;
use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use kornia_blip::{
    DeviceConfig, Dispatcher, DispatcherConfig, InferenceWorker, PredictRequest, RawImage,
    TaskLabel, WorkerResult,
};
use reqwest::StatusCode;
use serde_json::json;
use std::{path::Path, sync::Arc};

mod messages;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Serve image captioning and visual question answering over HTTP.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// run the models on the given CUDA device
    #[argh(option)]
    cuda: Option<usize>,
}

async fn post_predict(
    State(worker): State<Arc<InferenceWorker>>,
    Json(payload): Json<messages::PredictRequest>,
) -> impl IntoResponse {
    // reject bad labels before paying for the image read
    if let Err(e) = payload.task.parse::<TaskLabel>() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        );
    }

    let image = match read_image_from_path(&payload.image_path) {
        Ok(image) => image,
        Err(error_msg) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": error_msg })));
        }
    };

    let Some(id) = worker.schedule(PredictRequest {
        image,
        task: payload.task,
        question: payload.question,
    }) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Worker is stopped" })),
        );
    };

    log::info!("Scheduled request {id}");

    (
        StatusCode::OK,
        Json(json!({ "status": "scheduled", "id": id })),
    )
}

async fn get_result(State(worker): State<Arc<InferenceWorker>>) -> impl IntoResponse {
    match worker.try_poll_response() {
        WorkerResult::Completed(response) => {
            log::info!("Result {} received", response.id);
            let (output, error) = match response.result {
                Ok(output) => (Some(output), None),
                Err(e) => (None, Some(e.to_string())),
            };
            let status = if error.is_some() { "error" } else { "success" };
            let predict_response = messages::PredictResponse {
                id: response.id,
                task: response.task,
                question: response.question,
                start_time: response.start_time.elapsed().as_nanos(),
                duration: response.duration,
                output,
                error,
            };

            (
                StatusCode::OK,
                Json(json!({
                    "status": status,
                    "response": predict_response
                })),
            )
        }
        WorkerResult::Empty(state) => (
            StatusCode::OK,
            Json(json!({ "status": state.as_str(), "message": "No result available" })),
        ),
        WorkerResult::Error(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": e })),
        ),
    }
}

fn read_image_from_path(path: &Path) -> Result<RawImage, String> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| "Invalid file extension".to_string())?;

    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => kornia_io::jpeg::read_image_jpeg_rgb8(path).map_err(|e| e.to_string()),
        "png" => kornia_io::png::read_image_png_rgb8(path).map_err(|e| e.to_string()),
        _ => kornia_blip::read_image(path).map_err(|e| e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    let addr = format!("{}:{}", args.host, args.port);

    let config = DispatcherConfig {
        device: args.cuda.map(DeviceConfig::Cuda).unwrap_or_default(),
        ..Default::default()
    };
    let dispatcher = Dispatcher::load(&config)?;
    let worker = Arc::new(InferenceWorker::new(dispatcher));

    let welcome = format!(
        "Welcome to the BLIP server! Tasks: {}",
        TaskLabel::ALL.map(|t| t.as_str()).join(", ")
    );
    let app = Router::new()
        .route(
            "/",
            get(move || {
                let welcome = welcome.clone();
                async move { welcome }
            }),
        )
        .route("/predict", post(post_predict))
        .route("/results", get(get_result))
        .with_state(worker);

    log::info!("Starting the server");
    log::info!("Listening on: {addr}");
    log::info!("Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
