use crate::{BlipError, Dispatcher, RawImage};
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// A prediction to run in the background.
pub struct PredictRequest {
    pub image: RawImage,
    /// Task label as received, parsed when the request runs.
    pub task: String,
    pub question: Option<String>,
}

/// The outcome of a [`PredictRequest`] with its timing.
#[derive(Debug)]
pub struct PredictResponse {
    /// Identifier returned by [`InferenceWorker::schedule`].
    pub id: u64,
    pub task: String,
    pub question: Option<String>,
    /// Timestamp when the prediction started.
    pub start_time: Instant,
    pub duration: Duration,
    /// The caption or answer, or why the request failed.
    pub result: Result<String, BlipError>,
}

/// Represents the current state of the worker.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerState {
    /// Waiting for requests.
    Idle,
    /// Running a prediction.
    Processing,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
        }
    }
}

/// Result type returned when polling for responses.
#[derive(Debug)]
pub enum WorkerResult {
    /// A request finished, successfully or not.
    Completed(PredictResponse),
    /// No response available yet, with current worker state.
    Empty(WorkerState),
    /// The worker thread is gone.
    Error(String),
}

struct Job {
    id: u64,
    request: PredictRequest,
}

/// Runs predictions of a [`Dispatcher`] on a background thread.
///
/// Requests are processed one at a time in scheduling order. A failed request produces a
/// response carrying its error and the worker moves on to the next one.
pub struct InferenceWorker {
    state: Arc<Mutex<WorkerState>>,
    req_tx: Option<mpsc::Sender<Job>>,
    rep_rx: Mutex<mpsc::Receiver<PredictResponse>>,
    handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InferenceWorker {
    /// Spawn the worker thread, which takes ownership of the dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<Job>();
        let (rep_tx, rep_rx) = mpsc::channel::<PredictResponse>();
        let state = Arc::new(Mutex::new(WorkerState::Idle));

        let handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(Job { id, request }) = req_rx.recv() {
                    log::debug!("Running request {id}");

                    *lock(&state) = WorkerState::Processing;
                    let start_time = Instant::now();

                    let result = dispatcher.predict(
                        &request.image,
                        &request.task,
                        request.question.as_deref(),
                    );

                    match &result {
                        Ok(_) => log::debug!("Request {id} completed"),
                        Err(e) => log::warn!("Request {id} failed: {e}"),
                    }

                    let response = PredictResponse {
                        id,
                        task: request.task,
                        question: request.question,
                        start_time,
                        duration: start_time.elapsed(),
                        result,
                    };
                    *lock(&state) = WorkerState::Idle;

                    if rep_tx.send(response).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            rep_rx: Mutex::new(rep_rx),
            handle: Some(handle),
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.state).clone()
    }

    /// Queue a request and return its identifier, or `None` once the worker is stopped.
    pub fn schedule(&self, request: PredictRequest) -> Option<u64> {
        let tx = self.req_tx.as_ref()?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        tx.send(Job { id, request }).ok()?;
        Some(id)
    }

    /// Take the next finished response without blocking.
    pub fn try_poll_response(&self) -> WorkerResult {
        match lock(&self.rep_rx).try_recv() {
            Ok(response) => WorkerResult::Completed(response),
            Err(mpsc::TryRecvError::Empty) => WorkerResult::Empty(self.state()),
            Err(mpsc::TryRecvError::Disconnected) => {
                log::error!("Response channel disconnected");
                WorkerResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Wait up to `timeout` for the next finished response.
    pub fn poll_response_timeout(&self, timeout: Duration) -> WorkerResult {
        match lock(&self.rep_rx).recv_timeout(timeout) {
            Ok(response) => WorkerResult::Completed(response),
            Err(mpsc::RecvTimeoutError::Timeout) => WorkerResult::Empty(self.state()),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::error!("Response channel disconnected");
                WorkerResult::Error("Response channel disconnected".to_string())
            }
        }
    }

    /// Close the request queue and wait for the pending requests to finish.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Engine, ImagePreprocessor, NormalizedTensor};
    use kornia_image::{Image, ImageSize, allocator::CpuAllocator};

    struct Echo {
        preprocessor: ImagePreprocessor,
        resolution: usize,
    }

    impl Engine for Echo {
        fn name(&self) -> &str {
            "echo"
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
            Ok(format!("{} {}", pixels.resolution(), question.unwrap_or("-")))
        }
    }

    fn worker() -> InferenceWorker {
        let engine = |resolution| Echo {
            preprocessor: ImagePreprocessor::default(),
            resolution,
        };
        InferenceWorker::new(Dispatcher::new(engine(8), engine(12)))
    }

    fn request(task: &str, question: Option<&str>) -> Result<PredictRequest, BlipError> {
        let image = Image::new(
            ImageSize {
                width: 4,
                height: 4,
            },
            vec![0u8; 4 * 4 * 3],
            CpuAllocator,
        )
        .map_err(|e| BlipError::InvalidImage(e.to_string()))?;
        Ok(PredictRequest {
            image,
            task: task.to_string(),
            question: question.map(str::to_string),
        })
    }

    fn next(worker: &InferenceWorker) -> PredictResponse {
        match worker.poll_response_timeout(Duration::from_secs(10)) {
            WorkerResult::Completed(response) => response,
            other => panic!("no response: {other:?}"),
        }
    }

    #[test]
    fn responses_keep_scheduling_order() -> Result<(), BlipError> {
        let worker = worker();
        let first = worker.schedule(request("Image Captioning", Some("ignored"))?);
        let second = worker.schedule(request("vqa", Some("what?"))?);
        assert_eq!((first, second), (Some(0), Some(1)));

        let response = next(&worker);
        assert_eq!(response.id, 0);
        assert_eq!(response.result?, "8 -");

        let response = next(&worker);
        assert_eq!(response.id, 1);
        assert_eq!(response.question.as_deref(), Some("what?"));
        assert_eq!(response.result?, "12 what?");
        Ok(())
    }

    #[test]
    fn worker_survives_failed_requests() -> Result<(), BlipError> {
        let worker = worker();
        worker.schedule(request("Translate", None)?);
        worker.schedule(request("Visual Question Answering", None)?);
        worker.schedule(request("captioning", None)?);

        assert!(matches!(
            next(&worker).result,
            Err(BlipError::UnsupportedTask(_))
        ));
        assert!(matches!(
            next(&worker).result,
            Err(BlipError::MissingQuestion)
        ));
        assert_eq!(next(&worker).result?, "8 -");
        Ok(())
    }

    #[test]
    fn idle_worker_has_nothing_to_poll() {
        let worker = worker();
        assert!(matches!(
            worker.try_poll_response(),
            WorkerResult::Empty(WorkerState::Idle)
        ));
    }

    #[test]
    fn stopped_worker_rejects_requests() -> Result<(), BlipError> {
        let mut worker = worker();
        worker.stop();
        assert_eq!(worker.schedule(request("captioning", None)?), None);
        Ok(())
    }
}
