//! Queued object detection against a mock model.
//!
//! Detection is more expensive to retry than a chat completion, so this service runs the same
//! engine with a single retry. Jobs live in memory for the lifetime of the process.
use std::time::Duration;

use async_trait::async_trait;
use jobqueue::{prelude::*, store::memory::InMemoryStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const MAX_ATTEMPTS: u32 = 2;
const TRANSIENT_FAILURE_RATE: f64 = 0.2;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLASSES: [&str; 5] = ["person", "bicycle", "car", "dog", "traffic light"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DetectionRequest {
    image_url: String,
    #[serde(default = "default_confidence_threshold")]
    confidence_threshold: f64,
    #[serde(default = "default_model_size")]
    model_size: String,
}

fn default_confidence_threshold() -> f64 {
    0.25
}

fn default_model_size() -> String {
    "yolov8n".to_owned()
}

#[derive(Debug, Serialize)]
struct Detection {
    class_name: &'static str,
    confidence: f64,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

#[derive(Debug, Serialize)]
struct Detections {
    model_size: String,
    detections: Vec<Detection>,
}

struct MockDetection;

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn detect(confidence_threshold: f64) -> Vec<Detection> {
    let mut rng = rand::thread_rng();
    let candidates = rng.gen_range(0..8);
    (0..candidates)
        .map(|_| {
            let (x1, y1) = (rng.gen_range(0.0..600.0), rng.gen_range(0.0..400.0));
            Detection {
                class_name: CLASSES[rng.gen_range(0..CLASSES.len())],
                confidence: round_to(rng.gen_range(0.05..1.0), 4),
                x1: round_to(x1, 1),
                y1: round_to(y1, 1),
                x2: round_to(x1 + rng.gen_range(10.0..40.0), 1),
                y2: round_to(y1 + rng.gen_range(10.0..80.0), 1),
            }
        })
        .filter(|detection| detection.confidence >= confidence_threshold)
        .collect()
}

#[async_trait]
impl WorkFunction for MockDetection {
    type Request = DetectionRequest;
    type Output = Detections;
    const NAME: &'static str = "run_yolov8_detection";

    async fn call(
        &self,
        request: DetectionRequest,
        context: WorkContext,
    ) -> Result<Detections, WorkError> {
        if !(0.0..=1.0).contains(&request.confidence_threshold) {
            return Err(WorkError::permanent(format!(
                "confidence threshold {} is outside 0..=1",
                request.confidence_threshold
            ))
            .with_type("invalid_threshold"));
        }

        let latency = Duration::from_millis(rand::thread_rng().gen_range(200..800));
        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = context.cancellation.cancelled() => return Err(WorkError::cancelled()),
        }
        if rand::thread_rng().gen_bool(TRANSIENT_FAILURE_RATE) {
            return Err(WorkError::transient(format!(
                "Failed to fetch {}",
                request.image_url
            )));
        }

        Ok(Detections {
            detections: detect(request.confidence_threshold),
            model_size: request.model_size,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = QueueConfig::from_env()?.with_max_attempts(MAX_ATTEMPTS);
    let queue = JobQueue::start(InMemoryStore::new(), MockDetection, config).await?;
    let tokens = StaticTokens::new([("tok-carol-secret", "tenant-carol")]);
    let tenant_id = tokens.resolve("Bearer tok-carol-secret").await?;

    let requests = [
        DetectionRequest {
            image_url: "https://images.example/street.jpg".to_owned(),
            confidence_threshold: default_confidence_threshold(),
            model_size: default_model_size(),
        },
        DetectionRequest {
            image_url: "https://images.example/park.jpg".to_owned(),
            confidence_threshold: 0.6,
            model_size: "yolov8s".to_owned(),
        },
        DetectionRequest {
            image_url: "https://images.example/blurry.jpg".to_owned(),
            confidence_threshold: 1.5,
            model_size: default_model_size(),
        },
    ];
    let mut job_ids = Vec::new();
    for request in &requests {
        let receipt = queue.submit(&tenant_id, request).await?;
        println!("submitted {} as {}", request.image_url, receipt.job_id);
        job_ids.push(receipt.job_id);
    }

    for job_id in job_ids {
        let job = loop {
            let job = queue.get(&tenant_id, job_id).await?;
            if job.is_terminal() {
                break job;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        match (job.result, job.error) {
            (Some(result), _) => println!(
                "job {job_id} completed after {} attempt(s): {result}",
                job.attempt_count
            ),
            (None, Some(error)) => println!(
                "job {job_id} failed after {} attempt(s): {error}",
                job.attempt_count
            ),
            (None, None) => println!("job {job_id} is {}", job.status),
        }
    }

    for status in [JobStatus::Completed, JobStatus::Failed] {
        let jobs = queue.list(&tenant_id, Some(status)).await?;
        println!("{} job(s) {status}", jobs.len());
    }

    queue.graceful_shutdown().await?;
    Ok(())
}
