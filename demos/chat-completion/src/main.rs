//! Queued chat completions against a mock LLM.
//!
//! Two tenants submit chat requests, poll until their jobs are done and print the results. The
//! store location and engine settings are read from the `JOBQUEUE_*` environment variables.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobqueue::prelude::*;
use jobqueue_sqlx::JobQueueSqliteStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const TRANSIENT_FAILURE_RATE: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatRequest {
    #[serde(default = "default_model")]
    model: String,
    messages: Vec<Message>,
    #[serde(default = "default_temperature")]
    temperature: f64,
}

fn default_model() -> String {
    "mock-gpt".to_owned()
}

fn default_temperature() -> f64 {
    0.7
}

#[derive(Debug, Serialize)]
struct Choice {
    index: u32,
    message: Message,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ChatCompletion {
    id: String,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

/// Stands in for a hosted LLM: answers after one to four seconds and occasionally fails.
struct MockChatCompletion;

#[async_trait]
impl WorkFunction for MockChatCompletion {
    type Request = ChatRequest;
    type Output = ChatCompletion;
    const NAME: &'static str = "llm_chat_completion";

    async fn call(
        &self,
        request: ChatRequest,
        context: WorkContext,
    ) -> Result<ChatCompletion, WorkError> {
        let latency = Duration::from_secs_f64(1.0 + rand::thread_rng().gen::<f64>() * 3.0);
        tokio::select! {
            _ = tokio::time::sleep(latency) => {}
            _ = context.cancellation.cancelled() => return Err(WorkError::cancelled()),
        }

        if rand::thread_rng().gen_bool(TRANSIENT_FAILURE_RATE) {
            return Err(WorkError::transient("Simulated transient LLM API error"));
        }

        let last_user_message = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.chars().take(80).collect::<String>())
            .unwrap_or_default();
        let prompt_tokens = request
            .messages
            .iter()
            .map(|message| message.content.split_whitespace().count())
            .sum();
        let completion_tokens = rand::thread_rng().gen_range(20..=80);

        Ok(ChatCompletion {
            id: format!("mock-{}", Utc::now().timestamp_millis()),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_owned(),
                    content: format!(
                        "[MOCK] This is a simulated response to: '{last_user_message}'. \
                         Latency was {:.1}s.",
                        latency.as_secs_f64()
                    ),
                },
                finish_reason: "stop",
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}

fn chat(content: &str) -> ChatRequest {
    ChatRequest {
        model: default_model(),
        messages: vec![
            Message {
                role: "system".to_owned(),
                content: "You are a helpful assistant.".to_owned(),
            },
            Message {
                role: "user".to_owned(),
                content: content.to_owned(),
            },
        ],
        temperature: default_temperature(),
    }
}

async fn wait_for(
    queue: &JobQueue<JobQueueSqliteStore, MockChatCompletion>,
    tenant_id: &TenantId,
    job_id: JobId,
) -> Result<Job, JobQueueError> {
    loop {
        let status = queue.get_status(tenant_id, job_id).await?;
        if status.status.is_terminal() {
            return queue.get(tenant_id, job_id).await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = QueueConfig::from_env()?;
    let store = JobQueueSqliteStore::connect(&config.database_url).await?;
    let tokens = StaticTokens::new([
        ("tok-alice-secret", "tenant-alice"),
        ("tok-bob-secret", "tenant-bob"),
    ]);
    let queue = JobQueue::start(store, MockChatCompletion, config).await?;

    let alice = tokens.resolve("Bearer tok-alice-secret").await?;
    let bob = tokens.resolve("tok-bob-secret").await?;

    let mut submitted = Vec::new();
    for (tenant_id, prompt) in [
        (&alice, "Summarise the plot of Hamlet in two sentences."),
        (&alice, "What is the capital of Australia?"),
        (&bob, "Write a haiku about job queues."),
    ] {
        let receipt = queue.submit(tenant_id, &chat(prompt)).await?;
        println!("{tenant_id} submitted {}", serde_json::to_string(&receipt)?);
        submitted.push((tenant_id, receipt.job_id));
    }

    for (tenant_id, job_id) in &submitted {
        let job = wait_for(&queue, tenant_id, *job_id).await?;
        match (&job.result, &job.error) {
            (Some(result), _) => println!(
                "{tenant_id} job {job_id} completed after {} attempt(s):\n{}",
                job.attempt_count,
                serde_json::to_string_pretty(result)?
            ),
            (None, Some(error)) => println!(
                "{tenant_id} job {job_id} failed after {} attempt(s): {error}",
                job.attempt_count
            ),
            (None, None) => println!("{tenant_id} job {job_id} is {}", job.status),
        }
    }

    if let Some((_, job_id)) = submitted.first() {
        match queue.get_status(&bob, *job_id).await {
            Err(JobQueueError::NotFound(_)) => {
                println!("{bob} cannot see job {job_id} owned by {alice}")
            }
            other => println!("unexpected cross tenant lookup: {other:?}"),
        }
    }

    println!("{alice} has {} job(s)", queue.list(&alice, None).await?.len());

    queue.graceful_shutdown().await?;
    Ok(())
}
