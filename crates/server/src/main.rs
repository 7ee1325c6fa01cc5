//! Prism Server
//!
//! Axum gateway for the comment analysis pipeline: accepts comment
//! batches over REST, drives the analysis driver, and streams the wire
//! protocol to subscribed WebSocket observers.

mod driver;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use prism_core::bus::EventBus;
use prism_core::client::{ChannelTransport, JobObserver};
use prism_core::protocol::{ClientMessage, ServerMessage, SubscriptionConfirmed};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, RwLock},
};
use utoipa::{OpenApi, ToSchema};

use driver::{spawn_analysis, AnalysisJob, DriverConfig, SubmittedComment};

/// Application state
struct AppState {
    /// Protocol stream every WebSocket observer taps into
    stream_tx: broadcast::Sender<ServerMessage>,
    /// Known jobs by ID
    jobs: RwLock<HashMap<String, JobRecord>>,
    /// Closed insight vocabulary for this deployment
    vocabulary: Vec<String>,
    job_seq: AtomicU64,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize, ToSchema)]
struct SubmitJobRequest {
    /// Free-text comments to analyze as one batch
    comments: Vec<String>,
}

#[derive(Serialize, ToSchema)]
struct SubmitJobResponse {
    job_id: String,
    comment_ids: Vec<String>,
}

#[derive(Serialize, Clone, ToSchema)]
struct JobRecord {
    job_id: String,
    comment_ids: Vec<String>,
}

#[derive(Serialize, ToSchema)]
struct JobListResponse {
    jobs: Vec<JobRecord>,
}

#[derive(Serialize, ToSchema)]
struct ApiResponse {
    success: bool,
    message: String,
}

// === OpenAPI ===

#[derive(OpenApi)]
#[openapi(
    paths(submit_job, list_jobs, health),
    components(schemas(
        SubmitJobRequest,
        SubmitJobResponse,
        JobRecord,
        JobListResponse,
        ApiResponse
    ))
)]
struct ApiDoc;

// === REST Handlers ===

/// Submit a comment batch for analysis
#[utoipa::path(
    post,
    path = "/api/v1/jobs",
    tag = "jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 200, description = "Job accepted", body = SubmitJobResponse),
        (status = 400, description = "Empty batch", body = ApiResponse)
    )
)]
async fn submit_job(
    State(state): State<SharedState>,
    Json(req): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    if req.comments.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!(ApiResponse {
                success: false,
                message: "a job needs at least one comment".to_string(),
            })),
        );
    }

    let seq = state.job_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let job_id = format!("job-{seq}");

    let comments: Vec<SubmittedComment> = req
        .comments
        .iter()
        .enumerate()
        .map(|(i, text)| SubmittedComment {
            id: format!("{job_id}-c{}", i + 1),
            text: text.clone(),
        })
        .collect();
    let comment_ids: Vec<String> = comments.iter().map(|c| c.id.clone()).collect();

    state.jobs.write().await.insert(
        job_id.clone(),
        JobRecord {
            job_id: job_id.clone(),
            comment_ids: comment_ids.clone(),
        },
    );

    spawn_analysis(
        AnalysisJob {
            job_id: job_id.clone(),
            comments,
        },
        DriverConfig {
            vocabulary: state.vocabulary.clone(),
            ..DriverConfig::default()
        },
        state.stream_tx.clone(),
    );

    tracing::info!(job_id = %job_id, comments = comment_ids.len(), "job submitted");

    (
        StatusCode::OK,
        Json(serde_json::json!(SubmitJobResponse {
            job_id,
            comment_ids,
        })),
    )
}

/// List known jobs
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    tag = "jobs",
    responses((status = 200, description = "Known jobs", body = JobListResponse))
)]
async fn list_jobs(State(state): State<SharedState>) -> Json<JobListResponse> {
    let jobs = state.jobs.read().await.values().cloned().collect();
    Json(JobListResponse { jobs })
}

/// Liveness check
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "meta",
    responses((status = 200, description = "Server is up", body = ApiResponse))
)]
async fn health() -> Json<ApiResponse> {
    Json(ApiResponse {
        success: true,
        message: "ok".to_string(),
    })
}

async fn serve_openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// === WebSocket Handler ===

async fn ws_stream(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let stream_rx = state.stream_tx.subscribe();
    ws.on_upgrade(move |socket| handle_stream_socket(socket, stream_rx))
}

/// One observer connection: greet, honor `subscribe:jobs`, and forward
/// the protocol stream. Job-scoped `state:changed` messages only reach
/// sockets subscribed to that job; everything else is connection-scoped
/// (clients need `job:started` in order to know what to subscribe to).
async fn handle_stream_socket(
    socket: WebSocket,
    mut stream_rx: broadcast::Receiver<ServerMessage>,
) {
    let (mut sender, mut receiver) = socket.split();
    let subscriptions = Arc::new(RwLock::new(HashSet::<String>::new()));

    // Outbound funnel so the forward and receive tasks can both write
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    if out_tx.send(ServerMessage::ConnectionEstablished).await.is_err() {
        return;
    }

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg.to_json() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode protocol message"),
            }
        }
    });

    let subs = Arc::clone(&subscriptions);
    let forward_tx = out_tx.clone();
    let mut forward_task = tokio::spawn(async move {
        loop {
            match stream_rx.recv().await {
                Ok(msg) => {
                    let wanted = match &msg {
                        ServerMessage::StateChanged(change) => {
                            subs.read().await.contains(&change.job_id)
                        }
                        _ => true,
                    };
                    if wanted && forward_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket observer lagged behind the stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let subs = Arc::clone(&subscriptions);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::SubscribeJobs { job_ids }) => {
                        {
                            let mut guard = subs.write().await;
                            for id in &job_ids {
                                guard.insert(id.clone());
                            }
                        }
                        let confirmed = ServerMessage::SubscriptionConfirmed(
                            SubscriptionConfirmed { job_ids },
                        );
                        if out_tx.send(confirmed).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed client message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // First task to finish tears the connection down
    tokio::select! {
        _ = &mut write_task => {
            forward_task.abort();
            recv_task.abort();
        }
        _ = &mut forward_task => {
            write_task.abort();
            recv_task.abort();
        }
        _ = &mut recv_task => {
            write_task.abort();
            forward_task.abort();
        }
    }
}

// === Vocabulary ===

fn default_vocabulary() -> Vec<String> {
    [
        "Cannot schedule appointment",
        "App crashes frequently",
        "Billing is confusing",
        "Notifications are too frequent",
        "Search returns irrelevant results",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn load_vocabulary(path: Option<&PathBuf>) -> anyhow::Result<Vec<String>> {
    use anyhow::Context;

    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read vocabulary file {}", path.display()))?;
            let vocabulary: Vec<String> = serde_json::from_str(&raw)
                .with_context(|| format!("vocabulary file {} is not a JSON string array", path.display()))?;
            Ok(vocabulary)
        }
        None => Ok(default_vocabulary()),
    }
}

// === Demo Run ===

/// Offline end-to-end run: driver, observer, store, and bus wired
/// in-process, final store snapshot printed to stdout.
async fn run_demo(vocabulary: Vec<String>) -> anyhow::Result<()> {
    let (stream_tx, mut stream_rx) = broadcast::channel::<ServerMessage>(256);
    let (in_tx, in_rx) = mpsc::channel::<String>(256);
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(16);

    // Bridge the protocol stream into raw envelopes for the observer
    tokio::spawn(async move {
        while let Ok(msg) = stream_rx.recv().await {
            match msg.to_json() {
                Ok(text) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode protocol message"),
            }
        }
    });
    // Single in-process observer needs no subscription routing
    tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

    let comments = vec![
        SubmittedComment {
            id: "demo-c1".to_string(),
            text: "cannot schedule appointment".to_string(),
        },
        SubmittedComment {
            id: "demo-c2".to_string(),
            text: "App crashes".to_string(),
        },
        SubmittedComment {
            id: "demo-c3".to_string(),
            text: "the loyalty program is unclear".to_string(),
        },
    ];
    spawn_analysis(
        AnalysisJob {
            job_id: "demo".to_string(),
            comments,
        },
        DriverConfig {
            vocabulary,
            step_delay: Duration::from_millis(10),
        },
        stream_tx,
    );

    let mut observer = JobObserver::new(ChannelTransport::new(in_rx, out_tx), EventBus::new());
    let outcome = observer.run_until_terminal(Duration::from_secs(10)).await;

    let store = observer.store();
    let snapshot = store.read().await.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!(
        "outcome: {:?} (timed out: {})",
        outcome.status, outcome.timed_out
    );
    Ok(())
}

// === CLI ===

#[derive(Parser)]
#[command(name = "prism", about = "Prism comment analysis gateway")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the gateway server
    Serve {
        #[arg(long, default_value_t = 8080, env = "PRISM_PORT")]
        port: u16,
        /// JSON file with the insight vocabulary (string array)
        #[arg(long, env = "PRISM_VOCABULARY")]
        vocabulary: Option<PathBuf>,
    },
    /// Run one simulated analysis offline and print the store snapshot
    Demo {
        #[arg(long, env = "PRISM_VOCABULARY")]
        vocabulary: Option<PathBuf>,
    },
}

// === Server Entry ===

async fn run_server(port: u16, vocabulary: Vec<String>) -> anyhow::Result<()> {
    let (stream_tx, _) = broadcast::channel::<ServerMessage>(256);

    let state: SharedState = Arc::new(AppState {
        stream_tx,
        jobs: RwLock::new(HashMap::new()),
        vocabulary,
        job_seq: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/health", get(health))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .route("/api/v1/ws", get(ws_stream))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("Prism gateway running at http://{addr}");
    println!("   Jobs:    POST/GET /api/v1/jobs");
    println!("   Stream:  GET /api/v1/ws (WebSocket)");
    println!("   OpenAPI: GET /api/v1/openapi.json");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Some(CliCommand::Demo { vocabulary }) => {
            let vocabulary = load_vocabulary(vocabulary.as_ref())?;
            run_demo(vocabulary).await
        }
        Some(CliCommand::Serve { port, vocabulary }) => {
            let vocabulary = load_vocabulary(vocabulary.as_ref())?;
            run_server(port, vocabulary).await
        }
        None => run_server(8080, default_vocabulary()).await,
    }
}
