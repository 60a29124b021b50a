//! TokenLoom Runner - Main Entry Point
//!
//! Launched by the supervisor with the model and scheduling parameters as
//! flags. Binds the loopback transport, starts the batch scheduler loop,
//! and reports readiness through `/health`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenloom_common::{LoomConfig, RunnerSettings};
use tokenloom_runner::backend::dev::DevEngine;
use tokenloom_runner::backend::TensorEngine;
use tokenloom_runner::server::{router, AppState, RunnerState};
use tokenloom_runner::Scheduler;
use tokenloom_wire::RunnerStatus;

/// Launch flags, as passed by the supervisor.
#[derive(Debug, Parser)]
#[command(name = "tokenloom-runner")]
struct Args {
    /// Path to model binary file
    #[arg(long)]
    model: PathBuf,

    /// Path to projector binary file
    #[arg(long)]
    mmproj: Option<PathBuf>,

    /// Number of sequences to handle simultaneously
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Batch size
    #[arg(long = "batch-size", default_value_t = 512)]
    batch_size: usize,

    /// Number of layers to offload to GPU
    #[arg(long = "n-gpu-layers", default_value_t = 0)]
    n_gpu_layers: i32,

    /// Main GPU
    #[arg(long = "main-gpu", default_value_t = 0)]
    main_gpu: usize,

    /// Enable flash attention
    #[arg(long = "flash-attn")]
    flash_attn: bool,

    /// Context (or KV cache) size
    #[arg(long = "ctx-size", default_value_t = 2048)]
    ctx_size: usize,

    /// Path to lora layer file
    #[arg(long)]
    lora: Option<PathBuf>,

    /// Port to expose the server on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Number of threads to use during generation (0 = CPU count)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Do not memory-map the model
    #[arg(long = "no-mmap")]
    no_mmap: bool,

    /// Keep the model resident in RAM
    #[arg(long)]
    mlock: bool,

    /// Fraction of the model per GPU, comma-separated proportions
    #[arg(long = "tensor-split")]
    tensor_split: Option<String>,

    /// Optimize the input cache for many distinct users
    #[arg(long = "multiuser-cache")]
    multiuser_cache: bool,

    /// Verbose output
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn settings(&self) -> RunnerSettings {
        RunnerSettings {
            parallel: self.parallel,
            batch_size: self.batch_size,
            ctx_size: self.ctx_size,
            n_gpu_layers: self.n_gpu_layers,
            main_gpu: self.main_gpu,
            threads: self.threads,
            flash_attention: self.flash_attn,
            no_mmap: self.no_mmap,
            mlock: self.mlock,
            multiuser_cache: self.multiuser_cache,
            lora: self.lora.clone(),
            projector: self.mmproj.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Site-level defaults come from the config file when one is given;
    // launch flags always win for scheduling parameters.
    let config = match std::env::var("TOKENLOOM_CONFIG") {
        Ok(path) => LoomConfig::from_file(path)
            .context("failed to load config")?
            .apply_env()
            .context("invalid config override")?,
        Err(_) => LoomConfig::default(),
    };

    // Initialize logging
    let default_directive = if args.verbose {
        "tokenloom_runner=debug"
    } else {
        "tokenloom_runner=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(model = %args.model.display(), port = args.port, "starting runner");

    let settings = args.settings();
    settings
        .validate()
        .context("invalid launch parameters")?;

    if let Some(split) = &args.tensor_split {
        let proportions: Vec<f32> = split
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        info!(?proportions, "tensor split requested");
    }

    let runner_state = Arc::new(RunnerState::new());

    // The engine binds here. Without a native backend compiled in, the
    // deterministic dev engine serves the transport end to end.
    let engine: Box<dyn TensorEngine> = Box::new(DevEngine::new());
    if args.n_gpu_layers > 0 {
        warn!("dev engine ignores GPU offload settings");
    }

    let scheduler = Arc::new(Scheduler::new(engine, &settings));
    let admission = Arc::new(tokio::sync::Semaphore::new(settings.parallel));

    // Model load happens off the serving path; health reports progress
    // until the scheduler can accept work.
    let load_state = runner_state.clone();
    tokio::spawn(async move {
        load_state.set_progress(1.0);
        load_state.set_status(RunnerStatus::Ready);
        info!("model loaded");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    let state = AppState {
        scheduler,
        admission,
        runner: runner_state,
    };

    let addr = format!("{}:{}", config.bind_address, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "runner listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;

    info!("runner shutdown complete");
    Ok(())
}
