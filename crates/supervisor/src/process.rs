//! Runner subprocess supervision.
//!
//! Launching a runner means sizing the load, deriving launch flags,
//! spawning the process with its stderr captured, and polling `/health`
//! until it reports ready. Progress resets the stall timer; an early exit
//! surfaces the last diagnostic line, rewritten through a table of known
//! failure signatures. `close` is idempotent and waits for the process
//! exactly once.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tokenloom_common::{LoomError, Result, RunnerSettings, SupervisorSettings, METRICS};
use tokenloom_wire::{CompletionRequest, CompletionResponse, HealthResponse, RunnerStatus};

use crate::client::RunnerClient;
use crate::memory::{estimate_gpu_layers, GpuDevice, MemoryEstimate, ModelMetadata};

/// Captured stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Everything needed to launch one runner.
pub struct LaunchSpec {
    pub runner_binary: PathBuf,
    pub model_path: PathBuf,
    pub metadata: ModelMetadata,
    pub gpus: Vec<GpuDevice>,
    pub settings: RunnerSettings,
    pub supervisor: SupervisorSettings,

    /// Free system memory as reported by the environment layer, when
    /// known. The host-resident part of the load must fit inside it.
    pub system_memory_free: Option<u64>,

    /// Directories prepended to the dynamic library search path so the
    /// runner finds the compute-engine build matching the host.
    pub library_paths: Vec<PathBuf>,
}

/// A supervised runner process and its proxy client.
#[derive(Debug)]
pub struct RunnerProcess {
    model: String,
    port: u16,
    estimate: MemoryEstimate,
    client: RunnerClient,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    settings: SupervisorSettings,
}

impl RunnerProcess {
    /// Size the load, derive flags and spawn the runner. Does not wait for
    /// readiness; call [`RunnerProcess::wait_until_ready`] next.
    pub async fn launch(spec: LaunchSpec) -> Result<Self> {
        let estimate = estimate_gpu_layers(
            &spec.metadata,
            &spec.gpus,
            &spec.settings,
            spec.supervisor.gpu_overhead_bytes,
        );

        if let Some(free) = spec.system_memory_free {
            let host_size = estimate.total_size.saturating_sub(estimate.vram_size);
            if host_size > free {
                return Err(LoomError::resource(format!(
                    "model requires {} MiB of system memory, {} MiB available",
                    host_size / (1024 * 1024),
                    free / (1024 * 1024)
                )));
            }
        }

        // CPU fallback keeps the same flag surface with zero GPU layers.
        let gpus: &[GpuDevice] = if estimate.cpu_only() { &[] } else { &spec.gpus };

        let port = free_port()?;
        let args = launch_flags(&spec, &estimate, gpus, port);

        info!(
            model = %spec.metadata.name,
            port,
            layers = estimate.layers,
            "launching runner"
        );
        debug!(?args, "runner arguments");

        let mut command = Command::new(&spec.runner_binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !spec.library_paths.is_empty() {
            let mut paths: Vec<PathBuf> = spec.library_paths.clone();
            if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            if let Ok(joined) = std::env::join_paths(&paths) {
                command.env("LD_LIBRARY_PATH", joined);
            }
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                LoomError::process(format!(
                    "runner binary {} is not executable (permission denied or noexec mount)",
                    spec.runner_binary.display()
                ))
            } else {
                LoomError::process(format!("failed to start runner: {}", e))
            }
        })?;

        METRICS.supervisor.runners_launched_total.inc();

        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "runner", "{}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(Self {
            model: spec.metadata.name,
            port,
            estimate,
            client: RunnerClient::new(port),
            child: Mutex::new(Some(child)),
            stderr_tail,
            settings: spec.supervisor,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn estimate(&self) -> &MemoryEstimate {
        &self.estimate
    }

    /// Most recent diagnostic line the runner wrote, if any.
    pub fn last_diagnostic(&self) -> Option<String> {
        self.stderr_tail.lock().back().cloned()
    }

    /// Poll `/health` until the runner reports ready.
    ///
    /// Load progress resets the stall timer; reaching 100% still requires
    /// polling until the process says `ok`, which covers post-load
    /// initialization. An exit before readiness fails with the last
    /// captured diagnostic, rewritten when the signature is known.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let started = Instant::now();
        let stall = self.settings.load_timeout();
        let mut deadline = Instant::now() + stall;
        let mut last_progress = 0.0f32;

        loop {
            if let Some(status) = self.try_wait().await {
                METRICS.supervisor.runner_exits_total.inc();
                let diagnostic = self
                    .last_diagnostic()
                    .map(|line| rewrite_diagnostic(&line))
                    .unwrap_or_else(|| "runner produced no diagnostics".to_string());
                return Err(LoomError::process(format!(
                    "runner exited before becoming ready ({}): {}",
                    status, diagnostic
                )));
            }

            match self.client.health().await {
                Ok(HealthResponse { status, progress }) => {
                    match RunnerStatus::parse(&status) {
                        RunnerStatus::Ready => {
                            METRICS
                                .supervisor
                                .load_duration
                                .observe(started.elapsed().as_secs_f64());
                            info!(model = %self.model, elapsed = ?started.elapsed(), "runner ready");
                            return Ok(());
                        }
                        RunnerStatus::LoadingModel | RunnerStatus::NoSlotsAvailable => {
                            if progress > last_progress {
                                last_progress = progress;
                                deadline = Instant::now() + stall;
                                debug!(model = %self.model, progress, "load progress");
                            }
                        }
                        RunnerStatus::Error => {
                            return Err(LoomError::process(rewrite_diagnostic(&status)));
                        }
                    }
                }
                Err(_) => {
                    // Not listening yet; the stall timer bounds this.
                }
            }

            if Instant::now() > deadline {
                return Err(LoomError::stall(format!(
                    "no load progress for {:?} (last progress {:.0}%)",
                    stall,
                    last_progress * 100.0
                )));
            }

            tokio::time::sleep(self.settings.health_poll()).await;
        }
    }

    /// Wait for the runner to have a free sequence slot, retrying a
    /// bounded number of times before surfacing a capacity error.
    async fn wait_for_slot(&self) -> Result<()> {
        for attempt in 0..=self.settings.no_slot_retries {
            match self.client.health().await {
                Ok(h) => match RunnerStatus::parse(&h.status) {
                    RunnerStatus::Ready => return Ok(()),
                    RunnerStatus::NoSlotsAvailable => {
                        METRICS.supervisor.no_slot_retries_total.inc();
                        debug!(model = %self.model, attempt, "runner has no free slot");
                    }
                    RunnerStatus::LoadingModel => {}
                    RunnerStatus::Error => {
                        return Err(LoomError::process(rewrite_diagnostic(&h.status)));
                    }
                },
                Err(e) => {
                    if self.try_wait().await.is_some() {
                        METRICS.supervisor.runner_exits_total.inc();
                        return Err(LoomError::process(format!(
                            "runner exited while serving: {}",
                            self.last_diagnostic()
                                .map(|l| rewrite_diagnostic(&l))
                                .unwrap_or_else(|| e.to_string())
                        )));
                    }
                }
            }
            tokio::time::sleep(self.settings.no_slot_backoff()).await;
        }

        Err(LoomError::capacity(format!(
            "no runner slot available after {} retries",
            self.settings.no_slot_retries
        )))
    }

    /// Proxy a completion, streaming content lines to `tx`.
    pub async fn completion(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<CompletionResponse>,
    ) -> Result<CompletionResponse> {
        self.wait_for_slot().await?;
        self.client.completion(req, tx).await
    }

    /// Proxy an embedding request.
    pub async fn embedding(&self, content: &str, cache_prompt: bool) -> Result<Vec<f32>> {
        self.wait_for_slot().await?;
        self.client.embedding(content, cache_prompt).await
    }

    /// One health probe against the runner.
    pub async fn health(&self) -> Result<HealthResponse> {
        self.client.health().await
    }

    async fn try_wait(&self) -> Option<std::process::ExitStatus> {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => c.try_wait().ok().flatten(),
            None => None,
        }
    }

    /// Kill the runner and collect its exit status. Idempotent: the first
    /// call kills and waits, later calls are no-ops.
    pub async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut c) = child.take() {
            info!(model = %self.model, "stopping runner");
            if let Err(e) = c.kill().await {
                warn!(model = %self.model, error = %e, "failed to kill runner");
            }
        }
    }
}

/// Derive the runner's command line from the load decision.
fn launch_flags(
    spec: &LaunchSpec,
    estimate: &MemoryEstimate,
    gpus: &[GpuDevice],
    port: u16,
) -> Vec<String> {
    let settings = &spec.settings;
    let mut args = vec![
        "--model".to_string(),
        spec.model_path.display().to_string(),
        "--ctx-size".to_string(),
        settings.ctx_size.to_string(),
        "--batch-size".to_string(),
        settings.batch_size.to_string(),
        "--parallel".to_string(),
        settings.parallel.to_string(),
        "--n-gpu-layers".to_string(),
        estimate.layers.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if settings.threads > 0 {
        args.push("--threads".to_string());
        args.push(settings.threads.to_string());
    }

    if !gpus.is_empty() {
        args.push("--main-gpu".to_string());
        args.push(settings.main_gpu.to_string());
    }

    if settings.flash_attention && gpus.iter().all(supports_flash_attention) && !gpus.is_empty() {
        args.push("--flash-attn".to_string());
    }

    if !estimate.tensor_split.is_empty() {
        let split: Vec<String> = estimate
            .tensor_split
            .iter()
            .map(|f| format!("{:.3}", f))
            .collect();
        args.push("--tensor-split".to_string());
        args.push(split.join(","));
    }

    if let Some(projector) = &settings.projector {
        args.push("--mmproj".to_string());
        args.push(projector.display().to_string());
    }

    if let Some(lora) = &settings.lora {
        args.push("--lora".to_string());
        args.push(lora.display().to_string());
        // Adapters patch weights in place; mapping the file read-only
        // would fault.
        args.push("--no-mmap".to_string());
    } else if settings.no_mmap {
        args.push("--no-mmap".to_string());
    }

    if settings.mlock {
        args.push("--mlock".to_string());
    }

    if settings.multiuser_cache {
        args.push("--multiuser-cache".to_string());
    }

    args
}

/// Whether a GPU generation handles flash attention.
pub fn supports_flash_attention(gpu: &GpuDevice) -> bool {
    match gpu.library.as_str() {
        "metal" => true,
        "cuda" => gpu.compute_major >= 7,
        _ => false,
    }
}

/// Rewrite known failure signatures into actionable messages. Unknown
/// lines pass through untouched.
pub fn rewrite_diagnostic(line: &str) -> String {
    const KNOWN: &[(&str, &str)] = &[
        (
            "unknown model architecture",
            "this model is not supported by the installed runner (unsupported model version)",
        ),
        (
            "unsupported model",
            "this model is not supported by the installed runner (unsupported model version)",
        ),
        (
            "out of memory",
            "insufficient memory to load the model on the selected device",
        ),
        (
            "failed to allocate",
            "insufficient memory to load the model on the selected device",
        ),
        (
            "permission denied",
            "runner binary could not be executed (permission denied or noexec mount)",
        ),
    ];

    let lowered = line.to_lowercase();
    for (needle, replacement) in KNOWN {
        if lowered.contains(needle) {
            return replacement.to_string();
        }
    }
    line.to_string()
}

/// Ask the kernel for a free loopback port.
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| LoomError::process(format!("no free loopback port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| LoomError::process(format!("no free loopback port: {}", e)))?
        .port();
    Ok(port)
}
