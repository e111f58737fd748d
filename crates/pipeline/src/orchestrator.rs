//! Job orchestration.
//!
//! Owns the job store and per-job workspaces, schedules stage workers
//! up to the configured parallelism, publishes progress, observes
//! cancellation at stage boundaries and 64-frame checkpoints, rolls
//! stage failures into the published error taxonomy while preserving
//! partial results, and routes the capture-editor operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use drumsheet_core::config::{self, HatConfig, OpencvAccelPref, UpscaleEnginePref};
use drumsheet_core::geometry::Quad;
use drumsheet_core::layout::{fallback_region, resolve_layout, LayoutHint, LayoutMode};
use drumsheet_core::manifest::{Manifest, RuntimeInfo, SourceResolution};
use drumsheet_core::options::{ExportFormat, ExportOptions, JobOptions};
use drumsheet_core::workspace::{path_size_bytes, JobWorkspace};

use crate::capabilities::{Accelerator, Capabilities, SystemAccelerator};
use crate::dedup::{select_captures, CaptureSignature};
use crate::editor;
use crate::error::PipelineError;
use crate::ffmpeg::{self, ExtractRequest, FfmpegRuntime, CANCEL_CHECKPOINT_FRAMES};
use crate::frame::FrameSequence;
use crate::hat::{detect_hat_runtime, HatRuntime};
use crate::job::{JobContext, JobSnapshot, JobState, JobStep, JobStore, LogSink};
use crate::rectify::{rectify_image, ContentBox, RectifiedCapture};
use crate::source::{ClipFetcher, ResolvedSource, SourceDescriptor, SourceResolver};
use crate::stitch::{assemble_pages, PageCandidate};
use crate::tracker::{RoiTracker, TrackEvent};
use crate::upscale;

/// How long a job waits for the process-wide GPU lock before falling
/// back to CPU behaviour for the upscale stage.
pub const DEFAULT_GPU_HOLD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub jobs_root: PathBuf,
    /// Concurrent jobs; defaults to half the CPU cores, at least one.
    pub parallelism: usize,
    pub gpu_hold_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let jobs_root = config::env_string(config::ENV_JOBS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("jobs"));
        Self {
            jobs_root,
            parallelism: default_parallelism(),
            gpu_hold_timeout: DEFAULT_GPU_HOLD_TIMEOUT,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheUsage {
    pub total_paths: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheClearOutcome {
    pub cleared_paths: usize,
    pub cleared_jobs: usize,
    pub reclaimed_bytes: u64,
    pub skipped_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureCropOutcome {
    pub capture_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub version: u64,
}

/// Shared handles a worker task needs; cheap to clone into the task.
#[derive(Clone)]
struct WorkerCtx {
    store: Arc<JobStore>,
    runtime: Arc<FfmpegRuntime>,
    capabilities: Arc<Capabilities>,
    hat: Arc<HatRuntime>,
    resolver: Arc<dyn SourceResolver>,
    semaphore: Arc<Semaphore>,
    gpu_lock: Arc<Mutex<()>>,
    gpu_hold_timeout: Duration,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    ctx: WorkerCtx,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        runtime: FfmpegRuntime,
        capabilities: Capabilities,
        hat: HatRuntime,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        let parallelism = config.parallelism.max(1);
        let ctx = WorkerCtx {
            store: Arc::new(JobStore::new()),
            runtime: Arc::new(runtime),
            capabilities: Arc::new(capabilities),
            hat: Arc::new(hat),
            resolver,
            semaphore: Arc::new(Semaphore::new(parallelism)),
            gpu_lock: Arc::new(Mutex::new(())),
            gpu_hold_timeout: config.gpu_hold_timeout,
        };
        Self { config, ctx }
    }

    /// Probe the environment and build a production orchestrator.
    pub async fn bootstrap(config: OrchestratorConfig) -> Self {
        let runtime = FfmpegRuntime::detect().await;
        let hat = detect_hat_runtime(HatConfig::from_env(), false);
        let accelerator = SystemAccelerator {
            runtime: &runtime,
            hat: &hat,
            opencv_pref: OpencvAccelPref::from_env(),
        };
        let capabilities = accelerator.probe().await;
        // Re-evaluate HAT now that the CUDA probe has run.
        let hat = detect_hat_runtime(HatConfig::from_env(), capabilities.cuda_available);
        let capabilities = Capabilities {
            hat_available: hat.available(),
            hat_reason: hat.status.as_str().to_string(),
            ..capabilities
        };
        let resolver = Arc::new(ClipFetcher::new(config.jobs_root.clone()));
        Self::new(config, runtime, capabilities, hat, resolver)
    }

    pub fn jobs_root(&self) -> &Path {
        &self.config.jobs_root
    }

    pub fn runtime_info(&self) -> RuntimeInfo {
        self.ctx.capabilities.runtime_info(None)
    }

    // -- Job lifecycle -------------------------------------------------------

    /// Validate and enqueue a job; the worker task starts immediately
    /// and waits for a parallelism slot.
    pub async fn submit(
        &self,
        source: SourceDescriptor,
        options: JobOptions,
    ) -> Result<String, PipelineError> {
        options.validate()?;
        match &source {
            SourceDescriptor::File { path } => {
                if !path.is_file() {
                    return Err(PipelineError::InputInvalid(format!(
                        "file_path does not exist: {}",
                        path.display()
                    )));
                }
            }
            SourceDescriptor::Remote { url } => {
                if url.trim().is_empty() {
                    return Err(PipelineError::InputInvalid(
                        "source URL must not be empty".into(),
                    ));
                }
            }
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let workspace = JobWorkspace::new(self.config.jobs_root.join(&job_id));
        workspace.ensure_dirs()?;
        let job = self.ctx.store.create(&job_id, workspace, source, options);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            run_job(ctx, job).await;
        });
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.ctx.store.snapshot(job_id)
    }

    pub fn files(&self, job_id: &str) -> Option<Manifest> {
        self.ctx.store.manifest(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        self.ctx.store.cancel(job_id)
    }

    /// Remove a finished job and its workspace from disk.
    pub async fn purge(&self, job_id: &str) -> Result<(), PipelineError> {
        let state = self
            .ctx
            .store
            .state(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job not found: {job_id}")))?;
        if !state.is_terminal() {
            return Err(PipelineError::Conflict("job is still running".into()));
        }
        let workspace = self.config.jobs_root.join(job_id);
        if workspace.exists() {
            tokio::fs::remove_dir_all(&workspace).await?;
        }
        self.ctx.store.remove(job_id);
        Ok(())
    }

    // -- Review / editing ----------------------------------------------------

    /// Re-run composition over a kept subset of the review candidates,
    /// overwriting the page images and PDF. A failure leaves the prior
    /// manifest and outputs intact.
    pub async fn review_export(
        &self,
        job_id: &str,
        keep_captures: Vec<String>,
        formats: Option<Vec<ExportFormat>>,
    ) -> Result<Manifest, PipelineError> {
        let job = self.require_idle_job(job_id)?;

        let export_options = ExportOptions {
            formats: formats.unwrap_or_else(|| job.options.export.normalized_formats()),
            include_raw_frames: false,
        };
        let scroll_mode = self.layout_mode_of(&job) == LayoutMode::FullScroll;

        let store = &self.ctx.store;
        store.set_state(
            job_id,
            JobState::Running,
            JobStep::Upscaling,
            1.0,
            "review export running",
        );

        let workspace = job.workspace.clone();
        let result = tokio::task::spawn_blocking(move || {
            editor::review_export(&workspace, &keep_captures, &export_options, scroll_mode)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("review export task failed: {e}")))?;

        match result {
            Ok((output, info, kept)) => {
                store.set_state(
                    job_id,
                    JobState::Running,
                    JobStep::Exporting,
                    1.0,
                    "review export writing pages",
                );
                let mut manifest = store.manifest(job_id).unwrap_or_default();
                manifest.output_dir = job.workspace.pages_dir().display().to_string();
                manifest.images = paths_to_strings(&output.images);
                manifest.pdf = output.pdf.map(|p| p.display().to_string());
                manifest.full_sheet = output.full_sheet.map(|p| p.display().to_string());
                manifest.review_candidates = kept
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                manifest.review_export = Some(info);
                store.set_manifest(job_id, manifest.clone());
                persist_manifest(store, &job);
                store.set_state(
                    job_id,
                    JobState::Done,
                    JobStep::Done,
                    1.0,
                    "review export finished",
                );
                store.log(job_id, format!("review export kept {} captures", info.kept_count));
                Ok(manifest)
            }
            Err(err) => {
                store.set_state(
                    job_id,
                    JobState::Done,
                    JobStep::Done,
                    1.0,
                    format!("review export failed: {err}"),
                );
                Err(err)
            }
        }
    }

    /// Re-crop a single produced capture with a quad in the capture's
    /// own pixel space.
    pub async fn crop_capture(
        &self,
        job_id: &str,
        capture_path: String,
        quad: Quad,
    ) -> Result<CaptureCropOutcome, PipelineError> {
        let job = self.require_idle_job(job_id)?;

        let workspace = job.workspace.clone();
        let crop = tokio::task::spawn_blocking(move || {
            editor::crop_capture(&workspace, &capture_path, &quad)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("capture crop task failed: {e}")))??;

        let path_text = crop.capture_path.display().to_string();
        let version = self.ctx.store.bump_capture_version(job_id, &path_text);
        self.ctx.store.log(
            job_id,
            format!("capture crop saved: {path_text} ({}x{})", crop.width, crop.height),
        );
        persist_manifest(&self.ctx.store, &job);

        Ok(CaptureCropOutcome {
            capture_path: crop.capture_path,
            width: crop.width,
            height: crop.height,
            version,
        })
    }

    fn require_idle_job(&self, job_id: &str) -> Result<JobContext, PipelineError> {
        let state = self
            .ctx
            .store
            .state(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job not found: {job_id}")))?;
        if !state.is_terminal() {
            return Err(PipelineError::Conflict("job is still running".into()));
        }
        self.ctx
            .store
            .context(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job not found: {job_id}")))
    }

    fn layout_mode_of(&self, job: &JobContext) -> LayoutMode {
        job_layout_mode(job)
    }

    // -- Previews ------------------------------------------------------------

    /// Resolve a source without extracting anything, for the player.
    pub async fn preview_source(
        &self,
        source: SourceDescriptor,
    ) -> Result<ResolvedSource, PipelineError> {
        self.ctx.resolver.resolve(&source, &silent_log()).await
    }

    /// Extract one preview frame near `at_sec` for the ROI chooser.
    pub async fn preview_frame(
        &self,
        source: SourceDescriptor,
        at_sec: f64,
    ) -> Result<PathBuf, PipelineError> {
        let resolved = self.ctx.resolver.resolve(&source, &silent_log()).await?;
        let preview_dir = self
            .config
            .jobs_root
            .join("_preview")
            .join(uuid::Uuid::new_v4().to_string());
        let out_path = preview_dir.join("preview_frame.png");
        self.ctx
            .runtime
            .extract_preview_frame(&resolved.video_path, &out_path, at_sec)
            .await
    }

    // -- Maintenance ---------------------------------------------------------

    pub fn cache_usage(&self) -> CacheUsage {
        let mut total_paths = 0usize;
        let mut total_bytes = 0u64;
        if let Ok(entries) = std::fs::read_dir(&self.config.jobs_root) {
            for entry in entries.flatten() {
                total_paths += 1;
                total_bytes += path_size_bytes(&entry.path());
            }
        }
        CacheUsage {
            total_paths,
            total_bytes,
        }
    }

    /// Delete every workspace and cached source under the jobs root.
    /// Blocked while any job is active.
    pub fn clear_cache(&self) -> Result<CacheClearOutcome, PipelineError> {
        if !self.ctx.store.active_job_ids().is_empty() {
            return Err(PipelineError::Conflict(
                "cache clear is blocked while jobs are running".into(),
            ));
        }

        let mut outcome = CacheClearOutcome {
            cleared_paths: 0,
            cleared_jobs: 0,
            reclaimed_bytes: 0,
            skipped_paths: Vec::new(),
        };
        let mut children: Vec<PathBuf> = std::fs::read_dir(&self.config.jobs_root)
            .map(|entries| entries.flatten().map(|e| e.path()).collect())
            .unwrap_or_default();
        children.sort();

        for child in children {
            let size = path_size_bytes(&child);
            let removed = if child.is_dir() {
                std::fs::remove_dir_all(&child)
            } else {
                std::fs::remove_file(&child)
            };
            match removed {
                Ok(()) => {
                    outcome.cleared_paths += 1;
                    outcome.reclaimed_bytes += size;
                }
                Err(err) => outcome.skipped_paths.push(format!(
                    "{}: {err}",
                    child.file_name().unwrap_or_default().to_string_lossy()
                )),
            }
        }
        outcome.cleared_jobs = self.ctx.store.clear_terminal();
        Ok(outcome)
    }
}

fn silent_log() -> LogSink {
    LogSink::silent()
}

/// Resolve the job's layout mode. The detect hint wins, the stitch
/// hint is consulted next, and `auto` falls back to the anchor quad's
/// aspect ratio.
fn job_layout_mode(job: &JobContext) -> LayoutMode {
    let hint = match job.options.detect.layout_hint {
        LayoutHint::Auto => job.options.stitch.layout_hint,
        explicit => explicit,
    };
    let aspect = job.options.detect.roi.map(|q| q.aspect_ratio());
    resolve_layout(hint, aspect)
}

fn paths_to_strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

/// Write the store's current manifest to the workspace.
fn persist_manifest(store: &JobStore, job: &JobContext) {
    if let Some(manifest) = store.manifest(&job.job_id) {
        if let Ok(json) = serde_json::to_vec_pretty(&manifest) {
            let _ = std::fs::write(job.workspace.manifest_path(), json);
        }
    }
}

/// Push a worker's in-progress manifest into the store and onto disk,
/// so partial results stay visible while the job runs.
fn publish_manifest(store: &JobStore, job: &JobContext, manifest: &Manifest) {
    store.set_manifest(&job.job_id, manifest.clone());
    if let Ok(json) = serde_json::to_vec_pretty(manifest) {
        let _ = std::fs::write(job.workspace.manifest_path(), json);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_job(ctx: WorkerCtx, job: JobContext) {
    let permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    // Baseline manifest so even an immediately cancelled job leaves a
    // readable record behind.
    let mut manifest = Manifest {
        output_dir: job.workspace.pages_dir().display().to_string(),
        ..Default::default()
    };
    ctx.store.set_manifest(&job.job_id, manifest.clone());
    persist_manifest(&ctx.store, &job);

    if job.cancel.is_cancelled() {
        ctx.store
            .set_error(&job.job_id, PipelineError::Cancelled.error_code(), "job cancelled");
        return;
    }

    ctx.store.log(&job.job_id, "job started");
    ctx.store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Initializing,
        0.01,
        "initializing pipeline",
    );

    let result = run_pipeline(&ctx, &job, &mut manifest).await;
    ctx.store.set_manifest(&job.job_id, manifest);
    match result {
        Ok(()) => {
            ctx.store.set_state(
                &job.job_id,
                JobState::Done,
                JobStep::Done,
                1.0,
                "export finished",
            );
            ctx.store.log(&job.job_id, "job finished");
        }
        Err(err) => {
            let code = err.error_code();
            ctx.store.log(&job.job_id, format!("job failed: {err}"));
            ctx.store
                .set_error(&job.job_id, code, format!("job failed: {err}"));
        }
    }
    persist_manifest(&ctx.store, &job);
    drop(permit);
}

async fn run_pipeline(
    ctx: &WorkerCtx,
    job: &JobContext,
    manifest: &mut Manifest,
) -> Result<(), PipelineError> {
    let store = ctx.store.clone();
    let log = {
        let store = store.clone();
        let job_id = job.job_id.clone();
        LogSink::new(move |message| store.log(&job_id, message))
    };

    // -- Source --------------------------------------------------------------
    let resolved = tokio::select! {
        _ = job.cancel.cancelled() => return Err(PipelineError::Cancelled),
        resolved = ctx.resolver.resolve(&job.source, &log) => resolved?,
    };
    log.log(format!("source ready: {}", resolved.video_path.display()));

    let probe = ctx.runtime.probe_video(&resolved.video_path).await.ok();
    let source_resolution = probe.as_ref().and_then(ffmpeg::parse_resolution);
    let duration = probe.as_ref().map(ffmpeg::parse_duration).unwrap_or(0.0);
    if let Some((width, height)) = source_resolution {
        manifest.source_resolution = Some(SourceResolution { width, height });
        log.log(format!("source resolution: {width}x{height}"));
    }

    // -- Extract -------------------------------------------------------------
    let extract = &job.options.extract;
    let fps = extract.effective_fps();
    store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Extracting,
        0.05,
        "starting frame extraction",
    );
    log.log(format!(
        "capture sensitivity {:?}, sampling fps {fps:.2}",
        extract.sensitivity
    ));

    let window_end = extract.end_sec.unwrap_or(duration.max(0.0));
    let window = (window_end - extract.start_sec.unwrap_or(0.0)).max(0.0);
    let expected_frames = (window * fps).ceil().max(1.0);

    let frames_dir = job.workspace.frames_dir();
    let outcome = {
        let store = store.clone();
        let job_id = job.job_id.clone();
        let mut on_progress = move |frame: u64| {
            let ratio = (frame as f64 / expected_frames).min(1.0) as f32;
            store.set_state(
                &job_id,
                JobState::Running,
                JobStep::Extracting,
                0.05 + ratio * 0.15,
                format!("extracting frames ({frame} decoded)"),
            );
        };
        ctx.runtime
            .extract_frames(
                ExtractRequest {
                    video: &resolved.video_path,
                    out_dir: &frames_dir,
                    fps,
                    start_sec: extract.start_sec,
                    end_sec: extract.end_sec,
                },
                &job.cancel,
                &mut on_progress,
            )
            .await?
    };
    log.log(format!(
        "extracted {} frames ({})",
        outcome.frames.len(),
        outcome.decode_mode
    ));
    manifest.runtime = Some(ctx.capabilities.runtime_info(Some(&outcome.decode_mode)));

    let frames = FrameSequence::new(outcome.frames, fps);
    if frames.is_empty() {
        return Err(PipelineError::DecodeFailed(
            "no frames were extracted from source".into(),
        ));
    }
    if manifest.source_resolution.is_none() {
        let first = frames.load(0)?;
        let (width, height) = first.image.dimensions();
        manifest.source_resolution = Some(SourceResolution { width, height });
    }
    store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Detecting,
        0.2,
        "frame extraction completed",
    );

    // -- Detect --------------------------------------------------------------
    let first = frames.load(0)?;
    let (frame_w, frame_h) = first.image.dimensions();
    let mode = job_layout_mode(job);
    let anchor = match job.options.detect.roi {
        Some(quad) => {
            quad.validate_in_frame(frame_w as f32, frame_h as f32)?;
            quad
        }
        None => {
            log.log("no roi supplied, using the layout fallback region");
            fallback_region(mode, frame_w as f32, frame_h as f32)
        }
    };
    log.log(format!("layout mode selected: {}", mode.as_str()));

    let tracked = {
        let store = store.clone();
        let job = job.clone();
        let frames = FrameSequence::new(frames.paths().to_vec(), fps);
        tokio::task::spawn_blocking(move || {
            detect_stage(&store, &job, &frames, anchor, mode, frame_w, frame_h)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("detect stage panicked: {e}")))??
    };
    store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Rectifying,
        0.45,
        "sheet detection completed",
    );

    // -- Rectify -------------------------------------------------------------
    let rectified = {
        let store = store.clone();
        let job = job.clone();
        let frames = FrameSequence::new(frames.paths().to_vec(), fps);
        tokio::task::spawn_blocking(move || rectify_stage(&store, &job, &frames, tracked))
            .await
            .map_err(|e| PipelineError::Internal(format!("rectify stage panicked: {e}")))??
    };
    manifest.review_candidates = rectified.iter().map(|r| r.path.display().to_string()).collect();
    publish_manifest(&store, job, manifest);

    // -- Dedup + stitch ------------------------------------------------------
    let step = if mode == LayoutMode::FullScroll {
        JobStep::Stitching
    } else {
        JobStep::PageCluster
    };
    store.set_state(
        &job.job_id,
        JobState::Running,
        step,
        0.68,
        "rectification completed",
    );

    let stitch_options = job.options.stitch.clone();
    let dedupe_level = stitch_options.dedupe_level;
    let candidates = {
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            let signatures: Vec<CaptureSignature> =
                rectified.iter().map(|r| r.signature).collect();
            let kept = select_captures(&signatures, dedupe_level);
            if job.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let mut captures = Vec::with_capacity(kept.len());
            for index in kept {
                let record = &rectified[index];
                let image = image::open(&record.path)
                    .map_err(|e| {
                        PipelineError::Internal(format!("failed to reload capture: {e}"))
                    })?
                    .to_rgb8();
                captures.push(RectifiedCapture {
                    frame_index: record.signature.frame_index,
                    image,
                    hash: record.signature.hash,
                    content_box: record.content_box,
                });
            }
            let candidates = assemble_pages(captures, &stitch_options, mode)?;
            let stitched_paths =
                save_numbered(&job.workspace.stitched_dir(), "page", &candidates)?;
            Ok((candidates, stitched_paths))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("stitch stage panicked: {e}")))??
    };
    let (candidates, stitched_paths) = candidates;
    if candidates.is_empty() {
        return Err(PipelineError::StitchFailed(
            "no page candidates were produced".into(),
        ));
    }
    manifest.review_candidates = paths_to_strings(&stitched_paths);
    log.log(format!("page candidates: {}", candidates.len()));

    // -- Upscale -------------------------------------------------------------
    store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Upscaling,
        0.82,
        if mode == LayoutMode::FullScroll {
            "stitching completed"
        } else {
            "page clustering completed"
        },
    );
    if job.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let outcome = upscale_stage(ctx, job, candidates, &log).await?;
    let upscaled = outcome.engine.is_some();
    let candidates = outcome.pages;

    if upscaled {
        let paths = save_numbered(&job.workspace.upscaled_dir(), "upscaled", &candidates)?;
        manifest.upscaled_frames = paths_to_strings(&paths);
        manifest.review_candidates = manifest.upscaled_frames.clone();
    } else {
        manifest.upscaled_frames = Vec::new();
    }
    store.set_state(
        &job.job_id,
        JobState::Running,
        JobStep::Exporting,
        0.92,
        if upscaled {
            "upscaling completed"
        } else {
            "upscaling skipped"
        },
    );
    publish_manifest(&store, job, manifest);

    // -- Export --------------------------------------------------------------
    if job.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let export_options = job.options.export.clone();
    let scroll_mode = mode == LayoutMode::FullScroll;
    let include_raw = export_options.include_raw_frames;
    let output = {
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            crate::compose::compose_pages(
                &candidates,
                &export_options,
                scroll_mode,
                &job.workspace.pages_dir(),
                &job.workspace.pdf_path(),
            )
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("export stage panicked: {e}")))??
    };

    if include_raw {
        let raw_dir = job.workspace.root().join("raw_frames");
        std::fs::create_dir_all(&raw_dir)?;
        for (index, frame_path) in frames.paths().iter().enumerate() {
            let target = raw_dir.join(format!("raw_{index:05}.png"));
            std::fs::copy(frame_path, &target)?;
            manifest.raw_frames.push(target.display().to_string());
        }
    }

    manifest.images = paths_to_strings(&output.images);
    manifest.pdf = output.pdf.map(|p| p.display().to_string());
    manifest.full_sheet = output.full_sheet.map(|p| p.display().to_string());
    manifest.output_dir = job.workspace.pages_dir().display().to_string();
    Ok(())
}

/// Capture written to disk during the rectify stage.
struct CaptureRecord {
    path: PathBuf,
    signature: CaptureSignature,
    content_box: Option<ContentBox>,
}

fn detect_stage(
    store: &JobStore,
    job: &JobContext,
    frames: &FrameSequence,
    anchor: Quad,
    mode: LayoutMode,
    frame_w: u32,
    frame_h: u32,
) -> Result<Vec<(u64, Quad, TrackEvent)>, PipelineError> {
    let mut tracker = RoiTracker::new(anchor, mode, frame_w, frame_h);
    let total = frames.len().max(1);
    let mut tracked = Vec::with_capacity(frames.len());

    for (index, frame) in frames.iter().enumerate() {
        if index as u64 % CANCEL_CHECKPOINT_FRAMES == 0 && job.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let frame = frame?;
        let region = tracker.track(&frame.image);
        tracked.push((frame.index, region.quad, region.event));

        if index % 20 == 0 {
            let ratio = index as f32 / total as f32;
            store.set_state(
                &job.job_id,
                JobState::Running,
                JobStep::Detecting,
                0.2 + ratio * 0.25,
                format!("tracking roi ({}/{total})", index + 1),
            );
        }
    }
    Ok(tracked)
}

fn rectify_stage(
    store: &JobStore,
    job: &JobContext,
    frames: &FrameSequence,
    tracked: Vec<(u64, Quad, TrackEvent)>,
) -> Result<Vec<CaptureRecord>, PipelineError> {
    let out_dir = job.workspace.rectified_dir();
    let total = tracked.len().max(1);
    let mut records = Vec::with_capacity(tracked.len());

    for (index, (frame_index, quad, event)) in tracked.into_iter().enumerate() {
        if index as u64 % CANCEL_CHECKPOINT_FRAMES == 0 && job.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let frame = frames.load(index)?;
        let capture = rectify_image(&frame.image, &quad, frame_index)?;
        let path = out_dir.join(format!("sheet_{index:05}.png"));
        capture
            .image
            .save(&path)
            .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;

        records.push(CaptureRecord {
            path,
            signature: CaptureSignature {
                frame_index,
                hash: capture.hash,
                event,
            },
            content_box: capture.content_box,
        });

        if index % 20 == 0 {
            let ratio = index as f32 / total as f32;
            store.set_state(
                &job.job_id,
                JobState::Running,
                JobStep::Rectifying,
                0.45 + ratio * 0.23,
                format!("rectifying captures ({}/{total})", index + 1),
            );
        }
    }

    if records.is_empty() {
        return Err(PipelineError::TrackingLost(
            "rectification produced no captures".into(),
        ));
    }
    Ok(records)
}

/// Run the upscale stage, serializing GPU backends on the process-wide
/// lock. A job that cannot get the GPU within the hold timeout falls
/// back to pass-through unless it is `gpu_only`.
async fn upscale_stage(
    ctx: &WorkerCtx,
    job: &JobContext,
    candidates: Vec<PageCandidate>,
    log: &LogSink,
) -> Result<upscale::UpscaleOutcome, PipelineError> {
    let options = &job.options.upscale;
    if !options.enable {
        log.log("upscale disabled, using original resolution");
        return Ok(upscale::UpscaleOutcome {
            pages: candidates,
            engine: None,
        });
    }

    let Some(backend) = upscale::select_backend(&ctx.capabilities, UpscaleEnginePref::from_env())
    else {
        log.log("upscaling skipped: no usable backend");
        return upscale::pass_through(candidates, options);
    };

    let guard = match tokio::time::timeout(ctx.gpu_hold_timeout, ctx.gpu_lock.lock()).await {
        Ok(guard) => Some(guard),
        Err(_) if options.gpu_only => {
            // A gpu_only job must keep waiting for the device, but the
            // wait is still a stage boundary: cancellation wins.
            log.log("GPU busy past the hold timeout, waiting for the device");
            tokio::select! {
                _ = job.cancel.cancelled() => return Err(PipelineError::Cancelled),
                guard = ctx.gpu_lock.lock() => Some(guard),
            }
        }
        Err(_) => {
            log.log("upscaling skipped: GPU busy past the hold timeout");
            return upscale::pass_through(candidates, options);
        }
    };

    log.log(format!(
        "upscale enabled: engine {} factor {:.1}x",
        backend.as_str(),
        options.factor
    ));
    let outcome = upscale::run_backend(
        candidates,
        backend,
        options,
        &ctx.hat,
        &ctx.runtime,
        &job.workspace.upscaled_dir(),
        config::sharpen_enabled(),
    )
    .await;
    drop(guard);
    outcome
}

fn save_numbered(
    dir: &Path,
    stem: &str,
    candidates: &[PageCandidate],
) -> Result<Vec<PathBuf>, PipelineError> {
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
    let mut paths = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        let path = dir.join(format!("{stem}_{index:05}.png"));
        candidate
            .image
            .save(&path)
            .map_err(|e| PipelineError::ExportFailed(e.to_string()))?;
        paths.push(path);
    }
    Ok(paths)
}
