//! Job state and the in-memory job store.
//!
//! One [`Job`] per submitted capture. The store hands out snapshot
//! views under a single lock, so `state`, `step`, `progress`, and
//! `message` are always mutually consistent, and progress never moves
//! backwards. The lock is a plain mutex with short critical sections;
//! stage code running on blocking threads updates progress through it
//! directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use drumsheet_core::error::ErrorCode;
use drumsheet_core::manifest::Manifest;
use drumsheet_core::options::JobOptions;
use drumsheet_core::workspace::JobWorkspace;

use crate::source::SourceDescriptor;

/// Messages a job may accumulate before the log drops old entries.
const LOG_CAPACITY: usize = 400;

/// Log lines surfaced in a status snapshot.
const LOG_TAIL: usize = 20;

/// Sink for stage log messages, fanned into the owning job's log.
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(String) + Send + Sync>);

impl LogSink {
    pub fn new(f: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Sink that drops every message; for previews and tests.
    pub fn silent() -> Self {
        Self::new(|_message| {})
    }

    pub fn log(&self, message: impl Into<String>) {
        (self.0.as_ref())(message.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Cancelled)
    }
}

/// Step the worker is currently in; advances forward only, except for
/// the review re-export which re-enters `upscaling` from `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Queued,
    Initializing,
    Extracting,
    Detecting,
    Rectifying,
    Stitching,
    PageCluster,
    Upscaling,
    Exporting,
    Done,
    Failed,
}

impl JobStep {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStep::Queued => "queued",
            JobStep::Initializing => "initializing",
            JobStep::Extracting => "extracting",
            JobStep::Detecting => "detecting",
            JobStep::Rectifying => "rectifying",
            JobStep::Stitching => "stitching",
            JobStep::PageCluster => "page_cluster",
            JobStep::Upscaling => "upscaling",
            JobStep::Exporting => "exporting",
            JobStep::Done => "done",
            JobStep::Failed => "failed",
        }
    }
}

/// Consistent point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub step: JobStep,
    pub progress: f32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    pub manifest: Manifest,
    pub log_tail: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Everything a worker task needs to run a job.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub workspace: JobWorkspace,
    pub source: SourceDescriptor,
    pub options: JobOptions,
    pub cancel: CancellationToken,
}

struct Job {
    workspace: JobWorkspace,
    source: SourceDescriptor,
    options: JobOptions,
    state: JobState,
    step: JobStep,
    progress: f32,
    message: String,
    error_code: Option<ErrorCode>,
    manifest: Manifest,
    log: Vec<String>,
    capture_versions: HashMap<String, u64>,
    cancel: CancellationToken,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        job_id: &str,
        workspace: JobWorkspace,
        source: SourceDescriptor,
        options: JobOptions,
    ) -> JobContext {
        let cancel = CancellationToken::new();
        let job = Job {
            workspace: workspace.clone(),
            source: source.clone(),
            options: options.clone(),
            state: JobState::Queued,
            step: JobStep::Queued,
            progress: 0.0,
            message: String::new(),
            error_code: None,
            manifest: Manifest::default(),
            log: Vec::new(),
            capture_versions: HashMap::new(),
            cancel: cancel.clone(),
            updated_at: Utc::now(),
        };
        self.jobs
            .lock()
            .expect("job store lock")
            .insert(job_id.to_string(), job);
        JobContext {
            job_id: job_id.to_string(),
            workspace,
            source,
            options,
            cancel,
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().expect("job store lock");
        let job = jobs.get(job_id)?;
        Some(JobSnapshot {
            job_id: job_id.to_string(),
            state: job.state,
            step: job.step,
            progress: job.progress,
            message: job.message.clone(),
            error_code: job.error_code.map(ErrorCode::as_str),
            manifest: job.manifest.clone(),
            log_tail: job
                .log
                .iter()
                .rev()
                .take(LOG_TAIL)
                .rev()
                .cloned()
                .collect(),
            updated_at: job.updated_at,
        })
    }

    pub fn context(&self, job_id: &str) -> Option<JobContext> {
        let jobs = self.jobs.lock().expect("job store lock");
        let job = jobs.get(job_id)?;
        Some(JobContext {
            job_id: job_id.to_string(),
            workspace: job.workspace.clone(),
            source: job.source.clone(),
            options: job.options.clone(),
            cancel: job.cancel.clone(),
        })
    }

    pub fn manifest(&self, job_id: &str) -> Option<Manifest> {
        self.jobs
            .lock()
            .expect("job store lock")
            .get(job_id)
            .map(|job| job.manifest.clone())
    }

    pub fn log(&self, job_id: &str, message: impl Into<String>) {
        let mut jobs = self.jobs.lock().expect("job store lock");
        if let Some(job) = jobs.get_mut(job_id) {
            if job.log.len() >= LOG_CAPACITY {
                job.log.remove(0);
            }
            job.log.push(message.into());
            job.updated_at = Utc::now();
        }
    }

    /// Update state, step, progress, and message together.
    ///
    /// Progress is clamped to `[0, 1]` and never decreases.
    pub fn set_state(
        &self,
        job_id: &str,
        state: JobState,
        step: JobStep,
        progress: f32,
        message: impl Into<String>,
    ) {
        let mut jobs = self.jobs.lock().expect("job store lock");
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = state;
            job.step = step;
            job.progress = job.progress.max(progress.clamp(0.0, 1.0));
            job.message = message.into();
            job.updated_at = Utc::now();
        }
    }

    pub fn set_error(&self, job_id: &str, code: ErrorCode, message: impl Into<String>) {
        let mut jobs = self.jobs.lock().expect("job store lock");
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = if code == ErrorCode::Cancelled {
                JobState::Cancelled
            } else {
                JobState::Error
            };
            job.step = JobStep::Failed;
            job.error_code = Some(code);
            job.message = message.into();
            job.updated_at = Utc::now();
        }
    }

    pub fn set_manifest(&self, job_id: &str, manifest: Manifest) {
        let mut jobs = self.jobs.lock().expect("job store lock");
        if let Some(job) = jobs.get_mut(job_id) {
            job.manifest = manifest;
            job.updated_at = Utc::now();
        }
    }

    /// Request cooperative cancellation. Returns false for unknown jobs
    /// or jobs already in a terminal state.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("job store lock");
        match jobs.get(job_id) {
            Some(job) if !job.state.is_terminal() => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .expect("job store lock")
            .get(job_id)
            .map(|job| job.state)
    }

    /// Bump the per-capture version counter used by clients as a
    /// cache-buster after a re-crop.
    pub fn bump_capture_version(&self, job_id: &str, capture_path: &str) -> u64 {
        let mut jobs = self.jobs.lock().expect("job store lock");
        match jobs.get_mut(job_id) {
            Some(job) => {
                let version = job
                    .capture_versions
                    .entry(capture_path.to_string())
                    .or_insert(0);
                *version += 1;
                *version
            }
            None => 0,
        }
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .expect("job store lock")
            .iter()
            .filter(|(_, job)| !job.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn remove(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .expect("job store lock")
            .remove(job_id)
            .is_some()
    }

    /// Drop every terminal job. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let before = jobs.len();
        jobs.retain(|_, job| !job.state.is_terminal());
        before - jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> SourceDescriptor {
        SourceDescriptor::File {
            path: "/videos/take.mp4".into(),
        }
    }

    fn store_with_job(id: &str) -> JobStore {
        let store = JobStore::new();
        store.create(
            id,
            JobWorkspace::new(format!("/jobs/{id}")),
            sample_source(),
            JobOptions::default(),
        );
        store
    }

    #[test]
    fn new_jobs_start_queued_with_zero_progress() {
        let store = store_with_job("a");
        let snap = store.snapshot("a").unwrap();
        assert_eq!(snap.state, JobState::Queued);
        assert_eq!(snap.step, JobStep::Queued);
        assert_eq!(snap.progress, 0.0);
        assert!(snap.error_code.is_none());
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let store = store_with_job("a");
        store.set_state("a", JobState::Running, JobStep::Extracting, 0.4, "extract");
        store.set_state("a", JobState::Running, JobStep::Detecting, 0.2, "detect");
        let snap = store.snapshot("a").unwrap();
        assert_eq!(snap.progress, 0.4);
        assert_eq!(snap.step, JobStep::Detecting);

        store.set_state("a", JobState::Done, JobStep::Done, 7.0, "done");
        assert_eq!(store.snapshot("a").unwrap().progress, 1.0);
    }

    #[test]
    fn error_states_carry_the_taxonomy_code() {
        let store = store_with_job("a");
        store.set_error("a", ErrorCode::DecodeFailed, "ffmpeg failed");
        let snap = store.snapshot("a").unwrap();
        assert_eq!(snap.state, JobState::Error);
        assert_eq!(snap.step, JobStep::Failed);
        assert_eq!(snap.error_code, Some("decode_failed"));
    }

    #[test]
    fn cancelled_code_maps_to_the_cancelled_state() {
        let store = store_with_job("a");
        store.set_error("a", ErrorCode::Cancelled, "job cancelled");
        assert_eq!(store.state("a"), Some(JobState::Cancelled));
    }

    #[test]
    fn cancel_fires_the_token_only_for_live_jobs() {
        let store = store_with_job("a");
        let ctx = store.context("a").unwrap();
        assert!(!ctx.cancel.is_cancelled());
        assert!(store.cancel("a"));
        assert!(ctx.cancel.is_cancelled());

        store.set_error("a", ErrorCode::Cancelled, "job cancelled");
        assert!(!store.cancel("a"));
        assert!(!store.cancel("missing"));
    }

    #[test]
    fn log_tail_keeps_the_most_recent_lines() {
        let store = store_with_job("a");
        for i in 0..30 {
            store.log("a", format!("line {i}"));
        }
        let snap = store.snapshot("a").unwrap();
        assert_eq!(snap.log_tail.len(), 20);
        assert_eq!(snap.log_tail.first().unwrap(), "line 10");
        assert_eq!(snap.log_tail.last().unwrap(), "line 29");
    }

    #[test]
    fn capture_versions_increment_per_path() {
        let store = store_with_job("a");
        assert_eq!(store.bump_capture_version("a", "/jobs/a/x.png"), 1);
        assert_eq!(store.bump_capture_version("a", "/jobs/a/x.png"), 2);
        assert_eq!(store.bump_capture_version("a", "/jobs/a/y.png"), 1);
    }

    #[test]
    fn active_ids_exclude_terminal_jobs() {
        let store = store_with_job("a");
        store.create(
            "b",
            JobWorkspace::new("/jobs/b"),
            sample_source(),
            JobOptions::default(),
        );
        store.set_state("b", JobState::Done, JobStep::Done, 1.0, "done");
        assert_eq!(store.active_job_ids(), vec!["a".to_string()]);

        assert_eq!(store.clear_terminal(), 1);
        assert!(store.snapshot("b").is_none());
        assert!(store.snapshot("a").is_some());
    }
}
