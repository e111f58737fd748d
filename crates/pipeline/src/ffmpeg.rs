//! FFmpeg / ffprobe invocation: binary resolution, hardware decode
//! selection, frame extraction with progress reporting, preview frame
//! extraction, and stream probing.
//!
//! One ffmpeg run trims the input, applies `fps=<rate>`, and decodes to
//! sequentially numbered PNG files. Progress comes from parsing the
//! `frame=N` counter lines on `-progress pipe:1`; cancellation is
//! observed every [`CANCEL_CHECKPOINT_FRAMES`] frames and tears the
//! child down with SIGTERM, escalating to SIGKILL after a grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use drumsheet_core::config::{self, HwAccelPref};

use crate::error::PipelineError;

/// Cancellation is observed every this many decoded frames.
pub const CANCEL_CHECKPOINT_FRAMES: u64 = 64;

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
pub const CHILD_KILL_GRACE: Duration = Duration::from_millis(2500);

/// Hardware decode paths probed in order of preference.
const HWACCEL_ORDER: &[&str] = &["videotoolbox", "cuda", "d3d11va", "dxva2", "vaapi", "qsv"];

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// One candidate decode configuration.
#[derive(Debug, Clone)]
pub struct DecodeMode {
    /// "cpu" for the software path, otherwise the hwaccel name.
    pub name: String,
    /// Extra ffmpeg flags, inserted before `-i`.
    pub flags: Vec<String>,
}

impl DecodeMode {
    fn software() -> Self {
        Self {
            name: "cpu".into(),
            flags: Vec::new(),
        }
    }

    fn hardware(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: vec!["-hwaccel".into(), name.into()],
        }
    }
}

/// Resolved ffmpeg/ffprobe binaries plus the ordered decode modes to
/// try. Built once at startup and shared across jobs.
#[derive(Debug, Clone)]
pub struct FfmpegRuntime {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    decode_modes: Vec<DecodeMode>,
}

impl FfmpegRuntime {
    /// Probe the environment: resolve binaries and build the decode
    /// mode order from `DRUMSHEET_HWACCEL` and `ffmpeg -hwaccels`.
    /// Never fails; a missing binary surfaces when it is first used.
    pub async fn detect() -> Self {
        let ffmpeg_bin = resolve_binary("ffmpeg", config::ENV_FFMPEG_BIN);
        let ffprobe_bin = resolve_binary("ffprobe", config::ENV_FFPROBE_BIN);
        let available = list_hwaccels(&ffmpeg_bin).await;
        let decode_modes = build_decode_modes(HwAccelPref::from_env(), &available);
        tracing::info!(
            ffmpeg = %ffmpeg_bin,
            modes = ?decode_modes.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "ffmpeg runtime detected"
        );
        Self {
            ffmpeg_bin,
            ffprobe_bin,
            decode_modes,
        }
    }

    /// Runtime with an explicit binary and software decode only.
    pub fn with_binaries(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            decode_modes: vec![DecodeMode::software()],
        }
    }

    /// Decode mode names in probe order, software last.
    pub fn mode_order(&self) -> Vec<String> {
        self.decode_modes.iter().map(|m| m.name.clone()).collect()
    }

    pub fn ffmpeg_bin(&self) -> &str {
        &self.ffmpeg_bin
    }
}

/// Result of a full extraction run.
#[derive(Debug)]
pub struct ExtractOutcome {
    /// Frame files in index order.
    pub frames: Vec<PathBuf>,
    /// Decode mode that produced them.
    pub decode_mode: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    pub video: &'a Path,
    pub out_dir: &'a Path,
    pub fps: f64,
    pub start_sec: Option<f64>,
    pub end_sec: Option<f64>,
}

impl FfmpegRuntime {
    /// Decode a time-bounded slice of `video` into numbered PNG frames.
    ///
    /// Tries the preferred hardware mode first and retries once with
    /// the software decoder on failure. `on_progress` receives the
    /// ffmpeg frame counter as it advances.
    pub async fn extract_frames(
        &self,
        req: ExtractRequest<'_>,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<ExtractOutcome, PipelineError> {
        if let (Some(start), Some(end)) = (req.start_sec, req.end_sec) {
            if end <= start {
                return Err(PipelineError::EmptyRange);
            }
        }
        std::fs::create_dir_all(req.out_dir)?;

        let mut attempt_errors: Vec<String> = Vec::new();
        for mode in &self.decode_modes {
            clear_frames(req.out_dir);

            let mut cmd = Command::new(&self.ffmpeg_bin);
            cmd.args(["-y", "-hide_banner", "-loglevel", "error"])
                .args(&mode.flags)
                .arg("-i")
                .arg(req.video);
            if let Some(start) = req.start_sec {
                cmd.args(["-ss", &format!("{start}")]);
            }
            if let Some(end) = req.end_sec {
                cmd.args(["-to", &format!("{end}")]);
            }
            cmd.args(["-vf", &format!("fps={}", req.fps)])
                .args(["-progress", "pipe:1"])
                .arg(req.out_dir.join("frame_%06d.png"));

            tracing::debug!(mode = %mode.name, "running ffmpeg extract");
            let (status, stderr) = self.run_with_progress(cmd, cancel, on_progress).await?;

            let frames = list_frames(req.out_dir);
            if status && !frames.is_empty() {
                return Ok(ExtractOutcome {
                    frames,
                    decode_mode: mode.name.clone(),
                });
            }
            attempt_errors.push(format!("{}: {}", mode.name, tail_of(&stderr)));
        }

        Err(PipelineError::DecodeFailed(format!(
            "ffmpeg failed after hardware/software fallback: {}",
            attempt_errors.join(" | ")
        )))
    }

    /// Spawn a configured ffmpeg command, streaming its progress pipe.
    /// Returns the exit success flag and captured stderr.
    async fn run_with_progress(
        &self,
        mut cmd: Command,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<(bool, String), PipelineError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut checkpoint = 0u64;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(frame) = parse_progress_frame(&line) {
                    on_progress(frame);
                    if frame / CANCEL_CHECKPOINT_FRAMES > checkpoint {
                        checkpoint = frame / CANCEL_CHECKPOINT_FRAMES;
                        if cancel.is_cancelled() {
                            terminate_child(&mut child).await;
                            let _ = stderr_task.await;
                            return Err(PipelineError::Cancelled);
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok((status.success(), stderr_text))
    }

    /// Extract a single preview frame near `at_sec`.
    ///
    /// Seeks to the nearest key frame at or before the requested time
    /// (`-noaccurate_seek` with an input-side `-ss`) and retries from
    /// the start of the clip when that fails.
    pub async fn extract_preview_frame(
        &self,
        video: &Path,
        out_path: &Path,
        at_sec: f64,
    ) -> Result<PathBuf, PipelineError> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut seeks = vec![at_sec.max(0.0)];
        if seeks[0] > 0.0 {
            seeks.push(0.0);
        }

        let mut attempt_errors: Vec<String> = Vec::new();
        for mode in &self.decode_modes {
            for seek in &seeks {
                let output = Command::new(&self.ffmpeg_bin)
                    .args(["-y", "-hide_banner", "-loglevel", "error"])
                    .args(&mode.flags)
                    .args(["-noaccurate_seek", "-ss", &format!("{seek}"), "-i"])
                    .arg(video)
                    .args(["-frames:v", "1"])
                    .arg(out_path)
                    .output()
                    .await
                    .map_err(|e| self.spawn_error(e))?;

                let produced = out_path.metadata().map(|m| m.len() > 0).unwrap_or(false);
                if output.status.success() && produced {
                    return Ok(out_path.to_path_buf());
                }
                let _ = std::fs::remove_file(out_path);
                attempt_errors.push(format!(
                    "{} seek={seek:.2}: {}",
                    mode.name,
                    tail_of(&String::from_utf8_lossy(&output.stderr))
                ));
            }
        }

        Err(PipelineError::DecodeFailed(format!(
            "ffmpeg preview failed after retries: {}",
            attempt_errors.join(" | ")
        )))
    }

    /// Self-test for the `scale_vt` (VideoToolbox) filter. Always
    /// reports unavailable off macOS, even when the filter is compiled
    /// into the local ffmpeg build.
    pub async fn scale_vt_selftest(&self) -> bool {
        if !cfg!(target_os = "macos") {
            return false;
        }
        Command::new(&self.ffmpeg_bin)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "lavfi",
                "-i",
                "color=c=white:s=64x64:d=0.1",
                "-vf",
                "scale_vt=128:128",
                "-frames:v",
                "1",
                "-f",
                "null",
                "-",
            ])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Upscale a single image through an ffmpeg scale filter.
    pub async fn scale_image(
        &self,
        input: &Path,
        output: &Path,
        filter: &str,
    ) -> Result<(), PipelineError> {
        let out = Command::new(&self.ffmpeg_bin)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-vf", filter])
            .arg(output)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !out.status.success() {
            return Err(PipelineError::UpscaleFailed(tail_of(
                &String::from_utf8_lossy(&out.stderr),
            )));
        }
        Ok(())
    }

    fn spawn_error(&self, err: std::io::Error) -> PipelineError {
        if err.kind() == std::io::ErrorKind::NotFound {
            PipelineError::FfmpegMissing(self.ffmpeg_bin.clone())
        } else {
            PipelineError::Io(err)
        }
    }
}

// ---------------------------------------------------------------------------
// ffprobe
// ---------------------------------------------------------------------------

/// Parsed subset of `ffprobe -print_format json -show_format -show_streams`.
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
}

impl FfmpegRuntime {
    pub async fn probe_video(&self, path: &Path) -> Result<FfprobeOutput, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::SourceUnavailable(format!(
                "video file not found: {}",
                path.display()
            )));
        }
        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::FfmpegMissing(self.ffprobe_bin.clone())
                } else {
                    PipelineError::Io(e)
                }
            })?;
        if !output.status.success() {
            return Err(PipelineError::DecodeFailed(format!(
                "ffprobe exited with {:?}",
                output.status.code()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Internal(format!("failed to parse ffprobe output: {e}")))
    }
}

/// First video stream's resolution, if probed.
pub fn parse_resolution(probe: &FfprobeOutput) -> Option<(u32, u32)> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        })
}

/// Clip duration in seconds; format-level first, stream fallback.
pub fn parse_duration(probe: &FfprobeOutput) -> f64 {
    let format_duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    if let Some(secs) = format_duration {
        return secs;
    }
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| s.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a tool binary: environment override first, then `PATH`.
fn resolve_binary(tool: &str, env_key: &str) -> String {
    if let Some(value) = config::env_string(env_key) {
        return value;
    }
    find_in_path(tool).unwrap_or_else(|| tool.to_string())
}

fn find_in_path(tool: &str) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
        .map(|p| p.to_string_lossy().into_owned())
}

async fn list_hwaccels(ffmpeg_bin: &str) -> Vec<String> {
    let output = Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-loglevel", "error", "-hwaccels"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => parse_hwaccels(&String::from_utf8_lossy(&out.stdout)),
        _ => Vec::new(),
    }
}

/// Parse `ffmpeg -hwaccels` output into decoder names.
pub fn parse_hwaccels(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().to_ascii_lowercase())
        .filter(|line| !line.is_empty() && !line.contains("hardware acceleration methods"))
        .collect()
}

/// Build the ordered decode modes for a preference and an availability
/// probe: at most one hardware mode, always followed by software.
pub fn build_decode_modes(pref: HwAccelPref, available: &[String]) -> Vec<DecodeMode> {
    let mut modes = Vec::new();
    match pref {
        HwAccelPref::None => {}
        HwAccelPref::Auto => {
            if let Some(name) = HWACCEL_ORDER
                .iter()
                .find(|name| available.iter().any(|a| a == *name))
            {
                modes.push(DecodeMode::hardware(name));
            }
        }
        forced => {
            // A forced preference is honored even when the probe table
            // could not be built; the software retry still applies.
            if let Some(name) = forced.forced_mode() {
                if available.is_empty() || available.iter().any(|a| a == name) {
                    modes.push(DecodeMode::hardware(name));
                }
            }
        }
    }
    modes.push(DecodeMode::software());
    modes
}

/// Pull the frame counter out of a `-progress pipe:1` line.
pub fn parse_progress_frame(line: &str) -> Option<u64> {
    line.trim().strip_prefix("frame=")?.trim().parse().ok()
}

fn clear_frames(out_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(out_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("frame_") && name.ends_with(".png") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn list_frames(out_dir: &Path) -> Vec<PathBuf> {
    let mut frames: Vec<PathBuf> = match std::fs::read_dir(out_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with("frame_") && n.ends_with(".png")
                    })
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    frames.sort();
    frames
}

fn tail_of(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "unknown ffmpeg error".into();
    }
    trimmed
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Terminate a child with the platform's standard sequence: SIGTERM,
/// then SIGKILL after [`CHILD_KILL_GRACE`].
pub async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(CHILD_KILL_GRACE, child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_frame_lines_parse() {
        assert_eq!(parse_progress_frame("frame=128"), Some(128));
        assert_eq!(parse_progress_frame("frame=  12"), Some(12));
        assert_eq!(parse_progress_frame("fps=25.0"), None);
        assert_eq!(parse_progress_frame("progress=end"), None);
    }

    #[test]
    fn hwaccels_output_parses_names() {
        let raw = "Hardware acceleration methods:\nvaapi\ncuda\n\n";
        assert_eq!(parse_hwaccels(raw), vec!["vaapi", "cuda"]);
    }

    #[test]
    fn auto_mode_picks_first_available_in_order() {
        let available = vec!["vaapi".to_string(), "cuda".to_string()];
        let modes = build_decode_modes(HwAccelPref::Auto, &available);
        // cuda outranks vaapi in the preference order.
        assert_eq!(modes[0].name, "cuda");
        assert_eq!(modes.last().unwrap().name, "cpu");
        assert_eq!(modes.len(), 2);
    }

    #[test]
    fn none_preference_is_software_only() {
        let modes = build_decode_modes(HwAccelPref::None, &["cuda".to_string()]);
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].name, "cpu");
        assert!(modes[0].flags.is_empty());
    }

    #[test]
    fn forced_preference_survives_empty_probe_table() {
        let modes = build_decode_modes(HwAccelPref::Vaapi, &[]);
        assert_eq!(modes[0].name, "vaapi");
        assert_eq!(modes[0].flags, vec!["-hwaccel", "vaapi"]);
        assert_eq!(modes[1].name, "cpu");
    }

    #[test]
    fn forced_preference_skipped_when_probe_excludes_it() {
        let modes = build_decode_modes(HwAccelPref::Qsv, &["cuda".to_string()]);
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].name, "cpu");
    }

    #[test]
    fn ffprobe_resolution_comes_from_the_video_stream() {
        let probe: FfprobeOutput = serde_json::from_str(
            r#"{
                "streams": [
                    {"codec_type": "audio"},
                    {"codec_type": "video", "width": 1920, "height": 1080}
                ],
                "format": {"duration": "12.5"}
            }"#,
        )
        .unwrap();
        assert_eq!(parse_resolution(&probe), Some((1920, 1080)));
        assert!((parse_duration(&probe) - 12.5).abs() < 1e-9);
    }

    #[test]
    fn ffprobe_duration_falls_back_to_the_stream() {
        let probe: FfprobeOutput = serde_json::from_str(
            r#"{
                "streams": [{"codec_type": "video", "duration": "31.0"}],
                "format": {}
            }"#,
        )
        .unwrap();
        assert!((parse_duration(&probe) - 31.0).abs() < 1e-9);
    }
}
