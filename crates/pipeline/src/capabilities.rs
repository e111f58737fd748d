//! Runtime capability probe.
//!
//! The probe runs once at startup and produces an immutable
//! [`Capabilities`] value that is passed by reference everywhere a
//! stage needs to know what hardware paths work. The [`Accelerator`]
//! trait is the seam that lets tests substitute a canned report.

use async_trait::async_trait;
use tokio::process::Command;

use drumsheet_core::config::OpencvAccelPref;
use drumsheet_core::manifest::RuntimeInfo;

use crate::ffmpeg::FfmpegRuntime;
use crate::hat::HatRuntime;

/// Image-processing acceleration mode, mirroring the probe categories
/// of the OpenCV-based pipeline this replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpencvMode {
    Cuda,
    Opencl,
    Cpu,
}

impl OpencvMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpencvMode::Cuda => "cuda",
            OpencvMode::Opencl => "opencl",
            OpencvMode::Cpu => "cpu",
        }
    }

    pub fn is_gpu(self) -> bool {
        self != OpencvMode::Cpu
    }
}

/// Immutable snapshot of what the machine can do, built once at start.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// ffmpeg decode modes in probe order, software last.
    pub ffmpeg_modes: Vec<String>,
    pub opencv_mode: OpencvMode,
    pub cuda_available: bool,
    pub scale_vt_available: bool,
    pub hat_available: bool,
    pub hat_reason: String,
    pub gpu_name: Option<String>,
    pub cpu_name: String,
}

impl Capabilities {
    /// CPU-only capabilities, used as a safe default and in tests.
    pub fn cpu_only() -> Self {
        Self {
            ffmpeg_modes: vec!["cpu".into()],
            opencv_mode: OpencvMode::Cpu,
            cuda_available: false,
            scale_vt_available: false,
            hat_available: false,
            hat_reason: "disabled".into(),
            gpu_name: None,
            cpu_name: "Unknown CPU".into(),
        }
    }

    fn first_hw_decode_mode(&self) -> Option<&str> {
        self.ffmpeg_modes
            .iter()
            .map(String::as_str)
            .find(|m| *m != "cpu")
    }

    /// Which upscale backend the selection order would pick, for the
    /// runtime report.
    pub fn upscale_engine_hint(&self) -> &'static str {
        if self.hat_available {
            "hat"
        } else if self.opencv_mode.is_gpu() {
            "opencv"
        } else if self.scale_vt_available {
            "ffmpeg"
        } else {
            "none"
        }
    }

    /// Public runtime report. `active_ffmpeg_mode` overrides the probe
    /// order with the decode mode a job actually used.
    pub fn runtime_info(&self, active_ffmpeg_mode: Option<&str>) -> RuntimeInfo {
        let ffmpeg_mode = active_ffmpeg_mode
            .or_else(|| self.first_hw_decode_mode())
            .unwrap_or("cpu")
            .to_string();
        let uses_gpu = ffmpeg_mode != "cpu" || self.opencv_mode.is_gpu();
        RuntimeInfo {
            overall_mode: if uses_gpu { "gpu" } else { "cpu" }.to_string(),
            ffmpeg_mode,
            opencv_mode: self.opencv_mode.as_str().to_string(),
            upscale_engine_hint: self.upscale_engine_hint().to_string(),
            gpu_name: self.gpu_name.clone(),
            cpu_name: self.cpu_name.clone(),
        }
    }
}

/// Seam for the capability probe.
#[async_trait]
pub trait Accelerator: Send + Sync {
    async fn probe(&self) -> Capabilities;
}

// ---------------------------------------------------------------------------
// System probe
// ---------------------------------------------------------------------------

pub struct SystemAccelerator<'a> {
    pub runtime: &'a FfmpegRuntime,
    pub hat: &'a HatRuntime,
    pub opencv_pref: OpencvAccelPref,
}

#[async_trait]
impl<'a> Accelerator for SystemAccelerator<'a> {
    async fn probe(&self) -> Capabilities {
        let gpu_name = detect_nvidia_gpu().await;
        let cuda_available = gpu_name.is_some();
        let opencv_mode = select_opencv_mode(self.opencv_pref, cuda_available);
        let scale_vt_available = self.runtime.scale_vt_selftest().await;

        let caps = Capabilities {
            ffmpeg_modes: self.runtime.mode_order(),
            opencv_mode,
            cuda_available,
            scale_vt_available,
            hat_available: self.hat.available(),
            hat_reason: self.hat.status.as_str().to_string(),
            gpu_name: gpu_name.or_else(detect_fallback_gpu),
            cpu_name: detect_cpu_name(),
        };
        tracing::info!(
            opencv = caps.opencv_mode.as_str(),
            ffmpeg = ?caps.ffmpeg_modes,
            hat = caps.hat_available,
            scale_vt = caps.scale_vt_available,
            gpu = caps.gpu_name.as_deref().unwrap_or("unavailable"),
            cpu = %caps.cpu_name,
            "runtime acceleration probed"
        );
        caps
    }
}

/// Pick the image-processing acceleration mode.
///
/// CUDA requires a detected device. An explicit OpenCL preference is
/// honored as stated; there is no cheap standalone probe for it, so
/// the operator's word decides.
pub fn select_opencv_mode(pref: OpencvAccelPref, cuda_available: bool) -> OpencvMode {
    match pref {
        OpencvAccelPref::Cpu => OpencvMode::Cpu,
        OpencvAccelPref::Opencl => OpencvMode::Opencl,
        OpencvAccelPref::Cuda => {
            if cuda_available {
                OpencvMode::Cuda
            } else {
                OpencvMode::Cpu
            }
        }
        OpencvAccelPref::Auto => {
            if cuda_available {
                OpencvMode::Cuda
            } else {
                OpencvMode::Cpu
            }
        }
    }
}

async fn detect_nvidia_gpu() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

fn detect_fallback_gpu() -> Option<String> {
    if cfg!(target_os = "macos") {
        return Some("Apple GPU".into());
    }
    None
}

fn detect_cpu_name() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            for line in cpuinfo.lines() {
                if line.starts_with("model name") {
                    if let Some((_, name)) = line.split_once(':') {
                        return name.trim().to_string();
                    }
                }
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(out) = std::process::Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
        {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::consts::ARCH.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_caps() -> Capabilities {
        Capabilities {
            ffmpeg_modes: vec!["cuda".into(), "cpu".into()],
            opencv_mode: OpencvMode::Cuda,
            cuda_available: true,
            scale_vt_available: false,
            hat_available: false,
            hat_reason: "disabled".into(),
            gpu_name: Some("NVIDIA GeForce RTX 3060".into()),
            cpu_name: "test cpu".into(),
        }
    }

    #[test]
    fn opencv_mode_selection_honors_preferences() {
        assert_eq!(
            select_opencv_mode(OpencvAccelPref::Auto, true),
            OpencvMode::Cuda
        );
        assert_eq!(
            select_opencv_mode(OpencvAccelPref::Auto, false),
            OpencvMode::Cpu
        );
        assert_eq!(
            select_opencv_mode(OpencvAccelPref::Cuda, false),
            OpencvMode::Cpu
        );
        assert_eq!(
            select_opencv_mode(OpencvAccelPref::Opencl, false),
            OpencvMode::Opencl
        );
        assert_eq!(
            select_opencv_mode(OpencvAccelPref::Cpu, true),
            OpencvMode::Cpu
        );
    }

    #[test]
    fn runtime_info_reports_gpu_when_any_path_is_hardware() {
        let info = gpu_caps().runtime_info(None);
        assert_eq!(info.overall_mode, "gpu");
        assert_eq!(info.ffmpeg_mode, "cuda");
        assert_eq!(info.opencv_mode, "cuda");
        assert_eq!(info.upscale_engine_hint, "opencv");

        let info = Capabilities::cpu_only().runtime_info(None);
        assert_eq!(info.overall_mode, "cpu");
        assert_eq!(info.ffmpeg_mode, "cpu");
        assert_eq!(info.upscale_engine_hint, "none");
    }

    #[test]
    fn active_decode_mode_overrides_the_probe_order() {
        let info = gpu_caps().runtime_info(Some("cpu"));
        assert_eq!(info.ffmpeg_mode, "cpu");
        // The image-processing path still reports gpu overall.
        assert_eq!(info.overall_mode, "gpu");
    }

    #[test]
    fn engine_hint_follows_the_backend_order() {
        let mut caps = gpu_caps();
        caps.hat_available = true;
        assert_eq!(caps.upscale_engine_hint(), "hat");
        caps.hat_available = false;
        assert_eq!(caps.upscale_engine_hint(), "opencv");
        caps.opencv_mode = OpencvMode::Cpu;
        caps.scale_vt_available = true;
        assert_eq!(caps.upscale_engine_hint(), "ffmpeg");
        caps.scale_vt_available = false;
        assert_eq!(caps.upscale_engine_hint(), "none");
    }
}
