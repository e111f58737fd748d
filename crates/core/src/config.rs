//! Environment configuration.
//!
//! Recognized variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `DRUMSHEET_HOST` / `DRUMSHEET_PORT` | HTTP bind address |
//! | `DRUMSHEET_JOBS_DIR` | root directory for job workspaces |
//! | `DRUMSHEET_HWACCEL` | ffmpeg decode preference |
//! | `DRUMSHEET_OPENCV_ACCEL` | image-processing acceleration preference |
//! | `DRUMSHEET_UPSCALE_ENGINE` | upscale backend preference |
//! | `DRUMSHEET_UPSCALE_SHARPEN` | `0` disables post-resize sharpening |
//! | `DRUMSHEET_FFMPEG_BIN` / `DRUMSHEET_FFPROBE_BIN` | binary overrides |
//! | `DRUMSHEET_HAT_*` | HAT super-resolution runtime configuration |

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CoreError;

pub const ENV_HOST: &str = "DRUMSHEET_HOST";
pub const ENV_PORT: &str = "DRUMSHEET_PORT";
pub const ENV_JOBS_DIR: &str = "DRUMSHEET_JOBS_DIR";
pub const ENV_HWACCEL: &str = "DRUMSHEET_HWACCEL";
pub const ENV_OPENCV_ACCEL: &str = "DRUMSHEET_OPENCV_ACCEL";
pub const ENV_UPSCALE_ENGINE: &str = "DRUMSHEET_UPSCALE_ENGINE";
pub const ENV_UPSCALE_SHARPEN: &str = "DRUMSHEET_UPSCALE_SHARPEN";
pub const ENV_FFMPEG_BIN: &str = "DRUMSHEET_FFMPEG_BIN";
pub const ENV_FFPROBE_BIN: &str = "DRUMSHEET_FFPROBE_BIN";
pub const ENV_HAT_ENABLE: &str = "DRUMSHEET_HAT_ENABLE";
pub const ENV_HAT_REPO: &str = "DRUMSHEET_HAT_REPO";
pub const ENV_HAT_WEIGHTS: &str = "DRUMSHEET_HAT_WEIGHTS";
pub const ENV_HAT_TILE_SIZE: &str = "DRUMSHEET_HAT_TILE_SIZE";
pub const ENV_HAT_TILE_PAD: &str = "DRUMSHEET_HAT_TILE_PAD";
pub const ENV_HAT_ALLOW_CPU: &str = "DRUMSHEET_HAT_ALLOW_CPU";

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Trimmed, non-empty value of an environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(raw) => parse_bool(&raw).unwrap_or(default),
        None => default,
    }
}

pub fn env_u32(key: &str, default: u32, minimum: u32) -> u32 {
    env_string(key)
        .and_then(|raw| raw.parse::<u32>().ok())
        .filter(|v| *v >= minimum)
        .unwrap_or(default)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Acceleration preferences
// ---------------------------------------------------------------------------

/// `DRUMSHEET_HWACCEL`: which ffmpeg hardware decode path to prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HwAccelPref {
    #[default]
    Auto,
    None,
    Cuda,
    Videotoolbox,
    D3d11va,
    Dxva2,
    Vaapi,
    Qsv,
}

impl FromStr for HwAccelPref {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(HwAccelPref::Auto),
            "none" | "off" | "cpu" => Ok(HwAccelPref::None),
            "cuda" => Ok(HwAccelPref::Cuda),
            "videotoolbox" => Ok(HwAccelPref::Videotoolbox),
            "d3d11va" => Ok(HwAccelPref::D3d11va),
            "dxva2" => Ok(HwAccelPref::Dxva2),
            "vaapi" => Ok(HwAccelPref::Vaapi),
            "qsv" => Ok(HwAccelPref::Qsv),
            other => Err(CoreError::Validation(format!(
                "unknown hwaccel preference '{other}'"
            ))),
        }
    }
}

impl HwAccelPref {
    pub fn from_env() -> Self {
        env_string(ENV_HWACCEL)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    /// The decoder name this preference pins, if any.
    pub fn forced_mode(self) -> Option<&'static str> {
        match self {
            HwAccelPref::Auto | HwAccelPref::None => None,
            HwAccelPref::Cuda => Some("cuda"),
            HwAccelPref::Videotoolbox => Some("videotoolbox"),
            HwAccelPref::D3d11va => Some("d3d11va"),
            HwAccelPref::Dxva2 => Some("dxva2"),
            HwAccelPref::Vaapi => Some("vaapi"),
            HwAccelPref::Qsv => Some("qsv"),
        }
    }
}

/// `DRUMSHEET_OPENCV_ACCEL`: image-processing acceleration preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpencvAccelPref {
    #[default]
    Auto,
    Cuda,
    Opencl,
    Cpu,
}

impl FromStr for OpencvAccelPref {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(OpencvAccelPref::Auto),
            "cuda" => Ok(OpencvAccelPref::Cuda),
            "opencl" => Ok(OpencvAccelPref::Opencl),
            "cpu" | "none" | "off" => Ok(OpencvAccelPref::Cpu),
            other => Err(CoreError::Validation(format!(
                "unknown opencv acceleration preference '{other}'"
            ))),
        }
    }
}

impl OpencvAccelPref {
    pub fn from_env() -> Self {
        env_string(ENV_OPENCV_ACCEL)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

/// `DRUMSHEET_UPSCALE_ENGINE`: upscale backend preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpscaleEnginePref {
    #[default]
    Auto,
    Hat,
    Opencv,
    Ffmpeg,
}

impl FromStr for UpscaleEnginePref {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(UpscaleEnginePref::Auto),
            "hat" => Ok(UpscaleEnginePref::Hat),
            "opencv" => Ok(UpscaleEnginePref::Opencv),
            "ffmpeg" => Ok(UpscaleEnginePref::Ffmpeg),
            other => Err(CoreError::Validation(format!(
                "unknown upscale engine preference '{other}'"
            ))),
        }
    }
}

impl UpscaleEnginePref {
    pub fn from_env() -> Self {
        env_string(ENV_UPSCALE_ENGINE)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

/// Post-resize sharpening toggle; enabled unless explicitly turned off.
pub fn sharpen_enabled() -> bool {
    env_bool(ENV_UPSCALE_SHARPEN, true)
}

// ---------------------------------------------------------------------------
// HAT runtime configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_HAT_TILE_SIZE: u32 = 512;
pub const MIN_HAT_TILE_SIZE: u32 = 64;
pub const DEFAULT_HAT_TILE_PAD: u32 = 32;

#[derive(Debug, Clone, Default)]
pub struct HatConfig {
    pub enabled: bool,
    pub repo: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub tile_size: u32,
    pub tile_pad: u32,
    pub allow_cpu: bool,
}

impl HatConfig {
    pub fn from_env() -> Self {
        let engine_pref = UpscaleEnginePref::from_env();
        Self {
            enabled: env_bool(ENV_HAT_ENABLE, false) || engine_pref == UpscaleEnginePref::Hat,
            repo: env_string(ENV_HAT_REPO).map(PathBuf::from),
            weights: env_string(ENV_HAT_WEIGHTS).map(PathBuf::from),
            tile_size: env_u32(ENV_HAT_TILE_SIZE, DEFAULT_HAT_TILE_SIZE, MIN_HAT_TILE_SIZE),
            tile_pad: env_u32(ENV_HAT_TILE_PAD, DEFAULT_HAT_TILE_PAD, 0),
            allow_cpu: env_bool(ENV_HAT_ALLOW_CPU, false),
        }
    }
}
