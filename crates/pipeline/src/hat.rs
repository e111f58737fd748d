//! HAT transformer super-resolution runtime.
//!
//! HAT is an opaque child process: the runtime only records whether the
//! configured checkout is usable and how to invoke it. Tiled inference
//! parameters (tile size, 32-px padding) come from the environment.

use std::path::Path;

use tokio::process::Command;

use drumsheet_core::config::HatConfig;

use crate::error::PipelineError;

/// Why the HAT backend is or is not usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HatStatus {
    Ok,
    Disabled,
    MissingRepo,
    RepoNotFound,
    MissingWeights,
    WeightsNotFound,
    CpuOnlyDisallowed,
}

impl HatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HatStatus::Ok => "ok",
            HatStatus::Disabled => "disabled",
            HatStatus::MissingRepo => "missing_repo",
            HatStatus::RepoNotFound => "repo_not_found",
            HatStatus::MissingWeights => "missing_weights",
            HatStatus::WeightsNotFound => "weights_not_found",
            HatStatus::CpuOnlyDisallowed => "cpu_only_disallowed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HatRuntime {
    pub config: HatConfig,
    pub status: HatStatus,
    /// "cuda" or "cpu"; what inference would run on.
    pub device: &'static str,
}

impl HatRuntime {
    pub fn available(&self) -> bool {
        self.status == HatStatus::Ok
    }
}

/// Evaluate a HAT configuration against the filesystem and the probed
/// CUDA state. Pure apart from existence checks, so each rule is
/// testable with a scratch directory.
pub fn detect_hat_runtime(config: HatConfig, cuda_available: bool) -> HatRuntime {
    let device = if cuda_available { "cuda" } else { "cpu" };
    let status = hat_status(&config, cuda_available);
    HatRuntime {
        config,
        status,
        device,
    }
}

fn hat_status(config: &HatConfig, cuda_available: bool) -> HatStatus {
    if !config.enabled {
        return HatStatus::Disabled;
    }
    let Some(repo) = &config.repo else {
        return HatStatus::MissingRepo;
    };
    if !repo.is_dir() {
        return HatStatus::RepoNotFound;
    }
    let Some(weights) = &config.weights else {
        return HatStatus::MissingWeights;
    };
    if !weights.is_file() {
        return HatStatus::WeightsNotFound;
    }
    if !cuda_available && !config.allow_cpu {
        return HatStatus::CpuOnlyDisallowed;
    }
    HatStatus::Ok
}

impl HatRuntime {
    /// Run tiled HAT inference over a single image file.
    pub async fn upscale_file(
        &self,
        input: &Path,
        output: &Path,
        factor: f32,
    ) -> Result<(), PipelineError> {
        if !self.available() {
            return Err(PipelineError::UpscaleFailed(format!(
                "HAT backend is not usable: {}",
                self.status.as_str()
            )));
        }
        let repo = self.config.repo.as_ref().expect("status ok implies repo");
        let weights = self.config.weights.as_ref().expect("status ok implies weights");

        let out = Command::new("python3")
            .arg(repo.join("hat").join("test.py"))
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .arg("--weights")
            .arg(weights)
            .args(["--scale", &format!("{}", factor as u32)])
            .args(["--tile", &self.config.tile_size.to_string()])
            .args(["--tile-pad", &self.config.tile_pad.to_string()])
            .args(["--device", self.device])
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| PipelineError::UpscaleFailed(format!("failed to launch HAT: {e}")))?;

        if !out.status.success() {
            return Err(PipelineError::UpscaleFailed(format!(
                "HAT inference exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        if !output.is_file() {
            return Err(PipelineError::UpscaleFailed(
                "HAT inference produced no output file".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(repo: Option<PathBuf>, weights: Option<PathBuf>) -> HatConfig {
        HatConfig {
            enabled: true,
            repo,
            weights,
            tile_size: 512,
            tile_pad: 32,
            allow_cpu: false,
        }
    }

    #[test]
    fn disabled_config_reports_disabled() {
        let runtime = detect_hat_runtime(HatConfig::default(), true);
        assert_eq!(runtime.status, HatStatus::Disabled);
        assert!(!runtime.available());
    }

    #[test]
    fn missing_paths_report_specific_reasons() {
        assert_eq!(
            detect_hat_runtime(config(None, None), true).status,
            HatStatus::MissingRepo
        );
        assert_eq!(
            detect_hat_runtime(config(Some("/definitely/not/here".into()), None), true).status,
            HatStatus::RepoNotFound
        );

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            detect_hat_runtime(config(Some(dir.path().into()), None), true).status,
            HatStatus::MissingWeights
        );
        assert_eq!(
            detect_hat_runtime(
                config(
                    Some(dir.path().into()),
                    Some(dir.path().join("missing.pth"))
                ),
                true
            )
            .status,
            HatStatus::WeightsNotFound
        );
    }

    #[test]
    fn cpu_only_machines_need_the_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights.pth");
        std::fs::write(&weights, b"w").unwrap();

        let mut cfg = config(Some(dir.path().into()), Some(weights));
        let runtime = detect_hat_runtime(cfg.clone(), false);
        assert_eq!(runtime.status, HatStatus::CpuOnlyDisallowed);

        cfg.allow_cpu = true;
        let runtime = detect_hat_runtime(cfg.clone(), false);
        assert_eq!(runtime.status, HatStatus::Ok);
        assert_eq!(runtime.device, "cpu");

        let runtime = detect_hat_runtime(cfg, true);
        assert_eq!(runtime.status, HatStatus::Ok);
        assert_eq!(runtime.device, "cuda");
    }
}
