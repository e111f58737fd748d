//! Page upscaling.
//!
//! Backend order: HAT transformer SR, then CUDA-class resize, then
//! OpenCL-class resize, then ffmpeg `scale_vt`. The first backend whose
//! startup self-test passed wins. With `gpu_only` set and no usable
//! backend the stage fails closed; otherwise pages pass through
//! unchanged. Every resize is followed by an unsharp mask unless
//! sharpening is disabled in the environment.

use std::path::Path;

use image::{Rgb, RgbImage};

use drumsheet_core::config::UpscaleEnginePref;
use drumsheet_core::options::UpscaleOptions;

use crate::capabilities::Capabilities;
use crate::error::PipelineError;
use crate::ffmpeg::FfmpegRuntime;
use crate::hat::HatRuntime;
use crate::stitch::PageCandidate;

/// Unsharp mask radius (gaussian sigma) applied after resize.
pub const SHARPEN_RADIUS: f32 = 1.2;

/// Unsharp mask amount applied after resize.
pub const SHARPEN_AMOUNT: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleBackend {
    Hat,
    OpencvCuda,
    OpencvOpencl,
    FfmpegScaleVt,
}

impl UpscaleBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            UpscaleBackend::Hat => "hat",
            UpscaleBackend::OpencvCuda => "opencv_cuda",
            UpscaleBackend::OpencvOpencl => "opencv_opencl",
            UpscaleBackend::FfmpegScaleVt => "ffmpeg_scale_vt",
        }
    }
}

/// First available backend in preference order, filtered by the
/// operator's engine preference.
pub fn select_backend(caps: &Capabilities, pref: UpscaleEnginePref) -> Option<UpscaleBackend> {
    use crate::capabilities::OpencvMode;

    let candidates = [
        (UpscaleBackend::Hat, caps.hat_available),
        (
            UpscaleBackend::OpencvCuda,
            caps.opencv_mode == OpencvMode::Cuda,
        ),
        (
            UpscaleBackend::OpencvOpencl,
            caps.opencv_mode == OpencvMode::Opencl,
        ),
        (UpscaleBackend::FfmpegScaleVt, caps.scale_vt_available),
    ];
    candidates
        .into_iter()
        .filter(|(backend, _)| match pref {
            UpscaleEnginePref::Auto => true,
            UpscaleEnginePref::Hat => *backend == UpscaleBackend::Hat,
            UpscaleEnginePref::Opencv => matches!(
                backend,
                UpscaleBackend::OpencvCuda | UpscaleBackend::OpencvOpencl
            ),
            UpscaleEnginePref::Ffmpeg => *backend == UpscaleBackend::FfmpegScaleVt,
        })
        .find(|(_, available)| *available)
        .map(|(backend, _)| backend)
}

/// Outcome of the upscale stage.
#[derive(Debug)]
pub struct UpscaleOutcome {
    pub pages: Vec<PageCandidate>,
    /// Backend used, when upscaling actually ran.
    pub engine: Option<UpscaleBackend>,
}

/// Decide whether the stage may pass through unchanged or must fail.
///
/// Called when no backend is available (or the GPU stayed busy past
/// its hold timeout).
pub fn pass_through(
    pages: Vec<PageCandidate>,
    options: &UpscaleOptions,
) -> Result<UpscaleOutcome, PipelineError> {
    if options.enable && options.gpu_only {
        return Err(PipelineError::NoGpuUpscale);
    }
    Ok(UpscaleOutcome {
        pages,
        engine: None,
    })
}

/// Run the selected backend over every page.
pub async fn run_backend(
    pages: Vec<PageCandidate>,
    backend: UpscaleBackend,
    options: &UpscaleOptions,
    hat: &HatRuntime,
    runtime: &FfmpegRuntime,
    scratch_dir: &Path,
    sharpen: bool,
) -> Result<UpscaleOutcome, PipelineError> {
    let factor = options.factor;
    std::fs::create_dir_all(scratch_dir)
        .map_err(|e| PipelineError::UpscaleFailed(e.to_string()))?;

    let mut out_pages = Vec::with_capacity(pages.len());
    for (index, page) in pages.into_iter().enumerate() {
        let upscaled = match backend {
            UpscaleBackend::OpencvCuda | UpscaleBackend::OpencvOpencl => {
                resize_bicubic(&page.image, factor)
            }
            UpscaleBackend::Hat => {
                let input = scratch_dir.join(format!("hat_in_{index:05}.png"));
                let output = scratch_dir.join(format!("hat_out_{index:05}.png"));
                page.image
                    .save(&input)
                    .map_err(|e| PipelineError::UpscaleFailed(e.to_string()))?;
                hat.upscale_file(&input, &output, factor).await?;
                let result = image::open(&output)
                    .map_err(|e| PipelineError::UpscaleFailed(e.to_string()))?
                    .to_rgb8();
                let _ = std::fs::remove_file(&input);
                let _ = std::fs::remove_file(&output);
                result
            }
            UpscaleBackend::FfmpegScaleVt => {
                let input = scratch_dir.join(format!("vt_in_{index:05}.png"));
                let output = scratch_dir.join(format!("vt_out_{index:05}.png"));
                page.image
                    .save(&input)
                    .map_err(|e| PipelineError::UpscaleFailed(e.to_string()))?;
                let target_w = scaled_dim(page.image.width(), factor);
                let target_h = scaled_dim(page.image.height(), factor);
                runtime
                    .scale_image(&input, &output, &format!("scale_vt={target_w}:{target_h}"))
                    .await?;
                let result = image::open(&output)
                    .map_err(|e| PipelineError::UpscaleFailed(e.to_string()))?
                    .to_rgb8();
                let _ = std::fs::remove_file(&input);
                let _ = std::fs::remove_file(&output);
                result
            }
        };

        let finished = if sharpen {
            unsharp_mask(&upscaled, SHARPEN_RADIUS, SHARPEN_AMOUNT)
        } else {
            upscaled
        };
        out_pages.push(PageCandidate {
            image: finished,
            frame_indices: page.frame_indices,
            cluster_id: page.cluster_id,
        });
    }

    Ok(UpscaleOutcome {
        pages: out_pages,
        engine: Some(backend),
    })
}

fn scaled_dim(value: u32, factor: f32) -> u32 {
    ((value as f32 * factor).round() as u32).max(2)
}

/// Bicubic enlargement; the CPU half of the CUDA/OpenCL-class resize.
pub fn resize_bicubic(image: &RgbImage, factor: f32) -> RgbImage {
    image::imageops::resize(
        image,
        scaled_dim(image.width(), factor),
        scaled_dim(image.height(), factor),
        image::imageops::FilterType::CatmullRom,
    )
}

/// `out = img + amount * (img - blur(img, sigma))`, clamped per channel.
pub fn unsharp_mask(image: &RgbImage, sigma: f32, amount: f32) -> RgbImage {
    let blurred = imageproc::filter::gaussian_blur_f32(image, sigma);
    let mut sharpened = image.clone();
    for (pixel, blur) in sharpened.pixels_mut().zip(blurred.pixels()) {
        let mut channels = [0u8; 3];
        for c in 0..3 {
            let original = pixel.0[c] as f32;
            let soft = blur.0[c] as f32;
            channels[c] = (original + amount * (original - soft)).clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(channels);
    }
    sharpened
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{Capabilities, OpencvMode};

    fn caps(hat: bool, opencv: OpencvMode, scale_vt: bool) -> Capabilities {
        Capabilities {
            hat_available: hat,
            opencv_mode: opencv,
            scale_vt_available: scale_vt,
            ..Capabilities::cpu_only()
        }
    }

    fn page(width: u32, height: u32) -> PageCandidate {
        PageCandidate {
            image: RgbImage::from_pixel(width, height, Rgb([200, 200, 200])),
            frame_indices: vec![0],
            cluster_id: None,
        }
    }

    #[test]
    fn backend_selection_follows_the_fixed_order() {
        assert_eq!(
            select_backend(&caps(true, OpencvMode::Cuda, true), UpscaleEnginePref::Auto),
            Some(UpscaleBackend::Hat)
        );
        assert_eq!(
            select_backend(&caps(false, OpencvMode::Cuda, true), UpscaleEnginePref::Auto),
            Some(UpscaleBackend::OpencvCuda)
        );
        assert_eq!(
            select_backend(
                &caps(false, OpencvMode::Opencl, true),
                UpscaleEnginePref::Auto
            ),
            Some(UpscaleBackend::OpencvOpencl)
        );
        assert_eq!(
            select_backend(&caps(false, OpencvMode::Cpu, true), UpscaleEnginePref::Auto),
            Some(UpscaleBackend::FfmpegScaleVt)
        );
        assert_eq!(
            select_backend(&caps(false, OpencvMode::Cpu, false), UpscaleEnginePref::Auto),
            None
        );
    }

    #[test]
    fn engine_preference_filters_backends() {
        let all = caps(true, OpencvMode::Cuda, true);
        assert_eq!(
            select_backend(&all, UpscaleEnginePref::Opencv),
            Some(UpscaleBackend::OpencvCuda)
        );
        assert_eq!(
            select_backend(&all, UpscaleEnginePref::Ffmpeg),
            Some(UpscaleBackend::FfmpegScaleVt)
        );
        // Preferring an unavailable engine yields nothing rather than
        // falling back behind the operator's back.
        assert_eq!(
            select_backend(&caps(false, OpencvMode::Cuda, true), UpscaleEnginePref::Hat),
            None
        );
    }

    #[test]
    fn pass_through_fails_closed_when_gpu_only() {
        let options = UpscaleOptions {
            enable: true,
            factor: 2.0,
            gpu_only: true,
        };
        let err = pass_through(vec![page(10, 10)], &options).unwrap_err();
        assert!(matches!(err, PipelineError::NoGpuUpscale));

        let options = UpscaleOptions {
            enable: true,
            factor: 2.0,
            gpu_only: false,
        };
        let outcome = pass_through(vec![page(10, 10)], &options).unwrap();
        assert!(outcome.engine.is_none());
        assert_eq!(outcome.pages[0].image.dimensions(), (10, 10));
    }

    #[tokio::test]
    async fn bicubic_backend_scales_by_the_requested_factor() {
        let dir = tempfile::tempdir().unwrap();
        let options = UpscaleOptions {
            enable: true,
            factor: 2.0,
            gpu_only: false,
        };
        let hat = crate::hat::detect_hat_runtime(Default::default(), false);
        let runtime = FfmpegRuntime::with_binaries("ffmpeg", "ffprobe");
        let outcome = run_backend(
            vec![page(40, 30)],
            UpscaleBackend::OpencvCuda,
            &options,
            &hat,
            &runtime,
            dir.path(),
            true,
        )
        .await
        .unwrap();
        assert_eq!(outcome.engine, Some(UpscaleBackend::OpencvCuda));
        assert_eq!(outcome.pages[0].image.dimensions(), (80, 60));
    }

    #[test]
    fn unsharp_mask_leaves_flat_regions_untouched() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([180, 180, 180]));
        let sharpened = unsharp_mask(&flat, SHARPEN_RADIUS, SHARPEN_AMOUNT);
        assert_eq!(sharpened, flat);
    }

    #[test]
    fn unsharp_mask_increases_edge_contrast() {
        let mut image = RgbImage::from_pixel(32, 32, Rgb([220, 220, 220]));
        for y in 0..32 {
            for x in 0..16 {
                image.put_pixel(x, y, Rgb([40, 40, 40]));
            }
        }
        let sharpened = unsharp_mask(&image, SHARPEN_RADIUS, SHARPEN_AMOUNT);
        // Pixels immediately on the dark side of the edge get darker,
        // the bright side gets brighter.
        assert!(sharpened.get_pixel(15, 16).0[0] <= image.get_pixel(15, 16).0[0]);
        assert!(sharpened.get_pixel(16, 16).0[0] >= image.get_pixel(16, 16).0[0]);
    }
}
