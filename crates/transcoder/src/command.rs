//! ffmpeg argument construction.

use std::path::{Path, PathBuf};

use recast_core::TranscodePlan;
use thiserror::Error;

use crate::HwAccel;
use crate::gpu::VAAPI_DEVICE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("refusing to encode {0} onto itself")]
    OutputIsInput(PathBuf),
    #[error("no encoder for video codec {0:?}")]
    UnsupportedCodec(String),
}

/// Video codecs a plan may target.
pub const SUPPORTED_CODECS: &[&str] = &["h264", "hevc"];

/// The ffmpeg encoder producing `codec` on `accel`, or the software one.
pub fn video_encoder(codec: &str, accel: Option<HwAccel>) -> Result<&'static str, CommandError> {
    let encoder = match (codec.to_ascii_lowercase().as_str(), accel) {
        ("h264", Some(accel)) => accel.encoder(),
        ("h264", None) => "libx264",
        ("hevc", Some(HwAccel::Nvenc)) => "hevc_nvenc",
        ("hevc", Some(HwAccel::Qsv)) => "hevc_qsv",
        ("hevc", Some(HwAccel::Vaapi)) => "hevc_vaapi",
        ("hevc", Some(HwAccel::VideoToolbox)) => "hevc_videotoolbox",
        ("hevc", None) => "libx265",
        _ => return Err(CommandError::UnsupportedCodec(codec.to_string())),
    };
    Ok(encoder)
}

/// Build the ffmpeg arguments for one encode.
///
/// Progress is written as `key=value` lines on stderr (`-progress pipe:2`).
/// `output` must be a temporary path; the library file is never an ffmpeg
/// target.
pub fn build_args(
    input: &Path,
    output: &Path,
    plan: &TranscodePlan,
    accel: Option<HwAccel>,
) -> Result<Vec<String>, CommandError> {
    if input == output {
        return Err(CommandError::OutputIsInput(output.to_path_buf()));
    }

    let accel = if plan.software_only { None } else { accel };
    let encoder = video_encoder(&plan.video_codec, accel)?;
    let height = plan.target_height;
    let quality = plan.quality.to_string();

    let mut args: Vec<String> = ["-hide_banner", "-nostats", "-progress", "pipe:2"]
        .into_iter()
        .map(String::from)
        .collect();

    match accel {
        Some(HwAccel::Qsv) => args.extend(["-hwaccel".into(), "qsv".into()]),
        Some(HwAccel::Nvenc) => args.extend(["-hwaccel".into(), "cuda".into()]),
        Some(HwAccel::Vaapi) => args.extend(["-vaapi_device".into(), VAAPI_DEVICE.into()]),
        Some(HwAccel::VideoToolbox) => {
            args.extend(["-hwaccel".into(), "videotoolbox".into()])
        }
        None => {}
    }

    args.push("-i".into());
    args.push(input.to_string_lossy().into_owned());

    // Never upscale: codec-only conversions keep the source height
    let scale = match accel {
        Some(HwAccel::Vaapi) => format!("format=nv12,hwupload,scale_vaapi=w=-2:h={height}"),
        _ => format!("scale=-2:'min({height},ih)'"),
    };
    args.extend(["-vf".into(), scale]);

    args.extend(["-c:v".into(), encoder.into()]);

    let quality_flag = match accel {
        None => "-crf",
        Some(HwAccel::Qsv) => "-global_quality",
        Some(HwAccel::Nvenc) => "-cq",
        Some(HwAccel::Vaapi) => "-qp",
        Some(HwAccel::VideoToolbox) => "-q:v",
    };
    args.extend([quality_flag.into(), quality]);

    if matches!(accel, None | Some(HwAccel::Qsv) | Some(HwAccel::Nvenc)) {
        args.extend(["-preset".into(), plan.preset.clone()]);
    }

    args.extend([
        "-c:a".into(),
        plan.audio_codec.clone(),
        "-b:a".into(),
        format!("{}k", plan.audio_bitrate_kbps),
        "-c:s".into(),
        plan.subtitle_codec.clone(),
        "-map".into(),
        "0".into(),
    ]);

    if plan.container == "mp4" {
        args.extend(["-movflags".into(), "+faststart".into()]);
        if plan.video_codec.eq_ignore_ascii_case("hevc") {
            args.extend(["-tag:v".into(), "hvc1".into()]);
        }
    }

    args.push("-y".into());
    args.push(output.to_string_lossy().into_owned());

    Ok(args)
}
