//! Process configuration, fixed at startup.
//!
//! Values come from environment defaults (the stream credential triplet)
//! overridden by command-line flags. Thresholds are configuration, never
//! per-call parameters.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// Placeholder frame cadence while no source is reachable.
pub const PLACEHOLDER_INTERVAL: Duration = Duration::from_millis(250);
/// Backoff between reconnect attempts after a read failure.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
/// Per-consumer fan-out ring capacity (bounded staleness).
pub const FANOUT_CAPACITY: usize = 8;

const USAGE: &str = "Usage: sightline [--source <uri>] [--device <index>] [--model <path>] \
[--width <px>] [--height <px>] [--confidence <0..1>] [--iou <0..1>] \
[--classes <id,id,...>] [--fps <n>] [--bind <addr:port>] [--artifact-dir <path>]";

#[derive(Clone, Debug)]
pub struct Config {
    /// Network stream tried first; `None` goes straight to the device.
    pub stream_uri: Option<String>,
    pub device_index: i32,
    pub model_path: PathBuf,
    /// Working resolution every frame is resized to before inference.
    pub working_size: (i32, i32),
    pub confidence: f32,
    pub iou: f32,
    /// Object classes kept after inference; everything else is discarded.
    pub class_filter: Vec<i64>,
    /// Outbound WebRTC media pacing.
    pub target_fps: u32,
    pub bind_addr: String,
    /// Sandboxed directory for processed batch artifacts.
    pub artifact_dir: PathBuf,
}

impl Config {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut cfg = Self::defaults();

        let mut idx = 1;
        while idx < args.len() {
            let flag = args[idx].as_str();
            match flag {
                "--source" => cfg.stream_uri = Some(take_value(args, &mut idx, "--source")?),
                "--device" => {
                    cfg.device_index = take_value(args, &mut idx, "--device")?
                        .parse()
                        .context("--device must be an integer")?
                }
                "--model" => cfg.model_path = PathBuf::from(take_value(args, &mut idx, "--model")?),
                "--width" => {
                    cfg.working_size.0 = take_value(args, &mut idx, "--width")?
                        .parse()
                        .context("--width must be an integer")?
                }
                "--height" => {
                    cfg.working_size.1 = take_value(args, &mut idx, "--height")?
                        .parse()
                        .context("--height must be an integer")?
                }
                "--confidence" => {
                    cfg.confidence = take_value(args, &mut idx, "--confidence")?
                        .parse()
                        .context("--confidence must be a float")?
                }
                "--iou" => {
                    cfg.iou = take_value(args, &mut idx, "--iou")?.parse().context("--iou must be a float")?
                }
                "--classes" => {
                    cfg.class_filter = take_value(args, &mut idx, "--classes")?
                        .split(',')
                        .map(|part| part.trim().parse::<i64>())
                        .collect::<std::result::Result<_, _>>()
                        .context("--classes must be a comma-separated list of integers")?
                }
                "--fps" => {
                    cfg.target_fps = take_value(args, &mut idx, "--fps")?.parse().context("--fps must be an integer")?
                }
                "--bind" => cfg.bind_addr = take_value(args, &mut idx, "--bind")?,
                "--artifact-dir" => cfg.artifact_dir = PathBuf::from(take_value(args, &mut idx, "--artifact-dir")?),
                "--help" | "-h" => bail!(USAGE),
                other => bail!("unknown flag {other}\n{USAGE}"),
            }
            idx += 1;
        }

        if cfg.working_size.0 <= 0 || cfg.working_size.1 <= 0 {
            bail!("working resolution must be positive");
        }
        if cfg.target_fps == 0 {
            bail!("--fps must be at least 1");
        }
        if !(0.0..=1.0).contains(&cfg.confidence) || !(0.0..=1.0).contains(&cfg.iou) {
            bail!("thresholds must lie in [0, 1]");
        }

        Ok(cfg)
    }

    pub(crate) fn defaults() -> Self {
        Self {
            stream_uri: default_stream_uri(),
            device_index: 0,
            model_path: PathBuf::from(
                std::env::var("MODEL_PATH").unwrap_or_else(|_| "models/detector.pt".into()),
            ),
            working_size: (640, 360),
            confidence: 0.4,
            iou: 0.5,
            class_filter: vec![0],
            target_fps: 24,
            bind_addr: "0.0.0.0:8080".into(),
            artifact_dir: std::env::temp_dir().join("sightline"),
        }
    }

    pub fn source_config(&self) -> video_source::LiveSourceConfig {
        video_source::LiveSourceConfig {
            stream_uri: self.stream_uri.clone(),
            device_index: self.device_index,
            target_size: self.working_size,
        }
    }
}

fn take_value(args: &[String], idx: &mut usize, name: &str) -> Result<String> {
    *idx += 1;
    args.get(*idx)
        .cloned()
        .ok_or_else(|| anyhow!("{name} requires a value\n{USAGE}"))
}

/// Compose the default stream URI from the credential triplet, matching
/// the deployment convention `rtsp://<user>:<pass>@<host>:554/stream1`.
fn default_stream_uri() -> Option<String> {
    if let Ok(url) = std::env::var("STREAM_URL") {
        return Some(url);
    }
    let host = std::env::var("STREAM_HOST").ok()?;
    let user = std::env::var("STREAM_USER").unwrap_or_else(|_| "admin".into());
    let pass = std::env::var("STREAM_PASS").unwrap_or_else(|_| "admin".into());
    Some(format!("rtsp://{user}:{pass}@{host}:554/stream1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(flags: &[&str]) -> Result<Config> {
        let mut args = vec!["sightline".to_string()];
        args.extend(flags.iter().map(|s| s.to_string()));
        Config::from_args(&args)
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = parse(&[]).unwrap();
        assert_eq!(cfg.working_size, (640, 360));
        assert_eq!(cfg.confidence, 0.4);
        assert_eq!(cfg.iou, 0.5);
        assert_eq!(cfg.class_filter, vec![0]);
        assert_eq!(cfg.target_fps, 24);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = parse(&[
            "--source",
            "rtsp://cam/main",
            "--width",
            "320",
            "--height",
            "180",
            "--classes",
            "0,2,7",
            "--fps",
            "12",
        ])
        .unwrap();
        assert_eq!(cfg.stream_uri.as_deref(), Some("rtsp://cam/main"));
        assert_eq!(cfg.working_size, (320, 180));
        assert_eq!(cfg.class_filter, vec![0, 2, 7]);
        assert_eq!(cfg.target_fps, 12);
    }

    #[test]
    fn rejects_unknown_flag_and_bad_threshold() {
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--confidence", "1.5"]).is_err());
        assert!(parse(&["--fps", "0"]).is_err());
    }
}
