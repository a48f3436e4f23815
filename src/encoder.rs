//! Video encoding through an external ffmpeg.
//!
//! Frames are copied into a scratch directory as `frame_%05d.png`, encoded
//! into a `.part` file next to the final destination, and renamed into
//! place only on success. A crash or kill mid-encode leaves a `.part`
//! leftover and never a half-written `.mp4`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::paths;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Environment override for the ffmpeg binary, set by the launch agent.
pub const FFMPEG_PATH_ENV: &str = "FFMPEG_PATH";
pub const FFPROBE_PATH_ENV: &str = "FFPROBE_PATH";

const ENCODE_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const VIDEO_CODEC: &str = "libx264";
const ENCODE_PRESET: &str = "veryfast";
const PIXEL_FORMAT: &str = "yuv420p";

/// Everything needed to encode one group of frames into one video file.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Frame files in display order.
    pub frame_paths: Vec<PathBuf>,
    /// Final `.mp4` destination.
    pub dest_path: PathBuf,
    pub fps: f64,
    pub crf: u8,
}

/// What an encode produced. Dimensions come from probing the output and
/// may be absent when the probe fails; the caller falls back to the source
/// frame dimensions.
#[derive(Debug, Clone, Copy)]
pub struct EncodedVideo {
    pub file_size_bytes: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Seam between the pipeline and the actual encoder, so processing logic
/// can be exercised without an ffmpeg binary.
#[async_trait]
pub trait SegmentEncoder: Send + Sync {
    async fn encode(&self, request: EncodeRequest) -> Result<EncodedVideo>;

    fn check_available(&self) -> bool {
        true
    }
}

/// The production encoder: shells out to ffmpeg and ffprobe.
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegEncoder {
    /// Locates ffmpeg and ffprobe: environment override first, then the
    /// usual install locations, then `$PATH`, then the bare name as a last
    /// resort.
    pub fn discover() -> Self {
        FfmpegEncoder {
            ffmpeg_path: discover_tool("ffmpeg", std::env::var_os(FFMPEG_PATH_ENV)),
            ffprobe_path: discover_tool("ffprobe", std::env::var_os(FFPROBE_PATH_ENV)),
        }
    }

    /// Reads width and height from the encoded file. Any failure maps to
    /// `(None, None)`; a bad probe must not fail an otherwise good encode.
    async fn probe_video_dimensions(&self, path: &Path) -> (Option<u32>, Option<u32>) {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                log_warn!(
                    "ffprobe failed for {}: {}",
                    path.display(),
                    stderr_excerpt(&output.stderr)
                );
                return (None, None);
            }
            Ok(Err(err)) => {
                log_warn!("ffprobe could not start for {}: {err}", path.display());
                return (None, None);
            }
            Err(_) => {
                log_warn!("ffprobe timed out for {}", path.display());
                return (None, None);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());
        let width = lines.next().and_then(|line| line.trim().parse().ok());
        let height = lines.next().and_then(|line| line.trim().parse().ok());
        (width, height)
    }
}

#[async_trait]
impl SegmentEncoder for FfmpegEncoder {
    async fn encode(&self, request: EncodeRequest) -> Result<EncodedVideo> {
        if request.frame_paths.is_empty() {
            bail!("cannot encode an empty frame group");
        }

        if let Some(parent) = request.dest_path.parent() {
            paths::create_private_dir(parent).with_context(|| {
                format!("failed to create segment directory {}", parent.display())
            })?;
        }

        // Stage frames under sequential names, which is the input layout
        // ffmpeg's image2 demuxer expects.
        let staging = tempfile::tempdir().context("failed to create encode staging directory")?;
        let staging_dir = staging.path().to_path_buf();
        let frame_paths = request.frame_paths.clone();
        tokio::task::spawn_blocking(move || stage_frames(&frame_paths, &staging_dir))
            .await
            .context("frame staging task panicked")??;

        let part_path = part_path_for(&request.dest_path);
        let args = encode_args(staging.path(), request.fps, request.crf, &part_path);

        let mut command = nice_command(&self.ffmpeg_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("failed to start {}", self.ffmpeg_path.display()))?;

        // kill_on_drop reaps the child if the timeout drops the future
        let output = match tokio::time::timeout(ENCODE_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => output.context("failed to wait for ffmpeg")?,
            Err(_) => {
                remove_stale_part(&part_path);
                bail!(
                    "ffmpeg timed out after {}s encoding {}",
                    ENCODE_TIMEOUT.as_secs(),
                    request.dest_path.display()
                );
            }
        };

        if !output.status.success() {
            remove_stale_part(&part_path);
            bail!(
                "ffmpeg exited with {} for {}: {}",
                output.status,
                request.dest_path.display(),
                stderr_excerpt(&output.stderr)
            );
        }

        if !part_path.is_file() {
            bail!(
                "ffmpeg succeeded but produced no output at {}",
                part_path.display()
            );
        }

        paths::restrict_file_permissions(&part_path).with_context(|| {
            format!("failed to restrict permissions on {}", part_path.display())
        })?;
        std::fs::rename(&part_path, &request.dest_path).with_context(|| {
            format!(
                "failed to move encoded video into place at {}",
                request.dest_path.display()
            )
        })?;

        let file_size_bytes = std::fs::metadata(&request.dest_path)
            .with_context(|| format!("failed to stat {}", request.dest_path.display()))?
            .len();

        let (width, height) = self.probe_video_dimensions(&request.dest_path).await;

        log_info!(
            "Encoded {} frames into {} ({} bytes)",
            request.frame_paths.len(),
            request.dest_path.display(),
            file_size_bytes
        );

        Ok(EncodedVideo {
            file_size_bytes,
            width,
            height,
        })
    }

    fn check_available(&self) -> bool {
        tool_available(&self.ffmpeg_path) && tool_available(&self.ffprobe_path)
    }
}

/// Staging name for an in-progress encode, next to its destination so the
/// final rename never crosses a filesystem.
pub fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn stage_frames(frame_paths: &[PathBuf], staging_dir: &Path) -> Result<()> {
    for (index, frame_path) in frame_paths.iter().enumerate() {
        let target = staging_dir.join(format!("frame_{:05}.png", index + 1));
        std::fs::copy(frame_path, &target).with_context(|| {
            format!(
                "failed to stage frame {} as {}",
                frame_path.display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

fn encode_args(staging_dir: &Path, fps: f64, crf: u8, part_path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-y".into());
    args.push("-framerate".into());
    args.push(fps.to_string().into());
    args.push("-i".into());
    args.push(staging_dir.join("frame_%05d.png").into_os_string());
    args.push("-c:v".into());
    args.push(VIDEO_CODEC.into());
    args.push("-preset".into());
    args.push(ENCODE_PRESET.into());
    args.push("-crf".into());
    args.push(crf.to_string().into());
    args.push("-pix_fmt".into());
    args.push(PIXEL_FORMAT.into());
    // The .part suffix hides the container from ffmpeg, so state it
    args.push("-f".into());
    args.push("mp4".into());
    args.push(part_path.as_os_str().to_os_string());
    args
}

/// Wraps the encoder in `nice` when available so long encodes stay out of
/// the interactive workload's way.
fn nice_command(program: &Path) -> Command {
    let nice = Path::new("/usr/bin/nice");
    if nice.is_file() {
        let mut command = Command::new(nice);
        command.arg("-n").arg("10").arg(program);
        command
    } else {
        Command::new(program)
    }
}

fn discover_tool(name: &str, env_override: Option<OsString>) -> PathBuf {
    if let Some(path) = env_override {
        let path = PathBuf::from(path);
        if path.is_file() {
            return path;
        }
    }

    for prefix in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"] {
        let candidate = Path::new(prefix).join(name);
        if candidate.is_file() {
            return candidate;
        }
    }

    if let Some(found) = find_in_path(name) {
        return found;
    }

    PathBuf::from(name)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn tool_available(path: &Path) -> bool {
    if path.is_absolute() {
        path.is_file()
    } else {
        path.to_str().and_then(find_in_path).is_some()
    }
}

fn remove_stale_part(part_path: &Path) {
    if let Err(err) = std::fs::remove_file(part_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log_warn!(
                "Failed to remove stale encode output {}: {err}",
                part_path.display()
            );
        }
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.len() <= 500 {
        return trimmed.to_string();
    }
    let tail_start = trimmed.len() - 500;
    let tail_start = (tail_start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(tail_start);
    format!("... {}", &trimmed[tail_start..])
}
