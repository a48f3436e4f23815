//! Access to the live screen: availability, frontmost app, and capture.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

const OSASCRIPT_TIMEOUT: Duration = Duration::from_secs(5);
const SCREENCAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

const SCREENSAVER_PROBE: &str =
    "tell application \"System Events\" to tell screen saver preferences to get running";
const FRONTMOST_PROBE: &str = "tell application \"System Events\" to get bundle identifier of \
     (first process whose frontmost is true)";

/// What the capture loop needs from the machine it runs on. The production
/// implementation shells out to macOS tools; tests substitute their own.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    /// Whether there is anything worth capturing right now.
    async fn is_available(&self) -> bool;

    /// Bundle id of the frontmost app, best effort.
    async fn frontmost_app(&self) -> Option<String>;

    /// Captures the screen into `dest` as PNG.
    async fn capture(&self, dest: &Path) -> Result<()>;
}

/// Screen access through `osascript` and `screencapture`.
pub struct MacScreenSource;

#[async_trait]
impl ScreenSource for MacScreenSource {
    async fn is_available(&self) -> bool {
        // A failed probe counts as available; the capture itself is the
        // authoritative check and fails cleanly on a dark screen
        match run_osascript(SCREENSAVER_PROBE).await {
            Ok(result) => result != "true",
            Err(err) => {
                log::debug!("Screensaver probe failed, assuming screen is up: {err:#}");
                true
            }
        }
    }

    async fn frontmost_app(&self) -> Option<String> {
        match run_osascript(FRONTMOST_PROBE).await {
            Ok(bundle_id) if !bundle_id.is_empty() => Some(bundle_id),
            Ok(_) => None,
            Err(err) => {
                log::debug!("Frontmost app probe failed: {err:#}");
                None
            }
        }
    }

    async fn capture(&self, dest: &Path) -> Result<()> {
        let output = Command::new("screencapture")
            .args(["-x", "-t", "png"])
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(SCREENCAPTURE_TIMEOUT, output)
            .await
            .map_err(|_| anyhow!("screencapture timed out"))?
            .context("failed to run screencapture")?;

        if !output.status.success() {
            bail!(
                "screencapture exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !dest.is_file() {
            bail!("screencapture reported success but wrote nothing");
        }
        Ok(())
    }
}

async fn run_osascript(script: &str) -> Result<String> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(OSASCRIPT_TIMEOUT, output)
        .await
        .map_err(|_| anyhow!("osascript timed out"))?
        .context("failed to run osascript")?;

    if !output.status.success() {
        bail!(
            "osascript exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
