use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use tokio::process::Command;

use crate::config::QueueConfig;
use crate::progress;

/// Build the ffprobe invocation that prints only the container duration
pub fn probe_command(cfg: &QueueConfig, file_path: &Path) -> Command {
    let mut cmd = Command::new(&cfg.ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=noprint_wrappers=1")
        .arg(file_path)
        .kill_on_drop(true);
    cmd
}

/// Run ffprobe on `file_path` and return its duration in whole seconds.
///
/// `Ok(None)` means ffprobe ran but reported no usable duration (live
/// streams, some raw formats).
pub async fn probe_duration(cfg: &QueueConfig, file_path: &Path) -> Result<Option<i64>> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("ffprobe: probing duration of {}", file_path.display());

    let output = probe_command(cfg, file_path)
        .output()
        .await
        .with_context(|| format!("Failed to execute {} for: {}", cfg.ffprobe_bin.display(), file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let stdout = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let duration = progress::find_probe_duration(&stdout);
    debug!("ffprobe: {} -> {:?}", file_path.display(), duration);
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_probe_command_arguments() {
        let mut cfg = QueueConfig::default_config();
        cfg.ffprobe_bin = PathBuf::from("/opt/ffmpeg/bin/ffprobe");
        let cmd = probe_command(&cfg, Path::new("/media/My Movie.mkv"));
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/opt/ffmpeg/bin/ffprobe");
        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1",
                "/media/My Movie.mkv",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let cfg = QueueConfig::default_config();
        let err = probe_duration(&cfg, Path::new("/definitely/not/here.mkv"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_duration_from_stub_probe() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let stub = dir.path().join("ffprobe");
        std::fs::write(&stub, "#!/bin/sh\necho duration=5025.120000\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        let media = dir.path().join("clip.mkv");
        std::fs::write(&media, b"").unwrap();

        let mut cfg = QueueConfig::default_config();
        cfg.ffprobe_bin = stub;
        assert_eq!(probe_duration(&cfg, &media).await.unwrap(), Some(5025));
    }
}
