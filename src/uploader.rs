//! Uploader child-process supervision.
//!
//! The uploader is an external ffmpeg that reads this service's playlist back
//! over loopback HTTP and pushes it to the configured ingest endpoint. This
//! module owns the target-specific command lines, the spawn, the merged
//! stdout/stderr log pump, and graceful-then-forced termination.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::UploaderError;
use crate::models::RelayTarget;

/// How long a retiring child gets to exit on its own before being killed.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the full ffmpeg argument vector for one uploader run.
///
/// `start_index` is present only for the initial buffered start; a live-edge
/// restart omits it so the child picks up the newest segment on its own. The
/// reconnect/reload counters follow the stall timeout so the child holds on
/// at least as long as the ingest side would.
pub fn command_args(
    config: &Config,
    session_id: &str,
    stream_key: &str,
    target: RelayTarget,
    start_index: Option<u64>,
) -> Vec<String> {
    let hold = config.relay.missing_segment_timeout.as_secs().to_string();

    let mut args: Vec<String> = [
        "-reconnect",
        "1",
        "-reconnect_at_eof",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_on_network_error",
        "1",
        "-reconnect_on_http_error",
        "4xx,5xx",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    for flag in ["-reconnect_delay_max", "-max_reload", "-m3u8_hold_counters", "-seg_max_retry"] {
        args.push(flag.to_string());
        args.push(hold.clone());
    }

    if let Some(index) = start_index {
        args.push("-live_start_index".to_string());
        args.push(index.to_string());
    }

    args.extend(
        [
            "-copyts",
            "-fflags",
            "+igndts",
            "-re",
            "-i",
        ]
        .into_iter()
        .map(str::to_string),
    );
    args.push(format!(
        "http://127.0.0.1:{}/segments/{}/playlist.m3u8",
        config.web.port, session_id
    ));

    match target {
        RelayTarget::Youtube => {
            args.extend(
                [
                    "-c",
                    "copy",
                    "-fps_mode",
                    "passthrough",
                    "-master_pl_name",
                    "master.m3u8",
                    "-http_persistent",
                    "1",
                    "-f",
                    "hls",
                    "-hls_playlist_type",
                    "event",
                    "-hls_allow_cache",
                    "1",
                    "-method",
                    "POST",
                ]
                .into_iter()
                .map(str::to_string),
            );
            args.push(format!(
                "https://a.upload.youtube.com/http_upload_hls?cid={stream_key}&copy=0&file=master.m3u8"
            ));
        }
        RelayTarget::Twitch => {
            args.extend(
                [
                    "-c:v",
                    "libx264",
                    "-preset",
                    "veryfast",
                    "-b:v",
                    "8M",
                    "-pix_fmt",
                    "yuv420p",
                    "-bufsize",
                    "16000k",
                    "-g",
                    "60",
                    "-c:a",
                    "copy",
                    "-fps_mode",
                    "passthrough",
                    "-f",
                    "flv",
                    "-rtmp_buffer",
                    "10000",
                ]
                .into_iter()
                .map(str::to_string),
            );
            args.push(format!(
                "rtmp://ingest.global-contribute.live-video.net/app/{stream_key}"
            ));
        }
    }

    args
}

/// Spawn the uploader and start pumping its output into the host log.
pub fn spawn(
    config: &Config,
    session_id: &str,
    stream_key: &str,
    target: RelayTarget,
    start_index: Option<u64>,
) -> Result<UploaderHandle, UploaderError> {
    let args = command_args(config, session_id, stream_key, target, start_index);

    let mut child = Command::new(&config.relay.ffmpeg_command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_lines(stdout, session_id.to_string()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_lines(stderr, session_id.to_string()));
    }

    info!(
        session_id,
        %target,
        pid = ?child.id(),
        ?start_index,
        "uploader started"
    );

    Ok(UploaderHandle {
        session_id: session_id.to_string(),
        child,
        pumps,
    })
}

/// Stream every line of child output to the host log. Ends at pipe EOF.
fn pump_lines(reader: impl AsyncRead + Unpin + Send + 'static, session_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[uploader {session_id}] {line}");
        }
    })
}

/// Exit status or signal in the form recorded in session events.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown exit".to_string()
}

/// Liveness of a supervised child, polled without blocking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(String),
}

/// One supervised uploader child with its log-pump tasks.
#[derive(Debug)]
pub struct UploaderHandle {
    session_id: String,
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl UploaderHandle {
    /// Non-blocking liveness probe; reaps the child when it has exited.
    pub fn try_status(&mut self) -> ChildStatus {
        match self.child.try_wait() {
            Ok(Some(status)) => ChildStatus::Exited(describe_exit(&status)),
            Ok(None) => ChildStatus::Running,
            Err(e) => {
                warn!(session_id = %self.session_id, "failed to poll uploader: {e}");
                ChildStatus::Exited("unknown exit".to_string())
            }
        }
    }

    /// Signal the child to terminate, wait up to [`GRACEFUL_STOP_TIMEOUT`],
    /// then kill. Returns the observed exit description, if any.
    pub async fn shutdown(mut self) -> Option<String> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(describe_exit(&status));
        }

        self.request_termination();
        let observed = match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Some(describe_exit(&status)),
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, "error waiting for uploader: {e}");
                None
            }
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    "uploader did not exit within {GRACEFUL_STOP_TIMEOUT:?}, killing"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(session_id = %self.session_id, "failed to kill uploader: {e}");
                }
                self.child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(|status| describe_exit(&status))
            }
        };

        // The pumps drain to EOF on their own once the pipes close.
        for pump in self.pumps.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
        }

        observed
    }

    #[cfg(unix)]
    fn request_termination(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn request_termination(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, Config, RelayConfig, StorageConfig, WebConfig};

    fn test_config() -> Config {
        Config {
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthConfig {
                username: "user".to_string(),
                password: "pass".to_string(),
            },
            storage: StorageConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    #[test]
    fn youtube_command_line_is_exact() {
        let config = test_config();
        let args = command_args(&config, "key_20260801_101500", "key", RelayTarget::Youtube, Some(0));

        let expected: Vec<String> = [
            "-reconnect",
            "1",
            "-reconnect_at_eof",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_on_network_error",
            "1",
            "-reconnect_on_http_error",
            "4xx,5xx",
            "-reconnect_delay_max",
            "60",
            "-max_reload",
            "60",
            "-m3u8_hold_counters",
            "60",
            "-seg_max_retry",
            "60",
            "-live_start_index",
            "0",
            "-copyts",
            "-fflags",
            "+igndts",
            "-re",
            "-i",
            "http://127.0.0.1:8080/segments/key_20260801_101500/playlist.m3u8",
            "-c",
            "copy",
            "-fps_mode",
            "passthrough",
            "-master_pl_name",
            "master.m3u8",
            "-http_persistent",
            "1",
            "-f",
            "hls",
            "-hls_playlist_type",
            "event",
            "-hls_allow_cache",
            "1",
            "-method",
            "POST",
            "https://a.upload.youtube.com/http_upload_hls?cid=key&copy=0&file=master.m3u8",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        assert_eq!(args, expected);
    }

    #[test]
    fn twitch_command_line_is_exact() {
        let config = test_config();
        let args = command_args(&config, "key_20260801_101500", "key", RelayTarget::Twitch, None);

        assert!(!args.contains(&"-live_start_index".to_string()));
        let tail: Vec<String> = [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-b:v",
            "8M",
            "-pix_fmt",
            "yuv420p",
            "-bufsize",
            "16000k",
            "-g",
            "60",
            "-c:a",
            "copy",
            "-fps_mode",
            "passthrough",
            "-f",
            "flv",
            "-rtmp_buffer",
            "10000",
            "rtmp://ingest.global-contribute.live-video.net/app/key",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        assert!(args.ends_with(&tail));
    }

    #[test]
    fn live_edge_restart_omits_the_start_index() {
        let config = test_config();
        let args = command_args(&config, "s", "key", RelayTarget::Youtube, None);
        assert!(!args.contains(&"-live_start_index".to_string()));

        let args = command_args(&config, "s", "key", RelayTarget::Youtube, Some(42));
        let pos = args.iter().position(|a| a == "-live_start_index").unwrap();
        assert_eq!(args[pos + 1], "42");
    }

    #[test]
    fn exit_descriptions_cover_codes() {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let status = ExitStatus::from_raw(0x100);
            assert_eq!(describe_exit(&status), "exit code 1");
            let status = ExitStatus::from_raw(9);
            assert_eq!(describe_exit(&status), "signal 9");
        }
    }
}
