//! Child-process plumbing shared by the process-backed sandboxes.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{OutputLine, OutputStream, ProcessExit};

/// Longest line forwarded; the remainder of an oversized line is discarded.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Kill the entire process group led by `pid` via `killpg(SIGKILL)`.
///
/// Requires the child to have been spawned with `process_group(0)` so that its
/// PGID equals its PID. No-op if the group is already gone or the PID cannot
/// be represented as `i32`.
pub fn kill_process_group(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

pub fn exit_from_status(pid: Option<u32>, status: ExitStatus) -> ProcessExit {
    let exit_code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1);
    ProcessExit { pid, exit_code }
}

/// Take the child's stdout/stderr and forward them line by line.
///
/// Each stream gets its own reader task; lines of one stream keep their order.
/// The receiver closes once both streams reach EOF.
pub fn stream_output(child: &mut Child, capacity: usize) -> mpsc::Receiver<OutputLine> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputStream::Stderr, tx);
    }
    rx
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            match read_bounded_line(&mut reader, &mut buf).await {
                Ok(true) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = OutputLine {
                        stream,
                        text: text.trim_end_matches('\r').to_string(),
                    };
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    debug!(?stream, error = %e, "output stream read failed");
                    break;
                }
            }
        }
    });
}

/// Read one `\n`-terminated line into `buf`, keeping at most
/// [`MAX_LINE_BYTES`]. Returns `false` at EOF with nothing read.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any);
        }
        read_any = true;
        let room = MAX_LINE_BYTES.saturating_sub(buf.len());
        match available.iter().position(|b| *b == b'\n') {
            Some(newline) => {
                buf.extend_from_slice(available.get(..newline.min(room)).unwrap_or_default());
                reader.consume(newline + 1);
                return Ok(true);
            }
            None => {
                let len = available.len();
                buf.extend_from_slice(available.get(..len.min(room)).unwrap_or_default());
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    async fn collect(mut rx: mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn stream_output_splits_streams_and_keeps_order() {
        let mut child = sh("echo one; echo two; echo oops >&2; printf tail");
        let rx = stream_output(&mut child, 16);
        let lines = collect(rx).await;
        child.wait().await.unwrap();

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, ["one", "two", "tail"]);
        assert!(lines.contains(&OutputLine::stderr("oops")));
    }

    #[tokio::test]
    async fn oversized_line_is_truncated() {
        let script = format!("head -c {} /dev/zero | tr '\\0' a; echo; echo next", MAX_LINE_BYTES + 10);
        let mut child = sh(&script);
        let lines = collect(stream_output(&mut child, 4)).await;
        child.wait().await.unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text.len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].text, "next");
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let mut child = sh("exit 7");
        let pid = child.id();
        let status = child.wait().await.unwrap();
        let exit = exit_from_status(pid, status);
        assert_eq!(exit.exit_code, 7);
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn kill_process_group_kills_grandchildren() {
        let mut child = sh("sleep 30 & sleep 30; wait");
        let pid = child.id().unwrap();
        let rx = stream_output(&mut child, 4);

        kill_process_group(pid);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_from_status(Some(pid), status).exit_code, 128 + 9);
        // The backgrounded sleep held the pipes; they close only if it died too.
        tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
    }
}
