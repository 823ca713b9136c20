use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Keep the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandRunResult {
    /// Exit code, with `-1` standing in for "terminated by a signal".
    pub fn exit_code(&self) -> i32 {
        self.status.and_then(|s| s.code()).unwrap_or(-1)
    }
}

/// How long reader threads get to flush once the process group is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Spawn `command`, optionally feed `stdin`, and wait at most `timeout`.
///
/// On Unix the child leads its own process group. On timeout the whole group
/// is killed and the leader reaped, so neither the child nor anything it
/// started outlives this call. Output is drained against a deadline; a
/// descendant that escapes the group cannot hold the call open past it.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
    stdin: Option<&[u8]>,
) -> Result<CommandRunResult, String> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let start = Instant::now();
    let deadline = start.checked_add(timeout);
    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;
    let pid = child.id();

    if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let payload = payload.to_vec();
        // Detached: a child that never reads stdin must not block the caller.
        // Closing the pipe on drop signals EOF to the child.
        thread::spawn(move || {
            let _ = pipe.write_all(&payload);
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;
    let stdout_rx = spawn_reader(stdout);
    let stderr_rx = spawn_reader(stderr);

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_group(pid);
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                kill_process_group(pid);
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };
    let elapsed = start.elapsed();

    let drain_deadline = if timed_out {
        Some(Instant::now() + READER_GRACE)
    } else {
        deadline.map(|d| d.max(Instant::now() + READER_GRACE))
    };
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    let stdout_done = drain(&stdout_rx, &mut stdout_bytes, drain_deadline);
    let stderr_done = drain(&stderr_rx, &mut stderr_bytes, drain_deadline);
    if !(stdout_done && stderr_done) {
        // Leftover descendants still hold the pipes open.
        kill_process_group(pid);
        let grace = Some(Instant::now() + READER_GRACE);
        drain(&stdout_rx, &mut stdout_bytes, grace);
        drain(&stderr_rx, &mut stderr_bytes, grace);
    }

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        elapsed,
    })
}

fn spawn_reader<R: Read + Send + 'static>(source: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Collect chunks until the reader hits EOF (`true`) or `deadline` passes (`false`).
fn drain(rx: &Receiver<Vec<u8>>, buf: &mut Vec<u8>, deadline: Option<Instant>) -> bool {
    loop {
        let next = match deadline {
            Some(deadline) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let group = format!("-{}", pgid);
    let _ = Command::new("kill")
        .args(["-KILL", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Join `candidate` onto `root`, rejecting absolute paths and `..` traversal.
pub fn resolve_relative(root: &Path, candidate: &Path) -> Result<PathBuf, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() || candidate.has_root() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }
    Ok(root.join(candidate))
}

/// Render a command line for logs and traces.
pub fn command_label(program: &str, args: &[String]) -> String {
    format!("{} {}", program, args.join(" ")).trim().to_string()
}
