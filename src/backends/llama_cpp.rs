use crate::config::LlamaCppConfig;
use crate::error::{AppError, BackendError};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Minimum time left to gather output once the process has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Chat role markers local engines commonly print before the answer.
/// Only the first match is stripped.
const ROLE_PREFIXES: [&str; 4] = ["Assistant:", "ASSISTANT:", "### Assistant:", "### ASSISTANT:"];

/// Runs a llama.cpp multimodal CLI once per image.
pub struct LlamaCppBackend {
    bin: PathBuf,
    model: PathBuf,
    mmproj: PathBuf,
    extra_args: Vec<String>,
    max_tokens: u32,
    timeout: Duration,
}

impl LlamaCppBackend {
    pub fn new(
        config: &LlamaCppConfig,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let (Some(bin), Some(model), Some(mmproj)) = (&config.bin, &config.model, &config.mmproj)
        else {
            return Err(AppError::InvalidConfig(
                "llama-cpp backend requires --llama-bin, --llama-model, and --llama-mmproj"
                    .to_string(),
            ));
        };

        let extra_args = match config.extra_args.as_deref() {
            Some(raw) => shlex::split(raw).ok_or_else(|| {
                AppError::InvalidConfig(format!("cannot split llama-cpp extra args: {raw:?}"))
            })?,
            None => Vec::new(),
        };
        log::debug!(
            "llama.cpp binary {:?}, model {:?}, extra args {:?}",
            bin,
            model,
            extra_args
        );

        Ok(Self {
            bin: bin.clone(),
            model: model.clone(),
            mmproj: mmproj.clone(),
            extra_args,
            max_tokens,
            timeout,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model
    }

    fn command(&self, image: &Path, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-m")
            .arg(&self.model)
            .arg("--mmproj")
            .arg(&self.mmproj)
            .arg("--image")
            .arg(image)
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    pub fn describe(&self, image: &Path, prompt: &str) -> Result<String, BackendError> {
        let mut child = self.command(image, prompt).spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                BackendError::BinaryNotFound(self.bin.clone())
            } else {
                BackendError::Spawn(e)
            }
        })?;

        let deadline = Instant::now() + self.timeout;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_deadline(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::warn!("llama.cpp exceeded {:?}; killing pid {}", self.timeout, child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::Timeout(self.timeout.as_secs()));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::Spawn(e));
            }
        };

        let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
        let stdout = collect(&stdout, drain_deadline);
        let stderr = collect(&stderr, drain_deadline);

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(BackendError::ProcessFailed {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(clean_output(&stdout, prompt))
    }
}

/// Polls `child` until it exits or `deadline` passes (`Ok(None)`).
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Forwards whatever `pipe` yields, chunk by chunk, until it closes.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
    }
    rx
}

/// Gathers output until the pipe closes or `deadline` passes.
///
/// A helper forked by the binary can keep the pipe open after the binary
/// itself exits; its reader thread is abandoned and the output read so far
/// is used.
fn collect(chunks: &Receiver<Vec<u8>>, deadline: Instant) -> String {
    let mut bytes = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match chunks.recv_timeout(remaining) {
            Ok(chunk) => bytes.extend(chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("llama.cpp output still open at the deadline; using partial output");
                break;
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Strips an echoed prompt and one leading role marker from raw CLI output.
///
/// This is a heuristic: output that echoes the prompt with different
/// whitespace, or uses another marker, passes through unchanged. A second
/// pass is not always a no-op: `"Assistant: Assistant: x"` cleans to
/// `"Assistant: x"` and then to `"x"`.
pub fn clean_output(raw: &str, prompt: &str) -> String {
    let mut cleaned = raw.trim();
    if cleaned.is_empty() {
        return String::new();
    }

    if !prompt.is_empty() {
        if let Some(rest) = cleaned.strip_prefix(prompt) {
            cleaned = rest.trim_start();
        }
    }

    if let Some(rest) = ROLE_PREFIXES
        .iter()
        .find_map(|prefix| cleaned.strip_prefix(prefix))
    {
        cleaned = rest.trim_start();
    }

    cleaned.trim().to_string()
}
