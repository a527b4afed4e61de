//! Live log following.
//!
//! Each subscriber gets its own follow process, owned by a task that lives
//! exactly as long as the [`LogFollower`] handle. Dropping the handle kills
//! the process; the process exiting ends the event stream with its exit code.

use std::process::Stdio;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task::JoinHandle,
};

const CHUNK_BYTES: usize = 8 * 1024;
const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Output as it arrived (stdout and stderr interleaved). A character split
    /// across reads is held back until it is complete.
    Chunk(String),
    /// The follow process ended. `None` if it was killed by a signal.
    Exited(Option<i32>),
}

#[derive(Debug)]
pub struct LogFollower {
    rx: mpsc::Receiver<LogEvent>,
    task: JoinHandle<()>,
}

/// Length of the prefix of `bytes` that can be decoded now. What follows is
/// the start of a character whose remaining bytes have not arrived yet.
fn decodable_len(bytes: &[u8]) -> usize {
    let mut offset = 0;
    loop {
        match std::str::from_utf8(&bytes[offset..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                // Invalid in the middle: let lossy decoding replace it.
                Some(bad) => offset += e.valid_up_to() + bad,
                None => return offset + e.valid_up_to(),
            },
        }
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<LogEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let cut = decodable_len(&pending);
        if cut == 0 {
            continue;
        }
        let chunk = String::from_utf8_lossy(&pending[..cut]).into_owned();
        pending.drain(..cut);
        if tx.send(LogEvent::Chunk(chunk)).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let rest = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(LogEvent::Chunk(rest)).await;
    }
}

impl LogFollower {
    pub fn spawn(program: &str, args: &[String]) -> std::io::Result<Self> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::channel::<LogEvent>(CHANNEL_DEPTH);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let task = tokio::spawn(async move {
            let out_task = stdout.map(|s| tokio::spawn(pump(s, tx.clone())));
            let err_task = stderr.map(|s| tokio::spawn(pump(s, tx.clone())));
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::debug!(error = %e, "failed to wait for log follower");
                    None
                }
            };
            let _ = tx.send(LogEvent::Exited(code)).await;
        });

        Ok(Self { rx, task })
    }

    /// Next event, or `None` once the exit event has been delivered.
    pub async fn next(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        // Aborting drops the child handle, and kill_on_drop reaps the process.
        self.task.abort();
    }
}
