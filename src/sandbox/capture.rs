//! Bounded capture of sandbox output streams
//!
//! A runaway process must never grow the judge's memory: at most `cap` bytes
//! are kept, and crossing the cap fires the overflow token so the caller can
//! kill the process.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::BackendError;

const CHUNK_SIZE: usize = 8192;

/// Captured stream contents
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// The stream produced more than the cap
    pub truncated: bool,
}

impl Captured {
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `reader` to EOF keeping at most `cap` bytes.
///
/// Stops reading as soon as the cap is exceeded, cancels `overflow` and
/// returns the truncated prefix.
pub async fn read_capped<R>(
    mut reader: R,
    cap: usize,
    overflow: CancellationToken,
) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::with_capacity(cap.min(CHUNK_SIZE));
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Captured {
                bytes,
                truncated: false,
            });
        }

        let room = cap.saturating_sub(bytes.len());
        if n > room {
            bytes.extend_from_slice(&chunk[..room]);
            overflow.cancel();
            return Ok(Captured {
                bytes,
                truncated: true,
            });
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
}

/// Read at most `cap` bytes of a file, flagging whether more were present
pub async fn read_file_capped(path: &std::path::Path, cap: usize) -> std::io::Result<Captured> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Captured::default()),
        Err(e) => return Err(e),
    };
    read_capped(file, cap, CancellationToken::new()).await
}

/// Capture a child's stream in the background
pub fn spawn_capture<R>(
    stream: Option<R>,
    cap: usize,
    overflow: CancellationToken,
) -> JoinHandle<std::io::Result<Captured>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(stream) => read_capped(stream, cap, overflow).await,
            None => Ok(Captured::default()),
        }
    })
}

pub async fn join_capture(
    task: JoinHandle<std::io::Result<Captured>>,
) -> Result<Captured, BackendError> {
    let captured = task.await.map_err(|e| BackendError::Command {
        action: "output capture",
        message: e.to_string(),
    })??;
    Ok(captured)
}
