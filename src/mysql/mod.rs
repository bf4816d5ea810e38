// dbshuttle/src/mysql/mod.rs
pub mod dump;
pub mod lifecycle;
pub mod restore;

use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{AppError, Result};

/// How much trailing stderr to keep for diagnostics. Stderr is never parsed
/// for control flow; exit codes are authoritative.
const STDERR_TAIL_LIMIT: usize = 2048;

/// Resolves an executable: an explicit config override wins, otherwise the
/// PATH is searched. A missing executable is a spawn failure.
pub(crate) fn resolve_program(override_path: Option<&Path>, name: &str) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }
    which::which(name).map_err(|e| AppError::Spawn {
        program: name.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found in PATH: {}", name, e),
        ),
    })
}

pub(crate) fn program_label(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Drains a child's stderr, keeping only the final bytes.
pub(crate) async fn read_stderr_tail<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let excess = tail.len() - STDERR_TAIL_LIMIT;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}
