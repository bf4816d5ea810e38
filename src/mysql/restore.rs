// dbshuttle/src/mysql/restore.rs
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionParams;
use crate::errors::{AppError, Result};

/// Statements fed ahead of the payload so the load is not slowed down or
/// aborted by constraint checking against half-restored data.
const INTEGRITY_PREAMBLE: &str =
    "SET FOREIGN_KEY_CHECKS=0;\nSET UNIQUE_CHECKS=0;\nSET AUTOCOMMIT=0;\n";
/// Written after the payload. The disables are session-scoped, so the
/// re-enable has to travel on the same connection, before it closes.
const INTEGRITY_TAIL: &str = "COMMIT;\nSET FOREIGN_KEY_CHECKS=1;\nSET UNIQUE_CHECKS=1;\n";

#[derive(Debug, Clone)]
pub struct RestoreSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub password: Option<String>,
    /// Whether to wrap the payload in the integrity-relaxation statements.
    /// Disabled when the target executable does not speak SQL.
    pub relax_integrity_checks: bool,
}

impl RestoreSpec {
    pub fn new(
        override_path: Option<&Path>,
        params: &ConnectionParams,
        target_database: &str,
    ) -> Result<Self> {
        let program = super::resolve_program(override_path, "mysql")?;
        Ok(RestoreSpec {
            program,
            args: restore_args(params, target_database),
            password: params.password.clone(),
            relax_integrity_checks: true,
        })
    }
}

/// Builds the mysql client argument vector; the target database is always
/// the final argument.
pub fn restore_args(params: &ConnectionParams, target_database: &str) -> Vec<String> {
    vec![
        "--host".to_string(),
        params.host.clone(),
        "--port".to_string(),
        params.port.to_string(),
        "--user".to_string(),
        params.user.clone(),
        target_database.to_string(),
    ]
}

fn is_broken_pipe(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::BrokenPipe
}

async fn feed_stdin(
    stdin: &mut ChildStdin,
    rx: &mut Receiver<Bytes>,
    relax: bool,
) -> std::result::Result<u64, std::io::Error> {
    let mut fed = 0u64;
    if relax {
        stdin.write_all(INTEGRITY_PREAMBLE.as_bytes()).await?;
    }
    while let Some(chunk) = rx.recv().await {
        stdin.write_all(&chunk).await?;
        fed += chunk.len() as u64;
    }
    if relax {
        stdin.write_all(INTEGRITY_TAIL.as_bytes()).await?;
    }
    stdin.shutdown().await?;
    Ok(fed)
}

/// Spawns the restore process and feeds it the payload arriving on `rx`.
///
/// A broken-pipe write error is provisional: the process may already have
/// decided to exit and closed its input, so the exit code determines the
/// final outcome. Any other write error kills the process and fails the
/// stage immediately. A non-zero exit always wins over an earlier
/// suppressed pipe error.
pub async fn stream_restore(
    spec: &RestoreSpec,
    mut rx: Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<u64> {
    let label = super::program_label(&spec.program);

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(password) = &spec.password {
        command.env("MYSQL_PWD", password);
    }

    let mut child = command.spawn().map_err(|e| AppError::Spawn {
        program: label.clone(),
        source: e,
    })?;

    let mut stdin = child.stdin.take().ok_or_else(|| AppError::Pipe {
        program: label.clone(),
        source: std::io::Error::other("stdin was not captured"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| AppError::Pipe {
        program: label.clone(),
        source: std::io::Error::other("stderr was not captured"),
    })?;
    let stderr_task = tokio::spawn(super::read_stderr_tail(stderr));

    let fed = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Ok(0);
        }
        result = feed_stdin(&mut stdin, &mut rx, spec.relax_integrity_checks) => match result {
            Ok(fed) => fed,
            Err(e) if is_broken_pipe(&e) => {
                // The process closed its end; let its exit code decide.
                0
            }
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(AppError::Pipe { program: label, source: e });
            }
        }
    };
    drop(stdin);
    drop(rx);

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Ok(fed);
        }
        status = child.wait() => status?,
    };
    let stderr_tail = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(AppError::ProcessExit {
            program: label,
            code: status.code().unwrap_or(-1),
            stderr_tail,
        });
    }
    Ok(fed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> RestoreSpec {
        RestoreSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            password: None,
            relax_integrity_checks: false,
        }
    }

    #[test]
    fn target_database_is_the_final_argument() {
        let params = ConnectionParams {
            host: "db.internal".to_string(),
            port: 3307,
            user: "restore".to_string(),
            password: None,
        };
        let args = restore_args(&params, "app_restored");
        assert_eq!(args.last().map(String::as_str), Some("app_restored"));
        assert_eq!(args[1], "db.internal");
        assert_eq!(args[3], "3307");
    }

    #[tokio::test]
    async fn feeds_the_payload_and_resolves_on_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("received.sql");
        let spec = sh(&format!("cat > {}", out_path.display()));

        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(async move {
            for line in ["INSERT INTO t VALUES (1);\n", "INSERT INTO t VALUES (2);\n"] {
                tx.send(Bytes::from_static(line.as_bytes())).await.unwrap();
            }
        });

        let fed = stream_restore(&spec, rx, CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(fed, 52);
        let received = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(
            received,
            "INSERT INTO t VALUES (1);\nINSERT INTO t VALUES (2);\n"
        );
    }

    #[tokio::test]
    async fn integrity_wrapping_brackets_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("received.sql");
        let mut spec = sh(&format!("cat > {}", out_path.display()));
        spec.relax_integrity_checks = true;

        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"INSERT INTO t VALUES (1);\n"))
            .await
            .unwrap();
        drop(tx);

        stream_restore(&spec, rx, CancellationToken::new())
            .await
            .unwrap();
        let received = std::fs::read_to_string(&out_path).unwrap();
        assert!(received.starts_with("SET FOREIGN_KEY_CHECKS=0;"));
        assert!(received.contains("INSERT INTO t VALUES (1);"));
        assert!(received.trim_end().ends_with("SET UNIQUE_CHECKS=1;"));
    }

    #[tokio::test]
    async fn broken_pipe_with_exit_zero_is_a_success() {
        // The process exits cleanly without reading its input; writes hit a
        // closed pipe but the exit code is authoritative.
        let spec = sh("exit 0");
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(async move {
            let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
            for _ in 0..64 {
                if tx.send(chunk.clone()).await.is_err() {
                    break;
                }
            }
        });

        let result = stream_restore(&spec, rx, CancellationToken::new()).await;
        writer.await.unwrap();
        assert!(result.is_ok(), "expected success, got {:?}", result);
    }

    #[tokio::test]
    async fn broken_pipe_with_nonzero_exit_surfaces_the_exit_code() {
        let spec = sh("echo 'syntax error near INSERT' >&2; exit 5");
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(async move {
            let chunk = Bytes::from(vec![b'x'; 64 * 1024]);
            for _ in 0..64 {
                if tx.send(chunk.clone()).await.is_err() {
                    break;
                }
            }
        });

        let err = stream_restore(&spec, rx, CancellationToken::new())
            .await
            .unwrap_err();
        writer.await.unwrap();
        match err {
            AppError::ProcessExit {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, 5);
                assert!(stderr_tail.contains("syntax error"));
            }
            other => panic!("expected ProcessExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let spec = RestoreSpec {
            program: PathBuf::from("/nonexistent/mysql"),
            args: Vec::new(),
            password: None,
            relax_integrity_checks: false,
        };
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let err = stream_restore(&spec, rx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
    }
}
