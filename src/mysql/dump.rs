// dbshuttle/src/mysql/dump.rs
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionParams, TargetDescriptor};
use crate::errors::{AppError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// A fully resolved dump invocation: executable, argument vector and the
/// password handed over via the environment so it never shows up in argv.
#[derive(Debug, Clone)]
pub struct DumpSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub password: Option<String>,
}

impl DumpSpec {
    pub fn new(
        override_path: Option<&Path>,
        params: &ConnectionParams,
        target: &TargetDescriptor,
    ) -> Result<Self> {
        let program = super::resolve_program(override_path, "mysqldump")?;
        Ok(DumpSpec {
            program,
            args: dump_args(params, target),
            password: params.password.clone(),
        })
    }
}

/// Builds the mysqldump argument vector. An explicit schema list maps to
/// `--databases`, a single name is passed bare, and the all-databases case
/// uses the dedicated flag.
pub fn dump_args(params: &ConnectionParams, target: &TargetDescriptor) -> Vec<String> {
    let mut args = vec![
        "--host".to_string(),
        params.host.clone(),
        "--port".to_string(),
        params.port.to_string(),
        "--user".to_string(),
        params.user.clone(),
        "--single-transaction".to_string(),
        "--quick".to_string(),
    ];
    match target {
        TargetDescriptor::Schemas(names) => {
            args.push("--databases".to_string());
            args.extend(names.iter().cloned());
        }
        TargetDescriptor::Single(name) => args.push(name.clone()),
        TargetDescriptor::All => args.push("--all-databases".to_string()),
    }
    args
}

/// Spawns the dump process and streams its stdout into `tx` as chunks.
///
/// Success requires both conditions, in either order: the output stream
/// ends and the process reports exit code 0. Stderr is buffered to a capped
/// tail and attached to the failure when the process exits non-zero.
/// Cancellation kills the process and returns without an error; the
/// coordinator owns the failure that triggered the teardown.
pub async fn stream_dump(
    spec: &DumpSpec,
    tx: Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<u64> {
    let label = super::program_label(&spec.program);

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(password) = &spec.password {
        command.env("MYSQL_PWD", password);
    }

    let mut child = command.spawn().map_err(|e| AppError::Spawn {
        program: label.clone(),
        source: e,
    })?;

    let mut stdout = child.stdout.take().ok_or_else(|| AppError::Pipe {
        program: label.clone(),
        source: std::io::Error::other("stdout was not captured"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| AppError::Pipe {
        program: label.clone(),
        source: std::io::Error::other("stderr was not captured"),
    })?;
    let stderr_task = tokio::spawn(super::read_stderr_tail(stderr));

    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Ok(total);
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        stderr_task.abort();
                        return Ok(total);
                    }
                }
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(AppError::Pipe { program: label, source: e });
                }
            }
        }
    }
    drop(stdout);
    drop(tx);

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            return Ok(total);
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
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "db.internal".to_string(),
            port: 3306,
            user: "backup".to_string(),
            password: Some("secret".to_string()),
        }
    }

    fn sh(script: &str) -> DumpSpec {
        DumpSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            password: None,
        }
    }

    #[test]
    fn schema_list_uses_the_multi_database_flag() {
        let args = dump_args(
            &params(),
            &TargetDescriptor::Schemas(vec!["app".to_string(), "billing".to_string()]),
        );
        let tail: Vec<&str> = args.iter().map(String::as_str).rev().take(3).collect();
        assert_eq!(tail, vec!["billing", "app", "--databases"]);
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[test]
    fn single_database_is_a_bare_trailing_argument() {
        let args = dump_args(&params(), &TargetDescriptor::Single("app".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("app"));
        assert!(!args.contains(&"--databases".to_string()));
    }

    #[test]
    fn no_selection_dumps_everything() {
        let args = dump_args(&params(), &TargetDescriptor::All);
        assert_eq!(args.last().map(String::as_str), Some("--all-databases"));
    }

    #[tokio::test]
    async fn streams_output_and_resolves_on_exit_zero() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(8);
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk[..]);
            }
            out
        });

        let total = stream_dump(&sh("printf 'dump-payload'"), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(total, 12);
        assert_eq!(collector.await.unwrap(), b"dump-payload");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_the_code_and_stderr_tail() {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let err = stream_dump(
            &sh("printf 'partial output'; echo 'table vanished' >&2; exit 3"),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            AppError::ProcessExit {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, 3);
                assert!(stderr_tail.contains("table vanished"));
            }
            other => panic!("expected ProcessExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let spec = DumpSpec {
            program: PathBuf::from("/nonexistent/mysqldump"),
            args: Vec::new(),
            password: None,
        };
        let (tx, _rx) = mpsc::channel(1);
        let err = stream_dump(&spec, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process_without_an_error() {
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let total = stream_dump(&sh("sleep 30"), tx, cancel).await.unwrap();
        assert_eq!(total, 0);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
