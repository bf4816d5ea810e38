// dbshuttle/src/pipeline/mod.rs
//
// Wires the dump/restore processes, the gzip stage and the byte sinks into
// one run: stage tasks connected by bounded channels, first-error-wins
// teardown, and a single progress owner per phase.
pub mod gzip;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, BackupConfig, RestoreConfig};
use crate::errors::{AppError, Result};
use crate::mysql::dump::DumpSpec;
use crate::mysql::restore::RestoreSpec;
use crate::mysql::{dump, lifecycle, restore};
use crate::progress::ProgressHandle;
use crate::s3::{self, SpacesClient};

/// In-flight chunks per inter-stage channel. Together with the 64 KiB read
/// size this bounds pipeline memory regardless of dump size.
const CHANNEL_DEPTH: usize = 8;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Bookkeeping for one pipeline execution. Owned by the invocation that
/// created it and dropped when the run resolves.
struct PipelineRun {
    direction: Direction,
    started_at: DateTime<Utc>,
    stages: Vec<(&'static str, StageState)>,
}

impl PipelineRun {
    fn new(direction: Direction, names: &[&'static str]) -> Self {
        PipelineRun {
            direction,
            started_at: Utc::now(),
            stages: names.iter().map(|n| (*n, StageState::Idle)).collect(),
        }
    }

    fn mark_running(&mut self, idx: usize) {
        self.stages[idx].1 = StageState::Running;
    }

    fn fail_unfinished(&mut self) {
        for (_, state) in &mut self.stages {
            if *state != StageState::Completed {
                *state = StageState::Failed;
            }
        }
    }

    fn summary(&self) -> String {
        let elapsed = (Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|(name, state)| format!("{}={:?}", name, state))
            .collect();
        format!("{:?} run in {:.1?}: {}", self.direction, elapsed, stages.join(", "))
    }
}

/// Awaits every stage, keeping the first failure and discarding any that
/// arrive once teardown has started. A failing stage cancels the shared
/// token, which kills child processes and unwinds the channel chain.
async fn drive(
    run: &mut PipelineRun,
    set: &mut JoinSet<(usize, Result<u64>)>,
    cancel: &CancellationToken,
) -> Result<Vec<u64>> {
    let mut outputs = vec![0u64; run.stages.len()];
    let mut first_error: Option<AppError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, Ok(bytes))) => {
                outputs[idx] = bytes;
                run.stages[idx].1 = if first_error.is_some() {
                    StageState::Failed
                } else {
                    StageState::Completed
                };
            }
            Ok((idx, Err(stage_error))) => {
                run.stages[idx].1 = StageState::Failed;
                if first_error.is_none() {
                    first_error = Some(stage_error);
                    cancel.cancel();
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(AppError::Io(std::io::Error::other(join_error)));
                    cancel.cancel();
                }
            }
        }
    }
    match first_error {
        Some(e) => {
            run.fail_unfinished();
            Err(e)
        }
        None => Ok(outputs),
    }
}

pub struct BackupOutcome {
    pub bytes_written: u64,
    pub location: String,
}

/// Runs a complete backup: dump process → gzip → temp file, then either an
/// object-store upload or an atomic move into the local backup directory.
/// The temp file is removed on every exit path.
pub async fn run_backup(
    app_config: &AppConfig,
    backup_config: &BackupConfig,
    progress: &ProgressHandle,
) -> Result<BackupOutcome> {
    let spec = DumpSpec::new(
        backup_config.mysqldump_path.as_deref(),
        &app_config.connection,
        &backup_config.target,
    )?;
    let file_name = s3::backup_key(&backup_config.target, Utc::now());
    println!(
        "🚀 Backing up '{}' as {}",
        backup_config.target.key_name(),
        file_name
    );

    std::fs::create_dir_all(&backup_config.local_backup_dir)?;
    let temp = NamedTempFile::new_in(&backup_config.local_backup_dir)?;

    // During the dump only the gzip stage sees byte counts, but an upload
    // phase restarts its own counter; progress stays with one owner so
    // loaded bytes never go backwards.
    let local_progress = if backup_config.upload_to_spaces {
        None
    } else {
        Some(progress.clone())
    };
    let bytes_written = run_backup_pipeline(&spec, &temp, local_progress).await?;

    match (&app_config.spaces_config, backup_config.upload_to_spaces) {
        (Some(spaces), true) => {
            let client = SpacesClient::connect(spaces).await;
            let key = client.object_key(&file_name);
            client.upload(temp.path(), &key, bytes_written, progress).await?;
            Ok(BackupOutcome {
                bytes_written,
                location: format!("s3://{}/{}", client.bucket(), key),
            })
        }
        _ => {
            let destination = backup_config.local_backup_dir.join(&file_name);
            temp.persist(&destination).map_err(|e| AppError::Io(e.error))?;
            println!("📂 Backup written to {}", destination.display());
            Ok(BackupOutcome {
                bytes_written,
                location: destination.display().to_string(),
            })
        }
    }
}

pub(crate) async fn run_backup_pipeline(
    spec: &DumpSpec,
    sink: &NamedTempFile,
    progress: Option<ProgressHandle>,
) -> Result<u64> {
    let mut run = PipelineRun::new(Direction::Backup, &["dump", "compress", "sink"]);
    let cancel = CancellationToken::new();
    let (dump_tx, dump_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (gz_tx, gz_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

    let mut sink_file = tokio::fs::File::from_std(sink.reopen()?);

    let mut set: JoinSet<(usize, Result<u64>)> = JoinSet::new();
    {
        let spec = spec.clone();
        let cancel = cancel.clone();
        run.mark_running(0);
        set.spawn(async move { (0, dump::stream_dump(&spec, dump_tx, cancel).await) });
    }
    {
        let progress = progress.clone();
        run.mark_running(1);
        set.spawn(async move { (1, gzip::compress(dump_rx, gz_tx, progress).await) });
    }
    {
        run.mark_running(2);
        set.spawn(async move {
            let result = async {
                let mut rx = gz_rx;
                let mut written = 0u64;
                while let Some(chunk) = rx.recv().await {
                    sink_file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                sink_file.flush().await?;
                Ok::<u64, AppError>(written)
            }
            .await;
            (2, result)
        });
    }

    let outputs = drive(&mut run, &mut set, &cancel).await?;
    if let Some(p) = &progress {
        p.complete(outputs[1]).await;
    }
    println!("✓ {}", run.summary());
    Ok(outputs[2])
}

/// Where the restore payload comes from.
pub(crate) enum RestoreSource {
    LocalFile(PathBuf),
    Spaces { client: SpacesClient, key: String },
}

/// Runs a complete restore: lifecycle gate, then source → gunzip → restore
/// process under the configured deadline.
pub async fn run_restore(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
    progress: &ProgressHandle,
) -> Result<()> {
    let pool = lifecycle::admin_pool(&app_config.connection).await?;
    let gate = lifecycle::ensure_database(
        &pool,
        &restore_config.target_database,
        restore_config.create_target_database_if_not_exists,
    )
    .await;
    pool.close().await;
    gate?;

    let spec = RestoreSpec::new(
        restore_config.mysql_path.as_deref(),
        &app_config.connection,
        &restore_config.target_database,
    )?;

    let source = if restore_config.download_from_spaces {
        let spaces = app_config.spaces_config.as_ref().ok_or_else(|| {
            AppError::Config("s3_storage must be configured for an S3 restore source".to_string())
        })?;
        let (bucket, key) = s3::parse_s3_uri(&restore_config.archive_source)?;
        let client = SpacesClient::connect(spaces).await.with_bucket(bucket);
        if !client.exists(&key).await? {
            return Err(AppError::Transfer(format!(
                "Backup s3://{}/{} does not exist",
                client.bucket(),
                key
            )));
        }
        RestoreSource::Spaces { client, key }
    } else {
        RestoreSource::LocalFile(PathBuf::from(&restore_config.archive_source))
    };

    run_restore_pipeline(&spec, source, restore_config.timeout, progress).await
}

pub(crate) async fn run_restore_pipeline(
    spec: &RestoreSpec,
    source: RestoreSource,
    deadline: Duration,
    progress: &ProgressHandle,
) -> Result<()> {
    let mut run = PipelineRun::new(Direction::Restore, &["source", "decompress", "restore"]);
    let cancel = CancellationToken::new();
    let (raw_tx, raw_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (sql_tx, sql_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

    let mut set: JoinSet<(usize, Result<u64>)> = JoinSet::new();
    {
        let progress = progress.clone();
        run.mark_running(0);
        set.spawn(async move {
            let result = match source {
                RestoreSource::LocalFile(path) => stream_local_file(&path, raw_tx, &progress).await,
                RestoreSource::Spaces { client, key } => {
                    client.download(&key, raw_tx, &progress).await
                }
            };
            (0, result)
        });
    }
    {
        run.mark_running(1);
        set.spawn(async move { (1, gzip::decompress(raw_rx, sql_tx).await) });
    }
    {
        let spec = spec.clone();
        let cancel = cancel.clone();
        run.mark_running(2);
        set.spawn(async move { (2, restore::stream_restore(&spec, sql_rx, cancel).await) });
    }

    match tokio::time::timeout(deadline, drive(&mut run, &mut set, &cancel)).await {
        Ok(result) => {
            result?;
            println!("✓ {}", run.summary());
            Ok(())
        }
        Err(_elapsed) => {
            // Kill everything first; the rejection only goes out once the
            // restore process has received its termination signal.
            cancel.cancel();
            while set.join_next().await.is_some() {}
            run.fail_unfinished();
            Err(AppError::Timeout(deadline))
        }
    }
}

/// Streams a local archive into the pipeline, reporting progress against
/// the file's known size.
async fn stream_local_file(
    path: &Path,
    tx: Sender<Bytes>,
    progress: &ProgressHandle,
) -> Result<u64> {
    let total = tokio::fs::metadata(path).await?.len();
    progress.report(0, Some(total)).await;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sent += n as u64;
        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            return Ok(sent);
        }
        progress.report(sent, Some(total)).await;
    }
    progress.complete(total.max(sent)).await;
    Ok(sent)
}
