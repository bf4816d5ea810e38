// dbshuttle/src/progress/mod.rs
//
// Byte-progress reporting for pipeline runs. Stages push raw counts into a
// cloneable handle; an aggregator task throttles them and forwards
// `ProgressSample`s over a bounded channel the consumer drains at its own
// pace. Samples for 0% and 100% are never coalesced away, and the 100%
// sample is guaranteed to be in the consumer channel before `complete`
// returns.
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// A point-in-time measurement of bytes processed by the active stage.
///
/// `loaded_bytes` is monotonically non-decreasing within one run. When the
/// total is not yet known (a dump of undetermined size), `total_bytes` and
/// `percentage` are `None` and the consumer decides how to render an
/// open-ended count.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub loaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percentage: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

enum Raw {
    Sample {
        loaded: u64,
        total: Option<u64>,
    },
    Complete {
        total: u64,
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable reporting handle held by whichever stage currently has byte
/// visibility. Sends are best-effort: a dropped consumer never fails a run.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<Raw>,
}

impl ProgressHandle {
    pub async fn report(&self, loaded: u64, total: Option<u64>) {
        let _ = self.tx.send(Raw::Sample { loaded, total }).await;
    }

    /// Marks the run complete. Resolves only after the 100% sample has been
    /// handed to the consumer channel.
    pub async fn complete(&self, total: u64) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Raw::Complete {
                total,
                ack: ack_tx,
            })
            .await;
        let _ = ack_rx.await;
    }

    /// A handle whose samples go nowhere. Used by callers that do not
    /// observe progress.
    #[allow(dead_code)]
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::channel(1);
        ProgressHandle { tx }
    }
}

pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Creates the reporting handle and the throttled consumer stream.
    ///
    /// Emission is capped at one sample per `interval`, trailing-edge: when
    /// several samples land inside one interval, the latest one is the one
    /// delivered.
    pub fn channel(interval: Duration) -> (ProgressHandle, mpsc::Receiver<ProgressSample>) {
        let (raw_tx, raw_rx) = mpsc::channel::<Raw>(64);
        let (out_tx, out_rx) = mpsc::channel::<ProgressSample>(64);
        tokio::spawn(aggregate(raw_rx, out_tx, interval));
        (ProgressHandle { tx: raw_tx }, out_rx)
    }
}

fn sample_for(loaded: u64, total: Option<u64>) -> ProgressSample {
    let percentage = total.map(|t| {
        if t == 0 {
            100.0
        } else {
            ((loaded as f64 / t as f64) * 100.0).min(100.0)
        }
    });
    ProgressSample {
        loaded_bytes: loaded,
        total_bytes: total,
        percentage,
        timestamp: Utc::now(),
    }
}

async fn aggregate(
    mut raw_rx: mpsc::Receiver<Raw>,
    out_tx: mpsc::Sender<ProgressSample>,
    interval: Duration,
) {
    let mut highest: u64 = 0;
    let mut pending: Option<(u64, Option<u64>)> = None;
    let mut last_emit: Option<Instant> = None;
    let mut sent_zero = false;
    let mut sent_complete = false;

    loop {
        let deadline = last_emit.map_or_else(Instant::now, |t| t + interval);
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                None => {
                    if let Some((loaded, total)) = pending.take() {
                        let _ = out_tx.send(sample_for(loaded, total)).await;
                    }
                    break;
                }
                Some(Raw::Sample { loaded, total }) => {
                    if sent_complete {
                        continue;
                    }
                    highest = highest.max(loaded);
                    let loaded = highest;
                    let is_zero = loaded == 0 && !sent_zero;
                    let is_full = total.is_some_and(|t| loaded >= t);
                    let due = last_emit.is_none_or(|t| t.elapsed() >= interval);
                    if is_zero || is_full || due {
                        let _ = out_tx.send(sample_for(loaded, total)).await;
                        last_emit = Some(Instant::now());
                        sent_zero = sent_zero || loaded == 0;
                        sent_complete = is_full;
                        pending = None;
                    } else {
                        pending = Some((loaded, total));
                    }
                }
                Some(Raw::Complete { total, ack }) => {
                    pending = None;
                    highest = highest.max(total);
                    if !sent_complete {
                        let _ = out_tx.send(sample_for(highest, Some(total.max(highest)))).await;
                        sent_complete = true;
                    }
                    let _ = ack.send(());
                }
            },
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                if let Some((loaded, total)) = pending.take() {
                    let _ = out_tx.send(sample_for(loaded, total)).await;
                    last_emit = Some(Instant::now());
                    sent_zero = sent_zero || loaded == 0;
                    sent_complete = total.is_some_and(|t| loaded >= t);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<ProgressSample>) -> Vec<ProgressSample> {
        let mut out = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            out.push(sample);
        }
        out
    }

    #[tokio::test]
    async fn samples_inside_one_interval_collapse_to_the_later_one() {
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_millis(250));
        handle.report(0, Some(100)).await;
        handle.report(10, Some(100)).await;
        handle.report(20, Some(100)).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.complete(100).await;

        let loaded: Vec<u64> = drain(&mut rx).await.iter().map(|s| s.loaded_bytes).collect();
        assert_eq!(loaded, vec![0, 20, 100]);
    }

    #[tokio::test]
    async fn zero_and_complete_are_always_delivered() {
        // Interval far larger than the test: only the guaranteed samples
        // survive.
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_secs(60));
        handle.report(0, Some(100)).await;
        handle.report(50, Some(100)).await;
        handle.complete(100).await;

        let samples = drain(&mut rx).await;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].loaded_bytes, 0);
        assert_eq!(samples[1].loaded_bytes, 100);
        assert_eq!(samples[1].percentage, Some(100.0));
    }

    #[tokio::test]
    async fn complete_sample_is_in_channel_before_complete_returns() {
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_secs(60));
        handle.complete(5).await;
        let sample = rx.try_recv().expect("100% sample must already be queued");
        assert_eq!(sample.percentage, Some(100.0));
        assert_eq!(sample.loaded_bytes, 5);
    }

    #[tokio::test]
    async fn loaded_bytes_never_decreases() {
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_millis(10));
        handle.report(0, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.report(30, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.report(20, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(handle);

        let samples = drain(&mut rx).await;
        assert!(!samples.is_empty());
        let mut prev = 0;
        for s in samples {
            assert!(s.loaded_bytes >= prev);
            prev = s.loaded_bytes;
        }
        assert_eq!(prev, 30);
    }

    #[tokio::test]
    async fn unknown_total_forwards_open_ended_counts() {
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_millis(1));
        handle.report(0, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.report(4096, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);

        let samples = drain(&mut rx).await;
        assert!(samples.iter().all(|s| s.total_bytes.is_none()));
        assert!(samples.iter().all(|s| s.percentage.is_none()));
        assert_eq!(samples.last().map(|s| s.loaded_bytes), Some(4096));
    }

    #[tokio::test]
    async fn duplicate_completion_reports_emit_once() {
        let (handle, mut rx) = ProgressAggregator::channel(Duration::from_millis(1));
        handle.report(0, Some(10)).await;
        handle.report(10, Some(10)).await;
        handle.complete(10).await;

        let full: Vec<ProgressSample> = drain(&mut rx)
            .await
            .into_iter()
            .filter(|s| s.percentage == Some(100.0))
            .collect();
        assert_eq!(full.len(), 1);
    }
}
