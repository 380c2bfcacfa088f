use crate::errors::{Error, Result};
use crate::metrics::{BATCH_SIZE, DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, SAMPLES_DROPPED_TOTAL};
use crate::model::TelemetrySample;
use crate::repository::SampleRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;

/// Producer side of the sample pipeline.
#[derive(Clone)]
pub struct SampleWriter {
    tx: mpsc::Sender<TelemetrySample>,
}

pub fn sample_channel(capacity: usize) -> (SampleWriter, mpsc::Receiver<TelemetrySample>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SampleWriter { tx }, rx)
}

impl SampleWriter {
    /// Queues a sample without waiting. When the batcher is behind the
    /// sample is dropped and counted; callers carry on with the message.
    pub fn queue(&self, sample: TelemetrySample) -> Result<()> {
        match self.tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(sample)) => {
                SAMPLES_DROPPED_TOTAL.inc();
                warn!(device_id = %sample.device_id, "Sample channel full, dropping sample");
                Err(Error::ChannelFull)
            }
            Err(TrySendError::Closed(_)) => {
                error!("Sample channel closed, cannot queue sample");
                Err(Error::ChannelSend)
            }
        }
    }
}

pub async fn run_batcher(
    mut rx: mpsc::Receiver<TelemetrySample>,
    samples: Arc<dyn SampleRepository>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<TelemetrySample> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= max_batch {
                            flush_batch(samples.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(samples.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(samples.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(samples: &dyn SampleRepository, buffer: &mut Vec<TelemetrySample>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} samples", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match samples.insert_samples(buffer).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!(
                        "Batch inserted after {} attempts in {:.3}s",
                        attempt, elapsed
                    );
                } else {
                    debug!("Batch inserted in {:.3}s", elapsed);
                }
                buffer.clear();
                BATCH_SIZE.set(0.0);
                return;
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to insert batch after {} attempts, dropping {} samples: {}",
                        MAX_RETRIES, batch_len, e
                    );
                    buffer.clear();
                    BATCH_SIZE.set(0.0);
                    return;
                }

                // 100ms, 200ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to insert batch (attempt {}/{}): {}. Retrying in {}ms",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SampleKind;
    use crate::repository::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn sample(device_id: &str) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.to_string(),
            farm_id: "f1".into(),
            coord_id: "c1".into(),
            kind: SampleKind::LeafEnvironment,
            timestamp: Utc::now(),
            payload: json!({"air_temp_c": 24.0}),
        }
    }

    #[tokio::test]
    async fn test_flushes_remaining_on_close() {
        let store = Arc::new(MemoryStore::new());
        let (writer, rx) = sample_channel(16);
        let handle = tokio::spawn(run_batcher(rx, store.clone(), 100, 10_000));

        for i in 0..5 {
            writer.queue(sample(&format!("t{}", i))).unwrap();
        }
        drop(writer);
        handle.await.unwrap();

        assert_eq!(store.samples().await.len(), 5);
    }

    #[tokio::test]
    async fn test_flushes_on_timer() {
        let store = Arc::new(MemoryStore::new());
        let (writer, rx) = sample_channel(16);
        tokio::spawn(run_batcher(rx, store.clone(), 100, 20));

        writer.queue(sample("t1")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.samples().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_drops_batch() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_samples(true);
        let mut buffer = vec![sample("t1"), sample("t2")];

        flush_batch(store.as_ref(), &mut buffer).await;

        assert!(buffer.is_empty());
        assert!(store.samples().await.is_empty());
    }

    #[test]
    fn test_queue_fails_when_batcher_gone() {
        let (writer, rx) = sample_channel(1);
        drop(rx);
        assert!(matches!(writer.queue(sample("t1")), Err(Error::ChannelSend)));
    }

    #[test]
    fn test_full_channel_drops_without_waiting() {
        tokio_test::block_on(async {
            let (writer, mut rx) = sample_channel(1);
            writer.queue(sample("t1")).unwrap();
            assert!(matches!(writer.queue(sample("t2")), Err(Error::ChannelFull)));

            assert_eq!(rx.recv().await.unwrap().device_id, "t1");
            writer.queue(sample("t3")).unwrap();
            assert_eq!(rx.recv().await.unwrap().device_id, "t3");
        });
    }
}
