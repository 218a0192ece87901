use std::future::Future;
use std::time::Duration;

use common_kafka::{OffsetCommitter, PollOutcome, RecordSource};
use health::HealthHandle;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assembler::{Batch, BatchAssembler};
use crate::error::ConsumerError;
use crate::metrics_consts::{BATCHES_ABANDONED, POLL_EVENTS};
use crate::processor::{BatchProcessor, BatchReport, RecordHandler, SimulatedWorkHandler};

/// Single-task poll / assemble / process / commit loop. Batches are processed
/// one at a time, so offsets are committed in processing order.
pub struct BatchConsumer<S, H = SimulatedWorkHandler> {
    source: S,
    assembler: BatchAssembler,
    processor: BatchProcessor<H>,
    poll_interval: Duration,
    liveness: HealthHandle,
    /// Size of the batch being processed, left set if processing is cancelled
    in_flight: usize,
}

impl<S, H> BatchConsumer<S, H>
where
    S: RecordSource + OffsetCommitter,
    H: RecordHandler,
{
    pub fn new(
        source: S,
        assembler: BatchAssembler,
        processor: BatchProcessor<H>,
        poll_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            assembler,
            processor,
            poll_interval,
            liveness,
            in_flight: 0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Records polled but not yet part of a processed batch, including a batch
    /// whose processing was interrupted.
    pub fn pending(&self) -> usize {
        self.assembler.pending() + self.in_flight
    }

    /// One bounded poll, then process whatever batch it sealed.
    pub async fn cycle(&mut self) -> Result<Option<BatchReport>, ConsumerError> {
        let timeout = self.assembler.poll_timeout(Instant::now(), self.poll_interval);

        let sealed = match self.source.poll(timeout).await {
            Ok(PollOutcome::Record(record)) => {
                counter!(POLL_EVENTS, "outcome" => "record").increment(1);
                self.assembler.push(record, Instant::now())
            }
            Ok(PollOutcome::EndOfPartition { partition }) => {
                counter!(POLL_EVENTS, "outcome" => "end_of_partition").increment(1);
                debug!("reached end of partition {:?}", partition);
                None
            }
            Ok(PollOutcome::Empty) => {
                counter!(POLL_EVENTS, "outcome" => "empty").increment(1);
                None
            }
            Err(e) if e.is_retryable() => {
                counter!(POLL_EVENTS, "outcome" => "retryable_error").increment(1);
                warn!("transient consumer error, polling again: {}", e);
                None
            }
            Err(e) => {
                counter!(POLL_EVENTS, "outcome" => "fatal_error").increment(1);
                return Err(e.into());
            }
        };

        let sealed: Option<Batch> =
            sealed.or_else(|| self.assembler.seal_if_expired(Instant::now()));

        let report = match sealed {
            Some(batch) => {
                self.in_flight = batch.len();
                let report = self.processor.process(batch, &self.source).await;
                self.in_flight = 0;
                Some(report?)
            }
            None => None,
        };

        self.liveness.report_healthy();
        Ok(report)
    }

    /// Run until `shutdown` resolves or a fatal error occurs. An open batch is
    /// dropped uncommitted on exit: its records are redelivered to the group.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping consumer loop");
                    break Ok(());
                }
                cycle = self.cycle() => {
                    if let Err(e) = cycle {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = &result {
            self.liveness.report_unhealthy(e.to_string());
        }

        let interrupted = std::mem::take(&mut self.in_flight);
        if interrupted > 0 {
            counter!(BATCHES_ABANDONED).increment(1);
            warn!(
                "batch of {} records interrupted during processing, offsets not committed",
                interrupted
            );
        }

        let abandoned = self.assembler.abandon();
        if abandoned > 0 {
            counter!(BATCHES_ABANDONED).increment(1);
            info!("dropping open batch of {} uncommitted records", abandoned);
        }
        self.source.close().await;

        info!(
            "consumer stopped after processing {} records",
            self.processor.total_processed()
        );
        result
    }
}
