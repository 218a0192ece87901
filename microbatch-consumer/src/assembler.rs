use std::time::Duration;

use common_kafka::Record;
use tokio::time::Instant;

/// Records accumulated for one processing run, in poll order.
#[derive(Debug)]
pub struct Batch {
    records: Vec<Record>,
    started_at: Instant,
}

impl Batch {
    fn new(capacity: usize, started_at: Instant) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            started_at,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the first record of the batch was accepted.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Groups polled records into batches, sealing a batch when it is full or when
/// its first record is older than `batch_timeout`, whichever comes first.
///
/// The assembler is idle until a record arrives: the timeout clock starts with
/// the first record of a batch, never with an empty poll.
pub struct BatchAssembler {
    batch_size: usize,
    batch_timeout: Duration,
    open: Option<Batch>,
}

impl BatchAssembler {
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            open: None,
        }
    }

    /// Add a record, returning the sealed batch if it is now full.
    pub fn push(&mut self, record: Record, now: Instant) -> Option<Batch> {
        let batch = self
            .open
            .get_or_insert_with(|| Batch::new(self.batch_size, now));
        batch.records.push(record);

        if batch.len() >= self.batch_size {
            return self.open.take();
        }
        None
    }

    /// Seal the open batch if its timeout elapsed.
    pub fn seal_if_expired(&mut self, now: Instant) -> Option<Batch> {
        match &self.open {
            Some(batch) if !batch.is_empty() && batch.age(now) >= self.batch_timeout => {
                self.open.take()
            }
            _ => None,
        }
    }

    /// How long the next poll may block without starving the timeout check.
    pub fn poll_timeout(&self, now: Instant, poll_interval: Duration) -> Duration {
        match &self.open {
            Some(batch) => {
                let remaining = self.batch_timeout.saturating_sub(batch.age(now));
                remaining.min(poll_interval)
            }
            None => poll_interval,
        }
    }

    /// Number of records in the open batch.
    pub fn pending(&self) -> usize {
        self.open.as_ref().map_or(0, Batch::len)
    }

    /// Drop the open batch without processing it, returning how many records it held.
    pub fn abandon(&mut self) -> usize {
        self.open.take().map_or(0, |batch| batch.len())
    }
}
