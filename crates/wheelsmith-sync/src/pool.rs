//! A bounded worker pool over an argument iterator.
//!
//! At most `concurrency` jobs are in flight; every completion hands its
//! result to the consumer and submits the next job, so the consumer sees
//! results in FIFO submission order while the pool stays saturated.

use futures::StreamExt;
use futures::stream::FuturesOrdered;

pub struct WorkerPool<I, F>
where
    F: Future,
{
    jobs: I,
    in_flight: FuturesOrdered<F>,
}

impl<I, F> WorkerPool<I, F>
where
    I: Iterator<Item = F>,
    F: Future,
{
    pub fn new(concurrency: usize, mut jobs: I) -> Self {
        let mut in_flight = FuturesOrdered::new();
        for job in jobs.by_ref().take(concurrency.max(1)) {
            in_flight.push_back(job);
        }
        Self { jobs, in_flight }
    }

    /// The next completed result, in submission order.
    pub async fn next(&mut self) -> Option<F::Output> {
        let output = self.in_flight.next().await?;
        if let Some(job) = self.jobs.next() {
            self.in_flight.push_back(job);
        }
        Some(output)
    }
}
