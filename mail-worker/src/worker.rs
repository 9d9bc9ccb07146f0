//! Consumer loop for a single email queue.
//!
//! Each registry queue gets its own loop. Deliveries are handed to the
//! `Dispatcher` on spawned tasks, at most `prefetch` at a time; with a
//! prefetch of 1 a queue is processed strictly one message after another.
//! On shutdown the loop stops taking deliveries and waits for the in-flight
//! ones to be settled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::dispatch::{Acknowledger, Dispatcher, Disposition};
use crate::queue::EmailQueue;

/// A delivery as seen by the consumer loop.
pub struct Inbound<A> {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub acker: A,
}

impl From<Delivery> for Inbound<Acker> {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            data: delivery.data,
            acker: delivery.acker,
        }
    }
}

/// Why a consumer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Shutdown was requested
    Shutdown,
    /// The broker closed the delivery stream
    StreamClosed,
}

/// Summary of a finished consumer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub queue: EmailQueue,
    pub exit: ConsumerExit,
    pub sent: usize,
    pub discarded: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicUsize,
    discarded: AtomicUsize,
    rejected: AtomicUsize,
}

impl Counters {
    fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Sent => &self.sent,
            Disposition::Discarded { .. } => &self.discarded,
            Disposition::Rejected(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consume `deliveries` until shutdown or until the stream ends.
pub async fn consume_queue<S, A>(
    queue: EmailQueue,
    mut deliveries: S,
    dispatcher: Arc<Dispatcher>,
    prefetch: u16,
    mut shutdown: watch::Receiver<bool>,
) -> ConsumerReport
where
    S: Stream<Item = Result<Inbound<A>, lapin::Error>> + Unpin,
    A: Acknowledger + 'static,
{
    let permits = u32::from(prefetch.max(1));
    let in_flight = Arc::new(Semaphore::new(permits as usize));
    let counters = Arc::new(Counters::default());

    info!(queue = queue.name(), prefetch = permits, "consumer_loop_started");

    let exit = loop {
        if *shutdown.borrow() {
            break ConsumerExit::Shutdown;
        }

        // A dropped shutdown sender can never signal again; treat it as shutdown.
        let permit = tokio::select! {
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break ConsumerExit::Shutdown,
            },
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break ConsumerExit::Shutdown,
            },
        };

        let delivery = tokio::select! {
            changed = shutdown.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break ConsumerExit::Shutdown,
            },
            delivery = deliveries.next() => delivery,
        };

        match delivery {
            Some(Ok(inbound)) => {
                info!(
                    queue = queue.name(),
                    delivery_tag = inbound.delivery_tag,
                    body_length = inbound.data.len(),
                    "rabbitmq_email_received"
                );

                let dispatcher = Arc::clone(&dispatcher);
                let counters = Arc::clone(&counters);

                tokio::spawn(async move {
                    let disposition = dispatcher
                        .handle(queue, &inbound.data, &inbound.acker)
                        .await;
                    counters.record(&disposition);
                    drop(permit);
                });
            }
            Some(Err(e)) => {
                error!(queue = queue.name(), error = %e, "rabbitmq_delivery_error");
            }
            // A cancelled consumer also ends its stream.
            None if *shutdown.borrow() => break ConsumerExit::Shutdown,
            None => {
                warn!(queue = queue.name(), "rabbitmq_consumer_closed");
                break ConsumerExit::StreamClosed;
            }
        }
    };

    // Every permit back means every spawned delivery has been settled.
    if let Ok(all) = in_flight.acquire_many(permits).await {
        drop(all);
    }

    let report = ConsumerReport {
        queue,
        exit,
        sent: counters.sent.load(Ordering::Relaxed),
        discarded: counters.discarded.load(Ordering::Relaxed),
        rejected: counters.rejected.load(Ordering::Relaxed),
    };

    info!(
        queue = queue.name(),
        exit = ?report.exit,
        sent = report.sent,
        discarded = report.discarded,
        rejected = report.rejected,
        "consumer_loop_stopped"
    );

    report
}
