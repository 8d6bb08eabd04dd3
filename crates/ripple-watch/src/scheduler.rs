use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use ripple_engine::EngineError;

type Completion = (u64, Box<dyn FnOnce() + Send>);

/// Runs read fetches on the blocking pool and delivers their results in the
/// order they were scheduled, regardless of which fetch finishes first.
///
/// Every call to [`schedule`](Self::schedule) takes the next ticket from a
/// shared counter. Fetches run concurrently; completed deliveries park in a
/// reorder buffer until every earlier ticket has been delivered.
#[derive(Clone)]
pub struct ReadScheduler {
    runtime: tokio::runtime::Handle,
    next_seq: Arc<AtomicU64>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl ReadScheduler {
    /// Must be called from within a tokio runtime; the scheduler spawns its
    /// delivery task on the current runtime and dispatches blocking fetches
    /// to it from any thread.
    pub fn new() -> Self {
        let runtime = tokio::runtime::Handle::current();
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(delivery_loop(rx));
        Self {
            runtime,
            next_seq: Arc::new(AtomicU64::new(0)),
            completions: tx,
        }
    }

    /// Take a ticket, run `fetch` on the blocking pool, and hand the result
    /// to `deliver` once every earlier ticket has been delivered.
    ///
    /// The ticket is assigned synchronously, so two calls made in sequence
    /// from the same thread deliver in that sequence.
    pub fn schedule<T, F, D>(&self, fetch: F, deliver: D)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EngineError> + Send + 'static,
        D: FnOnce(Result<T, EngineError>) + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let completions = self.completions.clone();
        self.runtime.spawn_blocking(move || {
            let result = fetch();
            let completion: Box<dyn FnOnce() + Send> = Box::new(move || deliver(result));
            // Receiver only drops when the runtime shuts down.
            let _ = completions.send((seq, completion));
        });
    }

    /// Schedule a fetch and await its result.
    pub fn read<T, F>(&self, fetch: F) -> ReadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule(fetch, move |result| {
            let _ = tx.send(result);
        });
        ReadHandle { rx }
    }
}

/// Pending result of a [`ReadScheduler::read`] call.
pub struct ReadHandle<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Future for ReadHandle<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn delivery_loop(mut rx: mpsc::UnboundedReceiver<Completion>) {
    let mut next_expected: u64 = 0;
    let mut parked: BTreeMap<u64, Box<dyn FnOnce() + Send>> = BTreeMap::new();
    while let Some((seq, completion)) = rx.recv().await {
        parked.insert(seq, completion);
        while let Some(completion) = parked.remove(&next_expected) {
            trace!(seq = next_expected, "delivering read result");
            completion();
            next_expected += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Barrier;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivers_in_schedule_order_when_fetches_finish_reversed() {
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        // Both fetches start before either finishes; the first to be
        // scheduled finishes last.
        let barrier = Arc::new(Barrier::new(2));

        let b = barrier.clone();
        let t = tx.clone();
        scheduler.schedule(
            move || {
                b.wait();
                std::thread::sleep(Duration::from_millis(50));
                Ok(1u32)
            },
            move |result| {
                t.send(result.unwrap()).unwrap();
            },
        );
        let b = barrier.clone();
        let t = tx.clone();
        scheduler.schedule(
            move || {
                b.wait();
                Ok(2u32)
            },
            move |result| {
                t.send(result.unwrap()).unwrap();
            },
        );

        let first = tokio::task::spawn_blocking(move || {
            (
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            )
        })
        .await
        .unwrap();
        assert_eq!(first, (1, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_results_hold_their_position() {
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();

        let t = tx.clone();
        scheduler.schedule(
            move || -> Result<u32, EngineError> {
                std::thread::sleep(Duration::from_millis(30));
                Err(EngineError::Cancelled)
            },
            move |result| {
                t.send(result.is_err()).unwrap();
            },
        );
        let t = tx.clone();
        scheduler.schedule(
            move || Ok(7u32),
            move |result| {
                t.send(result.is_err()).unwrap();
            },
        );

        let observed = tokio::task::spawn_blocking(move || {
            (
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            )
        })
        .await
        .unwrap();
        assert_eq!(observed, (true, false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_resolves_with_fetch_result() {
        let scheduler = ReadScheduler::new();
        let value = scheduler.read(|| Ok(41u32 + 1)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_reads_deliver_monotonically() {
        let scheduler = ReadScheduler::new();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..64u64 {
            let t = tx.clone();
            scheduler.schedule(
                move || {
                    if i % 3 == 0 {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(i)
                },
                move |result| {
                    t.send(result.unwrap()).unwrap();
                },
            );
        }
        let delivered = tokio::task::spawn_blocking(move || {
            (0..64)
                .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
        assert_eq!(delivered, (0..64).collect::<Vec<_>>());
    }
}
