use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use argh::FromArgs;
use blocking_queue::{BoundedBlockingQueue, Interrupted, Interrupter, interrupt};

type Queue = BoundedBlockingQueue<Msg>;

const STOP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, FromArgs)]
/// Producers and consumers sharing one bounded blocking queue
#[argh(help_triggers("--help"))]
struct Args {
    /// maximum number of queued items
    #[argh(option, default = "16", arg_name = "int")]
    capacity: usize,
    /// number of producer threads
    #[argh(option, default = "4", arg_name = "int")]
    producers: usize,
    /// number of consumer threads
    #[argh(option, default = "4", arg_name = "int")]
    consumers: usize,
    /// items put by each producer
    #[argh(option, default = "10_000", arg_name = "int")]
    items: usize,
    /// upper bound of the random pause between two puts, in microseconds
    #[argh(option, default = "0", arg_name = "int")]
    jitter_us: u64,
    /// interrupt all workers after this many milliseconds
    #[argh(option, arg_name = "int")]
    interrupt_after_ms: Option<u64>,
}

#[derive(Debug)]
enum Msg {
    Item { producer: usize, seq: usize },
    Stop,
}

#[derive(Debug, Default)]
struct Consumed {
    taken: usize,
    out_of_order: usize,
    interrupted: bool,
}

pub fn main() -> Result<()> {
    let args = argh::from_env::<Args>();
    tracing_subscriber::fmt()
        .with_thread_names(true)
        .without_time()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if args.producers == 0 || args.consumers == 0 {
        bail!("at least one producer and one consumer are required");
    }
    let queue = Queue::new(args.capacity).context("invalid --capacity")?;

    let now = Instant::now();
    let (produced, consumed) = run(&args, &queue)?;
    let elapsed = now.elapsed();

    let taken = consumed.iter().map(|c| c.taken).sum::<usize>();
    let out_of_order = consumed.iter().map(|c| c.out_of_order).sum::<usize>();
    let interrupted = consumed.iter().filter(|c| c.interrupted).count();
    let rate = taken as f64 / elapsed.as_secs_f64();
    tracing::info!(
        "finished, produced={produced}, consumed={taken}, left={}, interrupted_consumers={interrupted}, elapsed={}ms, rate={rate:.0}/s",
        queue.size(),
        elapsed.as_millis(),
    );

    if out_of_order > 0 {
        bail!("{out_of_order} items were consumed out of order");
    }
    // `Stop` messages that were never taken are still queued.
    let left = std::iter::from_fn(|| queue.poll())
        .filter(|m| matches!(m, Msg::Item { .. }))
        .count();
    if produced != taken + left {
        bail!("produced {produced} items but accounted for {}", taken + left);
    }
    Ok(())
}

fn run(args: &Args, queue: &Queue) -> Result<(usize, Vec<Consumed>)> {
    let (producer_tx, producer_rx) = mpsc::channel::<Interrupter>();
    let (consumer_tx, consumer_rx) = mpsc::channel::<Interrupter>();
    thread::scope(|cx| -> Result<_> {
        let producers = (0..args.producers)
            .map(|p| {
                let tx = producer_tx.clone();
                thread::Builder::new()
                    .name(format!("producer-{p}"))
                    .spawn_scoped(cx, move || produce(queue, p, args, tx))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let consumers = (0..args.consumers)
            .map(|c| {
                let tx = consumer_tx.clone();
                thread::Builder::new()
                    .name(format!("consumer-{c}"))
                    .spawn_scoped(cx, move || consume(queue, args.producers, tx))
            })
            .collect::<Result<Vec<_>, _>>()?;
        drop((producer_tx, consumer_tx));
        // Every worker sends its interrupter first thing.
        let producer_interrupters = producer_rx.iter().collect::<Vec<_>>();
        let consumer_interrupters = consumer_rx.iter().collect::<Vec<_>>();

        if let Some(ms) = args.interrupt_after_ms {
            thread::sleep(Duration::from_millis(ms));
            let workers = producer_interrupters.iter().chain(&consumer_interrupters);
            tracing::warn!("interrupting {} workers", args.producers + args.consumers);
            for i in workers {
                i.interrupt();
            }
        }

        let mut produced = 0;
        for h in producers {
            produced += h.join().map_err(|_| anyhow!("producer panicked"))?;
        }
        for _ in 0..args.consumers {
            if let Err(e) = queue.offer_timeout(Msg::Stop, STOP_TIMEOUT) {
                // Consumers that never get a `Stop` would block forever.
                tracing::warn!("failed to stop a consumer: {e}, interrupting the rest");
                for i in consumer_interrupters.iter() {
                    i.interrupt();
                }
                break;
            }
        }
        let consumed = consumers
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("consumer panicked")))
            .collect::<Result<Vec<_>>>()?;
        Ok((produced, consumed))
    })
}

fn produce(queue: &Queue, producer: usize, args: &Args, tx: mpsc::Sender<Interrupter>) -> usize {
    _ = tx.send(interrupt::current());
    drop(tx);

    let mut sent = 0;
    for seq in 0..args.items {
        if args.jitter_us > 0 {
            thread::sleep(Duration::from_micros(fastrand::u64(0..=args.jitter_us)));
        }
        match queue.put(Msg::Item { producer, seq }) {
            Ok(()) => sent += 1,
            Err(Interrupted) => {
                tracing::info!("interrupted, sent={sent}");
                break;
            },
        }
    }
    tracing::debug!("exited producer, sent={sent}");
    sent
}

fn consume(queue: &Queue, producers: usize, tx: mpsc::Sender<Interrupter>) -> Consumed {
    _ = tx.send(interrupt::current());
    drop(tx);

    // Items of one producer reach one consumer in the order they were put.
    let mut last = vec![None; producers];
    let mut consumed = Consumed::default();
    loop {
        match queue.take() {
            Ok(Msg::Item { producer, seq }) => {
                if last[producer].is_some_and(|l| l >= seq) {
                    tracing::error!("out of order item, producer={producer}, seq={seq}");
                    consumed.out_of_order += 1;
                }
                last[producer] = Some(seq);
                consumed.taken += 1;
            },
            Ok(Msg::Stop) => break,
            Err(Interrupted) => {
                tracing::info!("interrupted, taken={}", consumed.taken);
                consumed.interrupted = true;
                break;
            },
        }
    }
    tracing::debug!("exited consumer, taken={}", consumed.taken);
    consumed
}
