//! Switchyard bench - Load generator for the dispatch reactor
//!
//! Spreads proxies over isolates, fires calls at them, and reports how long
//! the reactor took to drain them.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use switchyard::runtime::{
    Call, CallbackReference, Capability, CapabilityDescriptor, Completion, HandlerResult,
    MethodTable, Proxy, Result,
};
use switchyard::{Reactor, ReactorConfig};

#[derive(Parser)]
#[command(name = "switchyard-bench")]
#[command(about = "Drive the dispatch reactor with synthetic calls", long_about = None)]
struct Cli {
    /// JSON reactor configuration (defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of isolates
    #[arg(long, default_value = "4")]
    isolates: usize,

    /// Number of proxies, spread round-robin over the isolates
    #[arg(long, default_value = "64")]
    proxies: usize,

    /// Calls issued per proxy
    #[arg(long, default_value = "1000")]
    calls: usize,

    /// Simulated handler work per call, in microseconds
    #[arg(long, default_value = "0")]
    work_us: u64,

    /// Seconds to wait for all calls and for shutdown
    #[arg(long, default_value = "60")]
    timeout: u64,
}

struct Counter;

enum CounterCall {
    Add(u64),
}

impl Call for CounterCall {
    fn method(&self) -> &'static str {
        match self {
            CounterCall::Add(_) => "add",
        }
    }
}

impl Capability for Counter {
    type Call = CounterCall;
    type Output = u64;
    const DESCRIPTOR: CapabilityDescriptor = CapabilityDescriptor {
        name: "counter",
        methods: &["add"],
    };
}

fn counter_handler(total: Arc<AtomicU64>, work: Duration) -> MethodTable<Counter> {
    let mut local = 0u64;
    MethodTable::new().on("add", move |_proxy: &Proxy<Counter>, call| -> HandlerResult<u64> {
        let CounterCall::Add(n) = call;
        if !work.is_zero() {
            std::thread::sleep(work);
        }
        local += n;
        total.fetch_add(n, Ordering::Relaxed);
        Ok(local)
    })
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ReactorConfig::load(path)?,
        None => ReactorConfig::default(),
    };
    let timeout = Duration::from_secs(cli.timeout);
    let work = Duration::from_micros(cli.work_us);

    let reactor = Reactor::new(config)?;
    let isolates = (0..cli.isolates.max(1))
        .map(|_| reactor.create_isolate())
        .collect::<Result<Vec<_>>>()?;

    let total = Arc::new(AtomicU64::new(0));
    let mut proxies = Vec::with_capacity(cli.proxies);
    for i in 0..cli.proxies {
        let proxy = reactor.create_proxy::<Counter>()?;
        reactor.assign(&proxy, isolates[i % isolates.len()], counter_handler(total.clone(), work))?;
        proxies.push(proxy);
    }

    let started = Instant::now();
    let mut last: Vec<(CallbackReference, Completion)> = Vec::with_capacity(proxies.len());
    for proxy in &proxies {
        let mut reference = None;
        for _ in 0..cli.calls {
            reference = Some(proxy.invoke(CounterCall::Add(1))?);
        }
        // An unknown reference here already resolved and aged out of the registry.
        if let Some(reference) = reference {
            if let Ok(completion) = reactor.resolve(reference) {
                last.push((reference, completion));
            }
        }
    }

    // Per-proxy ordering means the last call resolving implies all earlier ones did.
    for (reference, completion) in last {
        if let Err(err) = completion.wait(Some(timeout)) {
            eprintln!("call {reference} did not complete: {err}");
        }
    }
    let elapsed = started.elapsed();

    let stats = reactor.stats();
    let executed = total.load(Ordering::Relaxed);
    println!(
        "Executed {} calls on {} proxies across {} isolates in {:?} ({:.0} calls/s)",
        executed,
        stats.proxies,
        stats.isolates,
        elapsed,
        executed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    if !reactor.destroy(Some(timeout)) {
        eprintln!("reactor did not shut down within {:?}", timeout);
    }
    Ok(())
}
