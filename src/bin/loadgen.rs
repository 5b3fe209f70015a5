//! Load generator for tenantgate
//!
//! Hits `/api/health` on many random tenants through the proxy to exercise
//! cold starts and the hot path at the same time.
//!
//! Usage: loadgen [--max N] [--concurrent C] [--domain D] [--proxy ADDR] [--duration SECS]

use anyhow::{bail, Context, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TENANT_LENGTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
struct Options {
    max_tenants: usize,
    concurrency: usize,
    domain: String,
    proxy: SocketAddr,
    duration: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_tenants: 500,
            concurrency: 50,
            domain: "lvh.me".to_string(),
            proxy: SocketAddr::from(([127, 0, 0, 1], 8080)),
            duration: None,
        }
    }
}

#[derive(Debug, Default)]
struct Summary {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    transport_errors: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl Summary {
    fn record(&self, status: Option<u16>, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
        match status {
            Some(code) if (200..300).contains(&code) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn print(&self, elapsed: Duration) {
        let sent = self.sent.load(Ordering::Relaxed);
        let avg_ms = if sent > 0 {
            self.total_latency_us.load(Ordering::Relaxed) as f64 / sent as f64 / 1000.0
        } else {
            0.0
        };

        println!();
        println!("Requests:         {}", sent);
        println!("  2xx:            {}", self.succeeded.load(Ordering::Relaxed));
        println!("  other status:   {}", self.failed.load(Ordering::Relaxed));
        println!("  errors:         {}", self.transport_errors.load(Ordering::Relaxed));
        println!("Average latency:  {:.2}ms", avg_ms);
        println!(
            "Max latency:      {:.2}ms",
            self.max_latency_us.load(Ordering::Relaxed) as f64 / 1000.0
        );
        println!(
            "Throughput:       {:.1} req/s",
            sent as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let options = parse_options(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(generate_load(options))
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options::default();
    let mut iter = args.iter();

    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .with_context(|| format!("Missing value for {}", flag))
        };

        match flag.as_str() {
            "--max" => {
                options.max_tenants = value()?.parse().context("--max expects a number")?;
            }
            "--concurrent" => {
                options.concurrency = value()?
                    .parse()
                    .context("--concurrent expects a number")?;
            }
            "--domain" => {
                options.domain = value()?.trim_start_matches('.').to_string();
            }
            "--proxy" => {
                options.proxy = value()?
                    .parse()
                    .context("--proxy expects an address like 127.0.0.1:8080")?;
            }
            "--duration" => {
                let secs: u64 = value()?.parse().context("--duration expects seconds")?;
                options.duration = Some(Duration::from_secs(secs));
            }
            other => bail!("Unknown option: {}", other),
        }
    }

    if options.max_tenants == 0 {
        bail!("--max must be greater than 0");
    }
    if options.concurrency == 0 {
        bail!("--concurrent must be greater than 0");
    }

    Ok(options)
}

fn random_tenant<R: Rng>(rng: &mut R) -> String {
    (0..TENANT_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

async fn generate_load(options: Options) -> Result<()> {
    let tenants: Vec<String> = {
        let mut rng = rand::thread_rng();
        (0..options.max_tenants)
            .map(|_| random_tenant(&mut rng))
            .collect()
    };

    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let summary = Arc::new(Summary::default());
    let mut in_flight = JoinSet::new();

    println!(
        "Sending to {} with {} tenants under *.{}, {} concurrent (Ctrl+C to stop)",
        options.proxy, options.max_tenants, options.domain, options.concurrency
    );

    let started = Instant::now();
    let deadline = async {
        match options.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let permit = tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nShutting down gracefully...");
                break;
            }
            _ = &mut deadline => break,
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.context("Semaphore closed")?
            }
        };

        let host = {
            let mut rng = rand::thread_rng();
            let tenant = &tenants[rng.gen_range(0..tenants.len())];
            format!("{}.{}", tenant, options.domain)
        };
        let client = client.clone();
        let summary = Arc::clone(&summary);
        let proxy = options.proxy;

        in_flight.spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            let result = health_request(&client, proxy, &host).await;
            let latency = start.elapsed();

            match result {
                Ok(status) => {
                    println!("Host: {}, Status: {}, Duration: {:?}", host, status, latency);
                    summary.record(Some(status), latency);
                }
                Err(e) => {
                    println!("Host: {}, Error: {}, Duration: {:?}", host, e, latency);
                    summary.record(None, latency);
                }
            }
        });

        // Reap finished tasks so the set does not grow without bound
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}

    summary.print(started.elapsed());
    Ok(())
}

async fn health_request(
    client: &Client<HttpConnector, Empty<Bytes>>,
    proxy: SocketAddr,
    host: &str,
) -> Result<u16> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/api/health", proxy))
        .header(HOST, host)
        .body(Empty::new())?;

    let response = client.request(request).await?;
    let status = response.status().as_u16();
    // Drain so the connection goes back to the pool
    response.into_body().collect().await?;
    Ok(status)
}

fn print_help() {
    println!(
        r#"loadgen - Generate traffic against a tenantgate proxy

USAGE:
    loadgen [OPTIONS]

OPTIONS:
    --max <N>             Number of distinct tenants to hit (default: 500)
    --concurrent <C>      Requests kept in flight (default: 50)
    --domain <D>          Parent domain for tenant hosts (default: lvh.me)
    --proxy <ADDR>        Proxy address to connect to (default: 127.0.0.1:8080)
    --duration <SECS>     Stop after this many seconds (default: run until Ctrl+C)
    -h, --help            Print this help
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(parse_options(&[]).unwrap(), Options::default());
    }

    #[test]
    fn test_parse_all_options() {
        let options = parse_options(&args(&[
            "--max",
            "10",
            "--concurrent",
            "4",
            "--domain",
            ".example.com",
            "--proxy",
            "127.0.0.1:9000",
            "--duration",
            "30",
        ]))
        .unwrap();

        assert_eq!(options.max_tenants, 10);
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.domain, "example.com");
        assert_eq!(options.proxy.port(), 9000);
        assert_eq!(options.duration, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_options(&args(&["--max"])).is_err());
        assert!(parse_options(&args(&["--max", "zero"])).is_err());
        assert!(parse_options(&args(&["--concurrent", "0"])).is_err());
        assert!(parse_options(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_random_tenant_shape() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let tenant = random_tenant(&mut rng);
            assert_eq!(tenant.len(), TENANT_LENGTH);
            assert!(tenant
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = Summary::default();
        summary.record(Some(200), Duration::from_millis(5));
        summary.record(Some(503), Duration::from_millis(15));
        summary.record(None, Duration::from_millis(1));

        assert_eq!(summary.sent.load(Ordering::Relaxed), 3);
        assert_eq!(summary.succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(summary.failed.load(Ordering::Relaxed), 1);
        assert_eq!(summary.transport_errors.load(Ordering::Relaxed), 1);
        assert_eq!(summary.max_latency_us.load(Ordering::Relaxed), 15_000);
    }
}
