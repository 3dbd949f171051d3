use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use udpq::config::parse_size_literal;
use udpq::interval_reporter::format_snapshot_line;
use udpq::{
    MeasurementMode, ProgressEvent, Reflector, Session, SessionConfig, SessionReport, UdpChannel,
};

#[derive(Parser)]
#[command(name = "udpq")]
#[command(about = "UDP network quality probe - loss, jitter and round-trip latency", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer probes from a remote `udpq probe`
    Reflect {
        /// Port to listen on
        #[arg(short, long, default_value = "5300")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        /// Bounce probes unchanged instead of answering with echo replies
        #[arg(long)]
        one_way: bool,
    },

    /// Probe a reflector and report link quality
    Probe {
        /// Reflector host
        host: String,

        /// Reflector port
        #[arg(short, long, default_value = "5300")]
        port: u16,

        /// Number of probes to send
        #[arg(short = 'n', long, conflicts_with = "time")]
        count: Option<u64>,

        /// Test duration in seconds
        #[arg(short = 't', long)]
        time: Option<u64>,

        /// Milliseconds between probes
        #[arg(short, long, default_value = "100", conflicts_with = "rate")]
        interval_ms: u64,

        /// Probes per second, instead of an interval
        #[arg(short, long)]
        rate: Option<f64>,

        /// Datagram size in bytes, header included
        #[arg(short = 'l', long, default_value = "64")]
        size: u32,

        /// Measure round-trip latency (reflector must answer with echo replies)
        #[arg(long)]
        round_trip: bool,

        /// Byte-rate cap, e.g. "512KB" or "1MiB" per second
        #[arg(long)]
        max_rate: Option<String>,

        /// Reorder window in sequence numbers
        #[arg(short, long, default_value = "128")]
        window: u64,

        /// Seconds between progress lines
        #[arg(long, default_value = "1")]
        report_every: u64,

        /// Output the final report as JSON
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Reflect {
            port,
            bind,
            one_way,
        } => {
            let addr: SocketAddr = format!("{}:{}", bind, port)
                .parse()
                .with_context(|| format!("invalid bind address {}", bind))?;
            let channel = UdpChannel::bind(addr).await?;
            info!("Reflector listening on {}", channel.local_addr()?);

            let mode = if one_way {
                MeasurementMode::OneWay
            } else {
                MeasurementMode::RoundTrip
            };
            let reflector = Reflector::new(Arc::new(channel)).with_mode(mode);

            let token = reflector.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let stats = reflector.run().await;
            info!(
                "Echoed {} probes ({} invalid, {} send failures)",
                stats.echoed, stats.decode_errors, stats.send_failures
            );
        }

        Commands::Probe {
            host,
            port,
            count,
            time,
            interval_ms,
            rate,
            size,
            round_trip,
            max_rate,
            window,
            report_every,
            json,
        } => {
            let peer = (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("cannot resolve {}", host))?
                .next()
                .with_context(|| format!("no address for {}", host))?;

            let mut config = SessionConfig::new()
                .with_interval(Duration::from_millis(interval_ms))
                .with_packet_size(size)
                .with_window_size(window)
                .with_snapshot_interval(Duration::from_secs(report_every.max(1)));

            if let Some(rate) = rate {
                config = config.with_rate(rate);
            }
            config = match (count, time) {
                (Some(count), _) => config.with_count(count),
                (None, Some(secs)) => config.with_duration(Duration::from_secs(secs)),
                (None, None) => config.with_count(10),
            };
            if round_trip {
                config = config.with_mode(MeasurementMode::RoundTrip);
            }
            if let Some(literal) = max_rate {
                config = config.with_max_bytes_per_sec(parse_size_literal(&literal)?);
            }

            let channel = UdpChannel::connect(peer).await?;
            info!("Probing {} from {}", peer, channel.local_addr()?);

            let progress = move |event: ProgressEvent| {
                if json {
                    return;
                }
                if let ProgressEvent::Snapshot(snapshot) = event {
                    println!("{}", format_snapshot_line(&snapshot));
                }
            };
            let session = Session::new(config, channel)?.with_callback(progress);

            let token = session.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let report = session.run().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn print_report(report: &SessionReport) {
    let stats = &report.statistics;
    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    println!(
        "Session {:016x}{}",
        report.session_id,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "{} probes sent, {} received, {} lost ({:.2}%) in {:.2} s",
        stats.sent_count,
        stats.received_count,
        stats.lost_count,
        stats.loss_percent(),
        report.duration.as_secs_f64()
    );
    println!(
        "duplicates {}  reordered {}  late {}  invalid {}",
        stats.duplicate_count, stats.reorder_count, stats.late_count, stats.decode_errors
    );
    println!("jitter {:.3} ms", stats.jitter_ms());

    if let Some(latency) = stats.latency {
        println!(
            "rtt min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
            latency.min_ns as f64 / 1e6,
            latency.mean_ms(),
            latency.max_ns as f64 / 1e6,
            latency.stddev_ns / 1e6
        );
        println!(
            "rtt p50/p95/p99 = {:.3}/{:.3}/{:.3} ms",
            latency.p50_ns as f64 / 1e6,
            latency.p95_ns as f64 / 1e6,
            latency.p99_ns as f64 / 1e6
        );
    }

    if report.sender.send_failures > 0 || report.receive_failures > 0 {
        println!(
            "send failures {}  receive failures {}",
            report.sender.send_failures, report.receive_failures
        );
    }

    if !report.missing_ranges.is_empty() {
        let ranges: Vec<String> = report
            .missing_ranges
            .iter()
            .map(|r| {
                if r.first == r.last {
                    r.first.to_string()
                } else {
                    format!("{}-{}", r.first, r.last)
                }
            })
            .collect();
        let more = if report.missing_ranges_truncated > 0 {
            format!(" (+{} more)", report.missing_ranges_truncated)
        } else {
            String::new()
        };
        println!("missing: {}{}", ranges.join(", "), more);
    }
}
