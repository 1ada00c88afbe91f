use std::{
    fs::File,
    io::{
        BufWriter,
        Write as _,
    },
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::{
        Duration,
        Instant,
    },
};

use clap::Parser;
use color_eyre::eyre::{
    Error,
    WrapErr,
    eyre,
};
use rtlsdr_async::{
    RtlSdr,
    rtl_tcp::client::RtlTcpClient,
};
use sdr_pipeline::{
    Stream,
    config::{
        self,
        StreamConfig,
    },
    demod::channel_lpf::ChannelLpfProfile,
};

/// Opens an RTL2832U dongle (USB or `rtl_tcp`), runs the streaming/demodulation pipeline
/// described in the core specification, and drains the demodulated output to an optional raw
/// sample file while logging periodic status (§1.1 "CLI").
#[derive(Debug, Parser)]
struct Args {
    /// USB device index to open; ignored when `--tcp` is given.
    #[arg(short = 'd', long, default_value = "0")]
    device: u32,

    /// Connect to an `rtl_tcp` server instead of a local USB dongle, e.g. "localhost:1234".
    #[arg(long)]
    tcp: Option<String>,

    /// Center frequencies (Hz) to cycle through on squelch hop; the first entry is the
    /// cold-start frequency.
    #[arg(short, long, required = true, num_args = 1..)]
    frequency: Vec<u32>,

    /// Demodulated output sample rate in Hz.
    #[arg(short = 'r', long, default_value = "48000")]
    rate_out: u32,

    /// Tuner gain - either "auto" or a value in dB.
    #[arg(short, long, default_value = "auto")]
    gain: Gain,

    /// PPM frequency correction.
    #[arg(long, default_value_t = 0)]
    ppm: i32,

    /// Demodulate CQPSK (P25) symbols instead of running the FM discriminator.
    #[arg(long)]
    cqpsk: bool,

    /// Samples per symbol for the CQPSK/digital-timed path (4 = P25 Phase 2, 5 = P25 Phase 1).
    #[arg(long, default_value_t = 4)]
    sps: u32,

    /// Use the digital-narrow channel LPF profile for the FM/FSK discriminator path.
    #[arg(long)]
    narrow: bool,

    /// Channel squelch threshold (linear power); 0 disables squelch. Required when more than one
    /// `--frequency` is given (§7 error kind 1).
    #[arg(long, default_value_t = 0.0)]
    squelch: f32,

    /// Bind address for the UDP external control surface, e.g. "0.0.0.0:9999".
    #[arg(long)]
    control_addr: Option<SocketAddr>,

    /// Enable the supervisory tuner-autogain loop (§4.6.1).
    #[arg(long)]
    autogain: bool,

    /// Enable the Auto-PPM trainer (§4.6.2).
    #[arg(long)]
    auto_ppm: bool,

    /// Write demodulated samples (interleaved `f32` little-endian) to this file.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Number of demodulated samples to request per `read` call.
    #[arg(long, default_value_t = 4_096)]
    read_chunk: usize,
}

#[derive(Clone, Copy, Debug)]
enum Gain {
    Auto,
    Manual(i32),
}

impl FromStr for Gain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(Self::Auto)
        }
        else {
            let gain: f32 = s.parse().map_err(|_| eyre!("invalid gain value: {s}"))?;
            Ok(Self::Manual((gain * 10.0) as i32))
        }
    }
}

impl From<Gain> for rtlsdr_async::Gain {
    fn from(value: Gain) -> Self {
        match value {
            Gain::Auto => Self::Auto,
            Gain::Manual(value) => Self::ManualValue(value),
        }
    }
}

fn build_config(args: &Args) -> StreamConfig {
    let channel_lpf_profile = if args.cqpsk {
        ChannelLpfProfile::for_cqpsk_sps(args.sps)
    }
    else if args.narrow {
        ChannelLpfProfile::DigitalNarrow
    }
    else {
        ChannelLpfProfile::WideAnalog
    };

    let config = StreamConfig {
        frequencies_hz: args.frequency.clone(),
        rate_out_hz: args.rate_out,
        gain: args.gain.into(),
        ppm: args.ppm,
        channel_lpf_profile,
        cqpsk_enabled: args.cqpsk,
        symbol_timing_enabled: args.cqpsk,
        ted_sps: args.sps,
        squelch_threshold: args.squelch,
        control_surface_addr: args.control_addr,
        ..StreamConfig::default()
    };
    let mut config = config::apply_env(config);
    config.autogain.enabled |= args.autogain;
    config.auto_ppm.enabled |= args.auto_ppm;
    config
}

/// Runs the blocking consumer read loop (§6 `read`) on its own thread until `running` clears,
/// writing any output samples to `sink` and logging a status line roughly once a second.
fn run_reader(stream: Stream, running: Arc<AtomicBool>, read_chunk: usize, mut sink: Option<BufWriter<File>>) {
    let mut buf = Vec::with_capacity(read_chunk);
    let mut last_report = Instant::now();
    let report_interval = Duration::from_secs(1);

    while running.load(Ordering::Acquire) {
        buf.clear();
        let got = stream.read(&mut buf, read_chunk, Duration::from_millis(200));
        if got > 0 {
            if let Some(sink) = sink.as_mut() {
                for sample in &buf[..got] {
                    if let Err(error) = sink.write_all(&sample.to_le_bytes()) {
                        tracing::warn!(?error, "failed to write demodulated sample");
                        break;
                    }
                }
            }
        }

        if last_report.elapsed() >= report_interval {
            let diagnostics = stream.diagnostics();
            tracing::info!(
                return_pwr = stream.return_pwr(),
                autogain_db = stream.current_gain_db(),
                auto_ppm_locked = stream.auto_ppm_get_status().locked,
                ingest_blocks = diagnostics.ingest_blocks_received,
                input_drops = diagnostics.input_ring_producer_drops,
                output_drops = diagnostics.output_ring_producer_drops,
                "status",
            );
            last_report = Instant::now();
        }
    }

    if let Some(mut sink) = sink {
        let _ = sink.flush();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = build_config(&args);

    let sink = args
        .out
        .as_ref()
        .map(|path| -> Result<_, Error> { Ok(BufWriter::new(File::create(path).wrap_err("creating output file")?)) })
        .transpose()?;

    let stream = match &args.tcp {
        Some(address) => {
            let backend = Arc::new(
                RtlTcpClient::connect(address.as_str())
                    .await
                    .wrap_err_with(|| format!("connecting to rtl_tcp server at {address}"))?,
            );
            tokio::task::spawn_blocking(move || Stream::open(backend, config))
                .await
                .wrap_err("stream-open task panicked")?
                .map_err(|error| eyre!("failed to open stream: {error}"))?
        }
        None => {
            let backend = Arc::new(RtlSdr::open(args.device).wrap_err("opening RTL-SDR device")?);
            tokio::task::spawn_blocking(move || Stream::open(backend, config))
                .await
                .wrap_err("stream-open task panicked")?
                .map_err(|error| eyre!("failed to open stream: {error}"))?
        }
    };

    tracing::info!(output_rate = stream.output_rate(), "stream open");

    let running = Arc::new(AtomicBool::new(true));
    let reader_running = running.clone();
    let read_chunk = args.read_chunk;
    let reader = std::thread::Builder::new()
        .name("sdr-stream-reader".to_string())
        .spawn(move || run_reader(stream, reader_running, read_chunk, sink))
        .expect("failed to spawn reader thread");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    running.store(false, Ordering::Release);
    let _ = reader.join();

    Ok(())
}
