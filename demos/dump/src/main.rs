//! Offline replay binary: reads a pcap file, runs it through the full
//! telemetry pipeline, and writes a JSON-lines dump.
//!
//! Grounded in the example pack's `pcap_dump` binaries for the overall
//! shape (config-file-driven `clap` CLI, `env_logger::init()`, a single
//! `Runtime`/`Orchestrator` wired up and run to completion).

mod capture;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use telemetry_core::classify::{HeaderClassifier, Rule, SniClassifier, SniRule};
use telemetry_core::config::{load_config, RuntimeConfig};
use telemetry_core::flow::FlowTable;
use telemetry_core::orchestrator::Orchestrator;
use telemetry_core::protocols::dns::DnsParser;
use telemetry_core::protocols::quic::QuicParser;
use telemetry_core::protocols::tls::SniParser;
use telemetry_core::sink::{all_telemetry_topics, JsonSink};
use telemetry_core::telemetry::chunk::{FlowletTracker, GapChunkDetector};
use telemetry_core::telemetry::frame::FrameDetector;
use telemetry_core::telemetry::http_chunk::HttpChunkDetector;
use telemetry_core::telemetry::pulse::{FlowPrint, FlowPulse};
use telemetry_core::telemetry::summary::FlowSummary;
use telemetry_core::telemetry::tcp::{TcpRetransmit, TcpRtt};
use telemetry_core::telemetry::{TelemetryFactory, TelemetryFunction, TelemetryManager};

use capture::PcapFileSource;

#[derive(Parser, Debug)]
#[clap(about = "Replay a pcap file through the telemetry pipeline")]
struct Args {
    /// Path to the TOML runtime configuration.
    #[clap(short, long, value_name = "FILE")]
    config: PathBuf,
}

fn classification_rules() -> Vec<Rule> {
    vec![
        Rule {
            class: "tls".into(),
            client_subnet: "0.0.0.0/0".parse().unwrap(),
            server_subnet: "0.0.0.0/0".parse().unwrap(),
            client_ports: (0, 65535),
            server_ports: (443, 443),
            protocol: Some(6),
        },
        Rule {
            class: "quic".into(),
            client_subnet: "0.0.0.0/0".parse().unwrap(),
            server_subnet: "0.0.0.0/0".parse().unwrap(),
            client_ports: (0, 65535),
            server_ports: (443, 443),
            protocol: Some(17),
        },
        Rule {
            class: "dns".into(),
            client_subnet: "0.0.0.0/0".parse().unwrap(),
            server_subnet: "0.0.0.0/0".parse().unwrap(),
            client_ports: (0, 65535),
            server_ports: (53, 53),
            protocol: Some(17),
        },
        Rule {
            class: "http".into(),
            client_subnet: "0.0.0.0/0".parse().unwrap(),
            server_subnet: "0.0.0.0/0".parse().unwrap(),
            client_ports: (0, 65535),
            server_ports: (80, 80),
            protocol: Some(6),
        },
    ]
}

fn sni_rules() -> Vec<SniRule> {
    vec![SniRule::new("video", r"(?i)(cdn|video|stream)").expect("static pattern is valid")]
}

fn telemetry_classes() -> std::collections::HashMap<String, Vec<TelemetryFactory>> {
    let mut classes: std::collections::HashMap<String, Vec<TelemetryFactory>> =
        std::collections::HashMap::new();

    classes.insert(
        "tls".into(),
        vec![
            factory(|| Box::new(FlowSummary::new())),
            factory(|| Box::new(FlowPulse::new(Duration::from_secs(1)))),
            factory(|| Box::new(FlowPrint::new(Duration::from_secs(1)))),
            factory(|| Box::new(GapChunkDetector::new(Duration::from_millis(500)))),
            factory(|| Box::new(FlowletTracker::new(Duration::from_millis(500)))),
            factory(|| Box::new(TcpRetransmit::new(Duration::from_secs(1)))),
            factory(|| Box::new(TcpRtt::new())),
        ],
    );
    classes.insert(
        "quic".into(),
        vec![
            factory(|| Box::new(FlowSummary::new())),
            factory(|| Box::new(FlowPulse::new(Duration::from_secs(1)))),
        ],
    );
    classes.insert("dns".into(), vec![factory(|| Box::new(FlowSummary::new()))]);
    classes.insert(
        "http".into(),
        vec![
            factory(|| Box::new(FlowSummary::new())),
            factory(|| Box::new(HttpChunkDetector::new(200))),
        ],
    );
    classes.insert(
        "video".into(),
        vec![factory(|| Box::new(FrameDetector::new()))],
    );

    classes
}

fn factory(f: fn() -> Box<dyn TelemetryFunction>) -> TelemetryFactory {
    Box::new(f)
}

fn build_orchestrator(config: &RuntimeConfig) -> Result<Orchestrator> {
    let mut orch = Orchestrator::new();
    let offline = config
        .offline
        .as_ref()
        .context("this binary only supports offline replay")?;
    orch = orch.with_max_packets(offline.max_packets);

    orch.register(Box::new(FlowTable::new(Duration::from_millis(
        config.flow.idle_timeout_ms,
    ))))?;
    orch.register(Box::new(HeaderClassifier::new(classification_rules())))?;
    orch.register(Box::new(SniClassifier::new(sni_rules())))?;
    orch.register(Box::new(TelemetryManager::new(telemetry_classes())))?;
    orch.register(Box::new(SniParser::new()))?;
    orch.register(Box::new(DnsParser::new()))?;
    orch.register(Box::new(QuicParser::new()))?;

    orch.register(Box::new(JsonSink::new(&config.sink.path, all_telemetry_topics())?))?;

    Ok(orch)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args.config).context("failed to load configuration")?;

    let offline = config
        .offline
        .clone()
        .context("this binary only supports offline replay")?;

    let client_subnets = config
        .direction
        .client_subnets
        .iter()
        .map(|s| s.parse().with_context(|| format!("invalid client subnet {s:?}")))
        .collect::<Result<Vec<_>>>()?;

    let mut source = PcapFileSource::open(&offline.pcap, client_subnets)
        .with_context(|| format!("failed to open pcap file {:?}", offline.pcap))?;

    let mut orchestrator = build_orchestrator(&config)?;
    let processed = orchestrator
        .run(&mut source)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    log::info!("processed {processed} packets");

    Ok(())
}
