//! Albor Space NR Sidelink UE Main Application
//!
//! Runs the sidelink UE MAC of one transmitting UE against a receiving peer
//! over an ideal channel, slot by slot.

mod config;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use common::{time, SfnSf, SubcarrierSpacing};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::{SlUeConfig, TrafficConfig};
use layers::mac::sidelink::{
    create_scheduler, BitmapResourcePool, NrSlSlotTransmission, NrSlUeMac, SidelinkLcIdentifier, SlHarqInfo,
};
use layers::rlc::SlRlcSet;

/// L2 id of the receiving peer
const PEER_SRC_L2_ID: u32 = 0x00FF_FFFE;

/// RSRP reported for every sensed SCI on the ideal channel
const IDEAL_CHANNEL_RSRP_DBM: f64 = -90.0;

/// Albor Space NR Sidelink UE
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or YAML by extension)
    #[arg(short, long, default_value = "config/sl_ue.toml")]
    config: String,

    /// Number of slots to run
    #[arg(short, long, default_value = "10000")]
    slots: u64,

    /// Log level (trace, debug, info, warn, error), overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Pace the slots in real time
    #[arg(long)]
    realtime: bool,

    /// Print the final statistics as JSON
    #[arg(long)]
    stats_json: bool,
}

/// Periodic packet source of one LC
struct TrafficSource {
    id: SidelinkLcIdentifier,
    packet_size: usize,
    interval_slots: u64,
    next_slot: u64,
    seq: u32,
}

impl TrafficSource {
    fn new(src_l2_id: u32, config: &TrafficConfig, numerology: u8) -> Self {
        Self {
            id: SidelinkLcIdentifier::new(src_l2_id, config.dst_l2_id, config.lcid),
            packet_size: config.packet_size,
            interval_slots: time::ms_to_slots(config.interval_ms, numerology) as u64,
            next_slot: time::ms_to_slots(config.start_ms, numerology) as u64,
            seq: 0,
        }
    }

    /// Packet due at `slot`, if any
    fn poll(&mut self, slot: u64) -> Option<Bytes> {
        if slot < self.next_slot {
            return None;
        }
        self.next_slot += self.interval_slots;
        let mut packet = vec![0u8; self.packet_size];
        let seq = self.seq.to_be_bytes();
        let n = seq.len().min(packet.len());
        packet[..n].copy_from_slice(&seq[..n]);
        self.seq = self.seq.wrapping_add(1);
        Some(Bytes::from(packet))
    }
}

/// Both UEs of the run and their RLC entities
struct SidelinkPair {
    tx_mac: NrSlUeMac,
    tx_rlc: SlRlcSet,
    rx_mac: NrSlUeMac,
    rx_rlc: SlRlcSet,
    sources: Vec<TrafficSource>,
    numerology: u8,
    packets_generated: u64,
    packets_dropped: u64,
}

impl SidelinkPair {
    fn new(config: &SlUeConfig) -> Result<Self> {
        let ue = &config.ue;
        let tx_pool = BitmapResourcePool::new(config.pool.clone())?;
        let scheduler = create_scheduler(&config.scheduler, ue.seed)?;
        let mut tx_mac = NrSlUeMac::new(ue.rnti, ue.src_l2_id, config.mac.clone(), Box::new(tx_pool), scheduler)?;
        let mut tx_rlc = SlRlcSet::new(ue.rnti, ue.rlc_max_queue_bytes);

        let rx_rnti = ue.rnti.wrapping_add(1);
        let rx_pool = BitmapResourcePool::new(config.pool.clone())?;
        let rx_scheduler = create_scheduler(&config.scheduler, ue.seed.wrapping_add(1000))?;
        let mut rx_mac =
            NrSlUeMac::new(rx_rnti, PEER_SRC_L2_ID, config.mac.clone(), Box::new(rx_pool), rx_scheduler)?;

        for lc in &config.logical_channels {
            tx_mac.add_lc(lc.to_info(ue.src_l2_id))?;
            tx_rlc.add_entity(lc.id(ue.src_l2_id));
            rx_mac.add_rx_destination(lc.dst_l2_id);
        }
        let sources = config
            .traffic
            .iter()
            .map(|t| TrafficSource::new(ue.src_l2_id, t, ue.numerology))
            .collect();

        Ok(Self {
            tx_mac,
            tx_rlc,
            rx_mac,
            rx_rlc: SlRlcSet::new(rx_rnti, ue.rlc_max_queue_bytes),
            sources,
            numerology: ue.numerology,
            packets_generated: 0,
            packets_dropped: 0,
        })
    }

    fn run_slot(&mut self, slot: u64) -> Result<()> {
        let sfn = SfnSf::from_normalized(slot, self.numerology)?;

        for source in &mut self.sources {
            if let Some(packet) = source.poll(slot) {
                self.packets_generated += 1;
                if let Err(e) = self.tx_rlc.enqueue(&source.id, packet, slot) {
                    warn!("Packet to {} dropped: {}", source.id.dst_l2_id, e);
                    self.packets_dropped += 1;
                }
            }
        }
        for report in self.tx_rlc.take_buffer_reports(slot) {
            self.tx_mac.report_buffer_status(&report)?;
        }

        let tx = self.tx_mac.slot_indication(&sfn, &mut self.tx_rlc)?;
        self.rx_mac.slot_indication(&sfn, &mut self.rx_rlc)?;
        if let Some(tx) = tx {
            self.deliver(&sfn, &tx)?;
        }
        Ok(())
    }

    /// Ideal channel from the transmitting UE to the peer
    fn deliver(&mut self, sfn: &SfnSf, tx: &NrSlSlotTransmission) -> Result<()> {
        for sci in &tx.pscch {
            self.rx_mac.receive_pscch(*sfn, sci, IDEAL_CHANNEL_RSRP_DBM)?;
        }
        let mut feedback: Vec<SlHarqInfo> = Vec::new();
        for pssch in &tx.pssch {
            let reception = self.rx_mac.receive_pssch(self.tx_mac.rnti(), pssch, &mut self.rx_rlc)?;
            feedback.extend(reception.feedback);
        }
        for harq_info in feedback {
            debug!("PSFCH {} for HARQ ID {}", if harq_info.ack { "ACK" } else { "NACK" }, harq_info.harq_process_id);
            self.tx_mac.receive_psfch(&harq_info);
        }
        let delivered = self.rx_rlc.take_delivered();
        for (id, sdu) in &delivered {
            debug!("Delivered {} bytes on LC {} to {}", sdu.len(), id.lcid, id.dst_l2_id);
        }
        Ok(())
    }

    fn summary(&self) {
        let stats = self.tx_mac.stats();
        info!("Sidelink statistics:");
        info!("  Packets generated: {}, dropped at RLC: {}", self.packets_generated, self.packets_dropped);
        info!("  Grants received: {}", stats.grants_received);
        info!(
            "  New transmissions: {}, retransmissions: {}, PSCCH: {}",
            stats.new_transmissions, stats.retransmissions, stats.pscch_transmissions
        );
        info!(
            "  Wasted grants: {}, wasted retransmissions: {}",
            stats.wasted_grants, stats.wasted_retransmissions
        );
        info!("  Bytes sent: {}, HARQ ACKs: {}", stats.bytes_sent, stats.acks_received);
        for entity in self.rx_rlc.entities() {
            let rx = entity.stats();
            info!(
                "  Received on LC {} from {}: {} SDUs, {} bytes",
                entity.id().lcid,
                entity.id().src_l2_id,
                rx.rx_sdus,
                rx.rx_bytes
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = SlUeConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config))?;

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    fmt().with_env_filter(env_filter).with_target(true).with_thread_ids(true).with_line_number(true).init();

    info!("Starting Albor Space NR Sidelink UE");
    info!("Configuration file: {}", args.config);
    info!("  Source L2 ID: {}", config.ue.src_l2_id);
    if let Some(scs) = SubcarrierSpacing::from_numerology(config.ue.numerology) {
        info!("  Subcarrier spacing: {} kHz (numerology {})", scs.khz(), config.ue.numerology);
    }
    info!("  Scheduler: {:?}, MCS {}", config.scheduler.kind, config.scheduler.mcs);
    info!("  Logical channels: {}", config.logical_channels.len());

    let mut pair = SidelinkPair::new(&config)?;
    let slot_duration = std::time::Duration::from_micros(time::slot_duration_us(config.ue.numerology) as u64);

    if args.realtime {
        let mut interval = tokio::time::interval(slot_duration);
        let mut slot = 0;
        while slot < args.slots {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    pair.run_slot(slot)?;
                    slot += 1;
                }
            }
        }
    } else {
        for slot in 0..args.slots {
            pair.run_slot(slot)?;
        }
    }

    pair.summary();
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(pair.tx_mac.stats())?);
    }
    info!("Sidelink UE shutdown complete");
    Ok(())
}
