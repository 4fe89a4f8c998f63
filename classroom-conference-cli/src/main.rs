//! Classroom conferencing CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use classroom_conference_core::prelude::*;
use classroom_conference_core::relay::{InMemoryRelay, RelayEndpoint};
use classroom_conference_core::sim::{LinkConditions, LoopbackNetwork, SyntheticMediaSource};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Room to join
    #[arg(short, long, env = "CLASSROOM_ROOM", default_value = "classroom")]
    room: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration as JSON
    Config,

    /// Run a headless classroom in this process
    Simulate {
        /// Number of participants, the first one teaches
        #[arg(long, default_value_t = 3)]
        participants: usize,

        /// How long everyone stays in the room
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,

        /// Round-trip time of every link
        #[arg(long, default_value_t = 40.0)]
        rtt_ms: f64,

        /// Packet loss of every link, percent
        #[arg(long, default_value_t = 0.0)]
        loss_pct: f64,

        /// Jitter of every link
        #[arg(long, default_value_t = 5.0)]
        jitter_ms: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("classroom=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ConferenceConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Config => handle_config(&config)?,
        Commands::Simulate {
            participants,
            duration_secs,
            rtt_ms,
            loss_pct,
            jitter_ms,
        } => {
            let conditions = LinkConditions {
                rtt_ms,
                loss_pct,
                jitter_ms,
                ..LinkConditions::default()
            };
            handle_simulate(
                config,
                RoomId::new(cli.room),
                participants,
                Duration::from_secs(duration_secs),
                conditions,
            )
            .await?;
        }
    }

    Ok(())
}

fn handle_config(config: &ConferenceConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

struct SimulatedMember {
    info: ParticipantInfo,
    controller: Arc<ConferenceController<RelayEndpoint>>,
}

async fn handle_simulate(
    config: ConferenceConfig,
    room: RoomId,
    participants: usize,
    duration: Duration,
    conditions: LinkConditions,
) -> Result<()> {
    if participants == 0 {
        bail!("at least one participant is required");
    }
    if !(0.0..=100.0).contains(&conditions.loss_pct) {
        bail!("loss must be between 0 and 100 percent");
    }

    let relay = InMemoryRelay::new();
    let network = LoopbackNetwork::new();
    network.set_default_conditions(conditions);

    println!("🏫 Room {room} with {participants} participant(s)");
    println!(
        "   RTT: {}ms | Loss: {}% | Jitter: {}ms",
        conditions.rtt_ms, conditions.loss_pct, conditions.jitter_ms
    );

    let ids = unique_participant_ids(participants, generate_participant_id);
    let mut members = Vec::with_capacity(participants);
    for (index, id) in ids.into_iter().enumerate() {
        let role = if index == 0 { Role::Teacher } else { Role::Student };
        let info = ParticipantInfo::new(id.as_str(), format!("Participant {}", index + 1), role);
        let controller = Arc::new(ConferenceController::new(
            config.clone(),
            Arc::new(SyntheticMediaSource::new()),
            Arc::new(relay.endpoint()),
            network.factory_for(&info.id),
        )?);
        spawn_event_logger(&info, &controller);
        members.push(SimulatedMember { info, controller });
    }

    for member in &members {
        member
            .controller
            .join(room.clone(), member.info.clone())
            .await
            .with_context(|| format!("{} could not join", member.info.id))?;
        println!("✅ {} joined as {}", member.info.display_name, member.info.role);
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }

    print_summary(&members);

    for member in &members {
        member.controller.leave().await;
        println!("👋 {} left", member.info.display_name);
    }
    Ok(())
}

fn spawn_event_logger(info: &ParticipantInfo, controller: &ConferenceController<RelayEndpoint>) {
    let mut events = controller.subscribe_events();
    let who = info.id.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConferenceEvent::ParticipantsChanged { participants }) => {
                    let names: Vec<String> = participants
                        .iter()
                        .map(|p| format!("{}({:?})", p.info.id, p.connection_state))
                        .collect();
                    tracing::info!(participant = %who, members = %names.join(", "), "Participants changed");
                }
                Ok(ConferenceEvent::QualityChanged { peer_id, metrics }) => {
                    tracing::info!(
                        participant = %who,
                        peer_id = %peer_id,
                        level = %metrics.quality_level,
                        latency_ms = metrics.latency_ms,
                        loss_pct = metrics.packet_loss_pct,
                        "Quality changed"
                    );
                }
                Ok(other) => tracing::debug!(participant = %who, event = ?other, "Conference event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(participant = %who, skipped, "Event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_summary(members: &[SimulatedMember]) {
    println!();
    println!("📊 Session summary");
    println!("==================");
    for member in members {
        println!(
            "{} ({}) - {} connection(s)",
            member.info.display_name,
            member.info.id,
            member.controller.active_connections()
        );
        for participant in member.controller.participants() {
            if participant.is_local {
                continue;
            }
            let level = member
                .controller
                .quality_of(participant.id())
                .map(|m| m.quality_level)
                .unwrap_or(QualityLevel::Unknown);
            println!(
                "   -> {:<20} {:?} / {}",
                participant.info.display_name, participant.connection_state, level
            );
        }
    }
    println!();
}

fn generate_participant_id() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let word = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{word}-{:04}", rng.gen_range(0..10_000))
}

/// Draw `count` ids from `generate`, drawing again on a collision
fn unique_participant_ids(count: usize, mut generate: impl FnMut() -> String) -> Vec<String> {
    let mut seen = HashSet::with_capacity(count);
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        let id = generate();
        if seen.insert(id.clone()) {
            ids.push(id);
        } else {
            tracing::debug!(participant = %id, "Participant id collision, drawing again");
        }
    }
    ids
}
