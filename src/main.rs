//! DFLN simulator
//!
//! Runs federated rounds over in-process clients and validators and prints
//! what each validator admitted and how consensus settled.

use clap::{Parser, ValueEnum};
use dfln::aggregate::DEFAULT_TRIM_RATIO;
use dfln::simulation::DpConfig;
use dfln::{
    AggregationMode, Config, ConfigError, ConsensusOutcome, Simulation, SimulationConfig, SimulationReport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Mean,
    Median,
    TrimmedMean,
}

#[derive(Parser)]
#[command(name = "dfln", version, about = "Byzantine-robust federated aggregation with stake-weighted consensus")]
struct Args {
    /// Number of clients
    #[arg(long, default_value = "3")]
    clients: usize,

    /// Number of validators
    #[arg(long, default_value = "3")]
    validators: usize,

    /// Clients that send scaled-up gradients
    #[arg(long, default_value = "0")]
    malicious_clients: usize,

    /// Validators that submit forged digests
    #[arg(long, default_value = "0")]
    malicious_validators: usize,

    /// Rounds to run
    #[arg(short, long, default_value = "1")]
    rounds: usize,

    /// Seed for gradients, masks and nonces
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Stake registered for each validator
    #[arg(long, default_value = "10.0")]
    stake: f64,

    /// Scale factor applied by malicious clients
    #[arg(long)]
    attack_scale: Option<f64>,

    /// Clip and noise client gradients before sending
    #[arg(long)]
    dp: bool,

    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    grad_dim: Option<usize>,

    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Trim ratio for trimmed-mean
    #[arg(long)]
    trim_ratio: Option<f64>,

    #[arg(long)]
    norm_threshold: Option<f64>,

    #[arg(long)]
    cosine_threshold: Option<f64>,

    #[arg(long)]
    max_suspicion: Option<u32>,

    /// Fraction of total stake needed to finalize
    #[arg(long)]
    supermajority: Option<f64>,

    #[arg(long)]
    slash_fraction: Option<f64>,

    /// Print one JSON report per round on stdout
    #[arg(long)]
    json: bool,
}

impl Args {
    fn engine_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(grad_dim) = self.grad_dim {
            config.grad_dim = grad_dim;
        }
        match self.mode {
            Some(Mode::Mean) => config.aggregation = AggregationMode::Mean,
            Some(Mode::Median) => config.aggregation = AggregationMode::Median,
            Some(Mode::TrimmedMean) => {
                if !matches!(config.aggregation, AggregationMode::TrimmedMean { .. }) {
                    config.aggregation = AggregationMode::TrimmedMean { trim_ratio: DEFAULT_TRIM_RATIO };
                }
            }
            None => {}
        }
        if let Some(ratio) = self.trim_ratio {
            match &mut config.aggregation {
                AggregationMode::TrimmedMean { trim_ratio } => *trim_ratio = ratio,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "--trim-ratio only applies to trimmed-mean, aggregation is {other}"
                    )));
                }
            }
        }
        if let Some(v) = self.norm_threshold {
            config.gate.norm_threshold = v;
        }
        if let Some(v) = self.cosine_threshold {
            config.gate.cosine_threshold = v;
        }
        if let Some(v) = self.max_suspicion {
            config.gate.max_suspicion = v;
        }
        if let Some(v) = self.supermajority {
            config.ledger.supermajority_fraction = v;
        }
        if let Some(v) = self.slash_fraction {
            config.ledger.slash_fraction = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn simulation_config(&self) -> SimulationConfig {
        let defaults = SimulationConfig::default();
        SimulationConfig {
            clients: self.clients,
            validators: self.validators,
            malicious_clients: self.malicious_clients,
            malicious_validators: self.malicious_validators,
            seed: self.seed,
            stake: self.stake,
            attack_scale: self.attack_scale.unwrap_or(defaults.attack_scale),
            differential_privacy: self.dp.then(DpConfig::default),
            ..defaults
        }
    }
}

fn log_report(report: &SimulationReport) {
    let round = &report.round;
    info!("══ Round {} ({}) ══", round.round_id, round.aggregation);

    for client in &report.clients {
        info!(
            client = %client.client_id,
            norm = client.grad_norm,
            malicious = client.malicious,
            "client gradient"
        );
    }

    for summary in &round.validators {
        info!(
            validator = %summary.validator_id,
            admitted = summary.admitted,
            rejected = summary.rejected,
            norm = summary.commitment.aggregate_norm,
            digest = %summary.commitment.digest.short(),
            honest = summary.is_honest(),
            "validator aggregate"
        );
    }

    match &round.consensus {
        ConsensusOutcome::Finalized { result } => {
            info!(
                "Consensus on {}… with {:.1}% of stake",
                result.winning_digest.short(),
                result.stake_fraction * 100.0
            );
            for id in &result.slashed {
                warn!(validator = %id, "slashed");
            }
        }
        ConsensusOutcome::NoQuorum { reason } => warn!("No consensus: {}", reason),
    }

    for (id, account) in &round.accounts {
        info!(
            validator = %id,
            stake = account.stake,
            reputation = account.reputation,
            "account"
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dfln=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let engine_config = match args.engine_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut simulation = match Simulation::bootstrap(engine_config, args.simulation_config()) {
        Ok(sim) => sim,
        Err(e) => {
            error!("Failed to set up simulation: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for _ in 0..args.rounds {
        let report = match simulation.next_round().await {
            Ok(report) => report,
            Err(e) => {
                error!("Round failed: {}", e);
                return ExitCode::FAILURE;
            }
        };

        log_report(&report);
        if args.json {
            match serde_json::to_string(&report) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to encode report: {}", e),
            }
        }
    }

    ExitCode::SUCCESS
}
