pub mod aggregate;
pub mod anomaly;
pub mod commitment;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod ledger;
pub mod packet;
pub mod simulation;
pub mod types;
pub mod validator;

pub use types::*;

// Collaborators
pub use crypto::{sha3, verify, Encapsulation, KemKeypair, KemPublicKey, Keypair, SymmetricKey};

// Validator pipeline
pub use aggregate::{aggregate, AggregateError, AggregationMode};
pub use anomaly::{admit, AnomalyRejection, GateConfig, GateState, Verdict};
pub use commitment::commit;
pub use packet::{authenticate, AuthError, SecurePacket};
pub use validator::{PacketOutcome, PacketStatus, Rejection, ValidatorCommitment, ValidatorState};

// Consensus
pub use ledger::{
    Account, ConsensusLedger, ConsensusResult, LedgerConfig, LedgerError, NoQuorum, RoundStatus,
    DEFAULT_SLASH_FRACTION, DEFAULT_SUPERMAJORITY,
};

// Engine
pub use config::{Config, ConfigError};
pub use engine::{ConsensusOutcome, EngineError, RoundEngine, RoundReport, ValidatorRoundSummary};
pub use simulation::{Simulation, SimulationConfig, SimulationError, SimulationReport};
