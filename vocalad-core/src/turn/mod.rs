//! Turn-taking: the protocol state machine and per-turn aggregation.

pub mod aggregator;
pub mod controller;
pub mod word_rate;

pub use aggregator::{TurnAggregator, TurnSummary};
pub use controller::{
    ChannelErrorPolicy, Transition, TurnAction, TurnController, TurnEvent, TurnState, Violation,
};
pub use word_rate::{EnergyGate, EstimateSource, WordRate, WordRateStrategy};
