//! Self-healing: retry failures through escalating strategies, remember
//! what worked, and stop before making things worse.
//!
//! A failure is normalized into a signature. Pattern memory is asked for a
//! known fix first; after that the engine walks [`StrategyTier`]s from
//! cheapest to most expensive, verifying after each attempt. Per signature
//! there are at most five attempts and no strategy is tried twice. The same
//! signature on three tasks trips the circuit breaker, and three failed
//! attempts in a row roll the project back to the checkpoint taken before
//! the streak began. Exhaustion produces a [`DeferredRecord`].

pub mod engine;
pub mod exec;
pub mod ledger;
pub mod signature;
pub mod strategy;

pub use engine::{HealReport, HealStatus, HealingEngine, HealingPolicy};
pub use exec::{CommandVerifier, ShellOutput, ShellStrategyExecutor, run_shell};
pub use ledger::{DeferredRecord, HealingAttempt, HealingLedger, PatternIndex};
pub use signature::{Failure, normalize};
pub use strategy::{Checkpointer, StepOutcome, Strategy, StrategyExecutor, StrategyTier, Verifier};
