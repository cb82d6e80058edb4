//! Solution-refinement pipeline: a stage machine that drives a code-generation
//! model through reflection, approach selection, test synthesis, code
//! generation and test-driven repair, with every candidate executed in a
//! sandbox for feedback.

pub mod artifact;
pub mod backend;
pub mod docker;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod fix_loop;
pub mod gateway;
pub mod limiter;
pub mod pipeline;
pub mod prompts;
pub mod responses;
pub mod trace;

#[cfg(test)]
mod testing;

pub use pipeline::{solve, Solver};
