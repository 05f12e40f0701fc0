//! Core engine: sample -> join -> evaluate -> dispatch, plus the monitor
//! and the termination watcher that run beside it.

pub mod bundle;
pub mod dispatch;
pub mod evaluator;
pub mod join;
pub mod monitor;
pub mod pipeline;
pub mod public;
pub mod sampler;
pub mod termination;
