//! The monitoring pipeline: scheduler, workers, extractor, AI collaborator,
//! and the background summary and retention lanes. The control plane talks
//! to it through `EngineHandle` intents; everything else flows through the
//! shared `AppContext`.

pub mod assist;
pub mod context;
pub mod engine;
pub mod extractor;
pub mod janitor;
pub mod ratelimit;
pub mod scheduler;
pub mod stats;
pub mod summary;
pub mod worker;

pub use assist::{Assist, SynthesisResult};
pub use context::AppContext;
pub use engine::{Engine, EngineHandle};
pub use extractor::Extractor;
pub use ratelimit::{RateLimiter, SlidingWindow};
pub use scheduler::{Intent, ScrapeOutcome, ScrapeTask};
pub use stats::ScrapeStats;
