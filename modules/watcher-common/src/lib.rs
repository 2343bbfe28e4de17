pub mod config;
pub mod detect;
pub mod error;
pub mod normalize;
pub mod safety;
pub mod types;

pub use config::Config;
pub use detect::{describe_changes, detect, diff_states, fingerprint, AlertDraft, Detection, KeyChange};
pub use error::{ExtractError, WatcherError};
pub use normalize::normalize_value;
pub use safety::{check_url, ip_is_forbidden, resolve_and_check};
pub use types::{
    AlertPolicy, ChangeEvent, ExtractionConfig, Interval, KeySpec, LocatorKind, Normalize,
    StateMap, Target, TargetStatus, Visibility,
};
