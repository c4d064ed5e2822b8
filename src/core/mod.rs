pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FeedError, Result};
pub use types::{
    CurrentUnit, DetailRecord, EntityStatus, LiveEntity, Participant, ScoreFingerprint,
    ScoreState, SummaryRecord, UnitScore,
};
