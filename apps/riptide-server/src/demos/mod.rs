//! Small apps exercising both directions of the bridge.

pub mod clock;
pub mod counter;
