/// Domain models shared by the engine and the store
pub mod target;

pub use target::{AlertSettings, Target, TargetId, TargetMode};
