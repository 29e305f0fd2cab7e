//! Process-wide tracing setup shared by the workspace binaries.

mod subscriber;

pub use subscriber::init as init_tracing;
