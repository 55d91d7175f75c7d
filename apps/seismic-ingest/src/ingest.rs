mod expand;
mod reconnect;
mod session;
mod sink;
mod types;

#[cfg(test)]
mod tests;

pub use expand::expand;
pub use reconnect::{
    ControllerReport, ControllerState, ReconnectController, ReconnectPolicy, RetryBudget, StopReason,
};
pub use session::StreamSession;
pub use sink::{PersistenceSink, WriteMode};
pub use types::SampleRecord;
