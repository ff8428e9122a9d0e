pub mod enforcer;
pub mod executor;

pub use enforcer::{EnforcerConfig, PositionCapEnforcer, UnwindLedger, UnwindRecord};
pub use executor::ConnectionGateway;
