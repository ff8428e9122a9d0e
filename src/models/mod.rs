//! Domain models shared across the execution core.

pub mod account;
pub mod order;
pub mod position;

pub use account::{
    Account, AccountConfig, AccountId, AccountKind, ConnectionConfig, ConnectionId, Credentials,
    ExchangeConnection, ExchangeId,
};
pub use order::{Action, MarketSnapshot, OrderRequest, OrderResult, Side};
pub use position::{Position, PositionKey};
