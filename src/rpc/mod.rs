pub mod adapter;
pub mod pool;
pub mod provider;

pub use adapter::{ChainAdapter, FetchResult, HttpTransport, RpcTransport, TransportError};
pub use pool::{ProviderSlot, RpcPool, SlotOutcome};
pub use provider::{ProviderState, ProviderStatusRow};
