// Contracts Module - view-call ABIs for routers and vaults.
// Event logs are decoded by hand in `types::events`, the bindings here only cover eth_call.

pub mod i_oracle_router;
pub mod i_vault;

pub use i_oracle_router::IOracleRouter;
pub use i_vault::IVault;
