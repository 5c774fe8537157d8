pub mod errors;
pub mod registry;
pub mod store;
pub mod transfer;
pub mod wire;

pub use errors::{StoreError, TransferError, WireError};
pub use registry::{Registry, RegistryEntry, SharedRegistry, registry_key};
pub use store::DownloadStore;
pub use transfer::{
    CancelHandle, PackInfo, ProgressSettings, TransferArgs, TransferEvent, TransferHandle,
};
pub use wire::DccMessage;
