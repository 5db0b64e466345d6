//! Store backends and transfer orchestration for the keg artifact store.
//!
//! The [`Store`] trait is the unified backend contract: local filesystem
//! stores, binary caches over object storage, serve-protocol peers over
//! SSH or a local daemon socket, and the content-addressed peer network.
//! [`Dispatcher::open`] maps URIs to backends; [`copy`] moves closures
//! between them.

pub mod archive;
pub mod binary_cache;
pub mod cache;
pub mod config;
pub mod copy;
pub mod dispatch;
pub mod interrupt;
pub mod local;
pub mod object_store;
pub mod peer_store;
pub mod pool;
pub mod remote;
pub mod stream;
pub mod traits;
pub mod wire;

pub use archive::{FlatArchiver, TreeArchiver};
pub use binary_cache::BinaryCacheStore;
pub use config::{StoreConfig, StoreParams};
pub use copy::{
    compute_closure, copy_closure, copy_paths, copy_store_path, substitute_path, CopyOptions,
    CopyProgress,
};
pub use dispatch::{split_uri_params, Dispatcher};
pub use interrupt::{check_interrupt, reset_interrupt, trigger_interrupt};
pub use local::LocalStore;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use peer_store::{MemoryPeerClient, PeerClient, PeerRoot, PeerStore};
pub use remote::RemoteStore;
pub use stream::ByteStream;
pub use traits::{Store, StorePathOrCa, StoreState};
