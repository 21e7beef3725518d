//! `genstore` is an embedded, transactional RDF quad store.
//!
//! Data lives in numbered generation directories (`Data-0001`, `Data-0002`,
//! ...). Each generation has its own transaction coordinator enforcing a
//! single writer and snapshot-isolated readers. Compaction copies the live
//! quads into the next generation and swaps it in while readers keep
//! running; writers only see a short pause.
//!
//! ```no_run
//! use genstore::{Store, StoreConfig, TxnMode};
//! use oxigraph::model::{GraphName, NamedNode, Quad};
//!
//! # fn main() -> genstore::Result<()> {
//! let store = Store::open(StoreConfig::directory("./db")?)?;
//! let quad = Quad::new(
//!     NamedNode::new_unchecked("http://example.org/s"),
//!     NamedNode::new_unchecked("http://example.org/p"),
//!     NamedNode::new_unchecked("http://example.org/o"),
//!     GraphName::DefaultGraph,
//! );
//! store.execute_write(|txn| txn.add(&quad))?;
//! let txn = store.begin(TxnMode::Read)?;
//! assert!(txn.contains(&quad)?);
//! # Ok(())
//! # }
//! ```

extern crate derive_builder;

pub mod api;
pub mod backup;
pub mod compact;
pub mod config;
pub mod consts;
pub mod coordinator;
pub mod deferred;
pub mod errors;
pub mod generation;
pub mod index;
pub mod journal;
pub mod location;
pub mod node;
pub mod options;
pub mod params;
pub mod storage;
pub mod switchable;
pub mod txn;

pub use api::{init_logging, Store, StoreStats};
pub use compact::{CompactionReport, CompactionState};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use deferred::{Completion, DeferredTxn};
pub use errors::{ErrorKind, Result, StoreError};
pub use generation::{Generation, GenerationId};
pub use location::Location;
pub use options::{OldGeneration, PromoteMode, Wait};
pub use params::StoreParams;
pub use txn::{Transaction, TxnMode, TxnState};
