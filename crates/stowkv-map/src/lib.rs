//! StowKV Map: typed, transactional, navigable maps over stowkv-core
//!
//! A [`PrimaryMap`] presents one engine store as an ordered key/value map
//! with codec-driven typing, range views, live iterators and secondary
//! indices.
//!
//! # Architecture
//!
//! - **Connections**: each [`Connection`] carries an ambient transaction
//!   that every map operation joins implicitly
//! - **Deadlocks**: retried with backoff outside a transaction; surfaced as
//!   [`MapError::Deadlock`] inside one, for the caller to abort and re-run
//! - **Search**: FIRST/LAST/CEILING/FLOOR/HIGHER/LOWER reduced to seeks and
//!   steps, clipped to a view's bounds afterwards
//! - **Views**: [`MapView`] and [`IndexView`] carry bounds plus a direction
//!   flag; a descending view remaps search kinds instead of re-implementing
//!   them
//! - **Iterators**: registered per store so autocommitted writes can
//!   force-close the transaction-free ones first
//!
//! ```no_run
//! use stowkv_core::Config;
//! use stowkv_map::{Database, MapOptions, OrderedU32, Utf8};
//!
//! # fn main() -> stowkv_map::MapResult<()> {
//! let db = Database::open("/tmp/stowkv-demo", Config::embedded())?;
//! let conn = db.connect();
//! let map = conn.open_map("users", MapOptions::new(OrderedU32, Utf8).ordered().create(true))?;
//! map.put(&1, &"ada".to_string())?;
//! assert_eq!(map.first_key()?, 1);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod database;
pub mod entry;
pub mod error;
pub mod index;
pub mod iter;
pub mod map;
mod range;
mod registry;
pub mod retry;
pub mod search;
pub mod view;

pub use codec::{Codec, KeyOrder, OrderedI32, OrderedI64, OrderedU32, OrderedU64, RawBytes, Utf8};
pub use database::{Connection, Database};
pub use entry::Entry;
pub use error::{MapError, MapResult};
pub use index::{IndexBinding, IndexGroup, IndexSpec, IndexView, SecondaryIndex};
pub use iter::{GroupIter, IndexIter, Keys, MapIter, Values};
pub use map::{MapOptions, PrimaryMap};
pub use retry::RetryPolicy;
pub use search::SearchKind;
pub use view::MapView;
