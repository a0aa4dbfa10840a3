// Copyright 2025 refcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A concurrent, memory-sensitive cache with tiered value retention.
//!
//! Each cache is built on one of four reclamation tiers, which decide how strongly the cache
//! itself retains a value once no [`CacheEntry`] guard for it survives:
//!
//! | Tier | cache-side retention |
//! |---|---|
//! | [`Tier::Strong`] | forever, until explicit removal |
//! | [`Tier::Soft`] | until the embedder signals memory pressure via [`Cache::reclaim`] |
//! | [`Tier::Weak`] | none, the value dies with its last guard |
//! | [`Tier::Phantom`] | none, and the value is never served at all |
//!
//! Reclamations are reconciled lazily: a reclaimed value leaves a notice on an internal queue,
//! and every cache operation drains the queue before it runs. Optional per-entry expiration is
//! lazy in the same way.
//!
//! # Examples
//!
//! ```
//! use refcache::{Cache, RemovalCause};
//!
//! let cache: Cache<String, Vec<u8>> = Cache::weak()
//!     .with_shards(4)
//!     .with_removal_listener(|key: &String, _: Option<&Vec<u8>>, cause: RemovalCause| {
//!         println!("{key} left: {cause:?}");
//!     })
//!     .build()
//!     .unwrap();
//!
//! let entry = cache.get_or_load("answer", |_| Some(vec![42])).unwrap();
//! assert_eq!(*entry, vec![42]);
//!
//! // The value survives exactly as long as a guard does.
//! drop(entry);
//! assert!(cache.get("answer").is_none());
//! ```

mod cache;
mod code;
mod error;
mod event;
mod queue;
mod raw;
mod record;
mod scope;
mod tier;

pub use cache::{Cache, CacheBuilder, CacheEntry};
pub use code::{DefaultHashBuilder, HashBuilder, Key, Value};
pub use error::{Error, ErrorKind, Result};
pub use event::{RemovalCause, RemovalListener};
pub use raw::Loaded;
pub use tier::Tier;

pub mod prelude;
