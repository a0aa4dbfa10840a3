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

use std::sync::{Arc, Weak};

use crate::record::Record;

/// How strongly the cache retains a value against reclamation.
///
/// | Tier | retrieval while a guard lives | retrieval after the last guard drops |
/// |---|---|---|
/// | [`Tier::Strong`] | always | always (explicit removal only) |
/// | [`Tier::Soft`] | always | until [`crate::Cache::reclaim`] releases the cache's own hold |
/// | [`Tier::Weak`] | always | absent |
/// | [`Tier::Phantom`] | **never** | absent |
///
/// A phantom entry exists only for reclamation bookkeeping: `get` never yields its value, and a
/// loader-based call recomputes on every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Never reclaimed except by explicit removal.
    Strong,
    /// Reclaimable only under the embedder's memory-pressure signal, retained preferentially.
    Soft,
    /// Reclaimable as soon as no guard survives, independent of memory pressure.
    Weak,
    /// Tracked for reclamation notification only; the stored value is never retrievable.
    Phantom,
}

/// The tier-tagged handle an index entry keeps on its record.
pub enum Holder<K, V> {
    Strong(Arc<Record<K, V>>),
    Soft {
        strong: Option<Arc<Record<K, V>>>,
        weak: Weak<Record<K, V>>,
    },
    Weak(Weak<Record<K, V>>),
    Phantom(Weak<Record<K, V>>),
}

impl<K, V> Holder<K, V> {
    pub fn new(tier: Tier, record: &Arc<Record<K, V>>) -> Self {
        match tier {
            Tier::Strong => Self::Strong(record.clone()),
            Tier::Soft => Self::Soft {
                strong: Some(record.clone()),
                weak: Arc::downgrade(record),
            },
            Tier::Weak => Self::Weak(Arc::downgrade(record)),
            Tier::Phantom => Self::Phantom(Arc::downgrade(record)),
        }
    }

    /// Retrieve the value through the slot, per the tier policy.
    ///
    /// Phantom never retrieves, not even immediately after the store.
    pub fn retrieve(&self) -> Option<Arc<Record<K, V>>> {
        match self {
            Self::Strong(record) => Some(record.clone()),
            Self::Soft { strong, weak } => strong.clone().or_else(|| weak.upgrade()),
            Self::Weak(weak) => weak.upgrade(),
            Self::Phantom(_) => None,
        }
    }

    /// Reach the record regardless of the tier's retrieval policy.
    ///
    /// Used by removal paths to retire a still-live record; a phantom record is reachable here
    /// even though [`Holder::retrieve`] refuses it.
    pub fn attached(&self) -> Option<Arc<Record<K, V>>> {
        match self {
            Self::Strong(record) => Some(record.clone()),
            Self::Soft { strong, weak } => strong.clone().or_else(|| weak.upgrade()),
            Self::Weak(weak) | Self::Phantom(weak) => weak.upgrade(),
        }
    }

    /// Whether the referent no longer survives anywhere.
    pub fn is_reclaimed(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Soft { strong, weak } => strong.is_none() && weak.strong_count() == 0,
            Self::Weak(weak) | Self::Phantom(weak) => weak.strong_count() == 0,
        }
    }

    /// Release the cache-held strong half of a soft holder.
    ///
    /// The memory-pressure path; other tiers are unaffected.
    pub fn shed(&mut self) {
        if let Self::Soft { strong, .. } = self {
            *strong = None;
        }
    }

    /// Whether this holder belongs to the phantom tier.
    pub fn is_phantom(&self) -> bool {
        matches!(self, Self::Phantom(_))
    }
}
