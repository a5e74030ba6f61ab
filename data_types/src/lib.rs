//! Shared data types used across the metrics consumer.
//!
//! The orchestrator's string UIDs never travel past the sync and ingest
//! boundaries; everything downstream of identity resolution speaks the
//! integer ids defined here.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs
)]

use std::fmt;

/// Defines an i64-backed id newtype for one identity table.
macro_rules! typed_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        #[allow(missing_docs)]
        impl $name {
            pub const fn new(v: i64) -> Self {
                Self(v)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(
    /// Unique ID for a `Namespace`.
    NamespaceId
);
typed_id!(
    /// Unique ID for a `Node`.
    NodeId
);
typed_id!(
    /// Unique ID for a `Deployment`.
    DeploymentId
);
typed_id!(
    /// Unique ID for a `StatefulSet`.
    StatefulSetId
);
typed_id!(
    /// Unique ID for a `DaemonSet`.
    DaemonSetId
);
typed_id!(
    /// Unique ID for a `Pod`.
    PodId
);
typed_id!(
    /// Unique ID for a `PersistentVolumeClaim`.
    PvcId
);

/// The id a [`Sample`] is recorded against: the internal id of a Pod or PVC,
/// or [`ResourceId::UNRESOLVED`] when identity resolution failed at ingest
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(i64);

impl ResourceId {
    /// The sentinel id recorded for samples whose owner UID was not yet
    /// observed. Queries exclude these rows.
    pub const UNRESOLVED: Self = Self(0);

    /// Wrap a raw id.
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    /// The raw id.
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// `true` when identity resolution failed for this sample.
    pub fn is_unresolved(&self) -> bool {
        *self == Self::UNRESOLVED
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PodId> for ResourceId {
    fn from(id: PodId) -> Self {
        Self(id.get())
    }
}

impl From<PvcId> for ResourceId {
    fn from(id: PvcId) -> Self {
        Self(id.get())
    }
}

/// The identity tables addressable by UID lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    #[allow(missing_docs)]
    Node,
    #[allow(missing_docs)]
    Deployment,
    #[allow(missing_docs)]
    StatefulSet,
    #[allow(missing_docs)]
    DaemonSet,
    #[allow(missing_docs)]
    Pod,
    #[allow(missing_docs)]
    Pvc,
}

impl EntityKind {
    /// The lowercase table / wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
            Self::Pod => "pod",
            Self::Pvc => "pvc",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two kinds a raw metric can resolve to at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveKind {
    /// The metric belongs to a Pod.
    Pod,
    /// The metric belongs to a PersistentVolumeClaim.
    Pvc,
}

/// How the values of a [`Sample`] were aggregated before recording.
///
/// This core only ever records raw collector readings; roll-ups are produced
/// by downstream tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregationKind {
    /// An unaggregated collector reading.
    #[default]
    Raw,
}

impl AggregationKind {
    /// The persisted form of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
        }
    }
}

/// A single metric reading, resolved to an internal id.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock instant of the reading, in epoch seconds, as reported by
    /// the collector.
    pub time: i64,

    /// The Pod or PVC this reading belongs to.
    pub resource_id: ResourceId,

    /// Short metric key ("cpu_ms", "mem_mb", "used_mb", ...).
    pub metric_type: String,

    /// The reading itself.
    pub value: f64,

    /// Aggregation level of the reading.
    pub aggregation_kind: AggregationKind,
}

impl Sample {
    /// Construct a raw (unaggregated) sample.
    pub fn raw(time: i64, resource_id: ResourceId, metric_type: impl Into<String>, value: f64) -> Self {
        Self {
            time,
            resource_id,
            metric_type: metric_type.into(),
            value,
            aggregation_kind: AggregationKind::Raw,
        }
    }
}
