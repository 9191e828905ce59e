//! `depot` is an artifact cache that hands out the same object for the same key.
//!
//! Application code asks a [Depot] for the artifact belonging to a
//! [Descriptor](descriptor::Descriptor) and gets back an `Arc` that is shared by every other
//! caller asking for an equal descriptor, for as long as anyone holds on to it. Behind the depot
//! sits a chain of storage tiers.
//!
//! `depot` makes use of four main concepts:
//!
//! - **Descriptor**: A [descriptor] names an artifact by kind, tag, id and optional time range,
//!   and carries hints on how to store it.
//! - **Artifact**: An [artifact] is any value the depot keeps. Optional capabilities such as a
//!   lifecycle or sub-artifacts are expressed through the [artifact::Artifact] trait.
//! - **Backend**: A [backend] persists artifacts, for example as files in a local directory,
//!   delayed in memory, or mirrored to a remote host.
//! - **Depot**: The [Depot] is the front end. It serializes access per descriptor, keeps the
//!   [identity] bindings, applies the configured [policy] to failures and merges concurrent edits
//!   with the mergers from [merge].
//!
//! [config::DepotConfig] assembles all of these from a configuration file.

pub mod artifact;
pub mod backend;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod locker;
pub mod merge;
pub mod meta;
pub mod policy;
pub mod transfer;

pub use coordinator::Depot;

pub mod util {
    //! Collects traits, functions, etc. that are not directly related to the main concepts of
    //! `depot`.

    pub mod clock;
    pub mod close;
    pub(crate) mod encoding;
    pub mod humanbytes;
    pub mod memory;
}
pub mod test_util {
    //! Utilities for testing `depot` code.
    //!
    //! These are not intended to be used in production code.

    pub mod artifacts;
    pub mod backend;
    pub mod clock;
    pub mod memory;
    pub mod transfer;
}
