//! Mock document store that follows the production cluster API.
//!
//! Collections of JSON documents with CAS tokens, extended attributes,
//! subdocument lookup/mutation, mutation macros and tombstones: enough of
//! the wire surface for the transactions client to run unmodified against
//! it. Faults can be injected to exercise failure paths that a healthy
//! in-process store would never produce.

mod client;
mod document;
mod engine;
mod error;
mod faults;
mod subdoc;

pub use client::Collection;
pub use document::Document;
pub use engine::DocStore;
pub use error::{Result, StoreError};
pub use faults::{Fault, FaultTarget, StoreOp};
pub use subdoc::{
    DurabilityLevel, LookupOptions, LookupResult, LookupSpec, MutateOptions, MutateSpec,
    StoreSemantics, MAX_SPECS, MUTATION_CAS_MACRO, VBUCKET_HLC_PATH,
};
