//! # Pathlink Core
//!
//! Core types for Pathlink, a stream-oriented dial/listen layer over a
//! path-aware internet architecture.
//!
//! This crate provides:
//! - Path-aware address parsing (`ISD-AS,host[:port]`) and classification
//! - The path model (identifiers, interfaces, metadata, candidates)
//! - Resolver and prober seams to the external topology service
//! - Per-session path selectors, including active latency probing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod error;
pub mod path;
pub mod resolver;
pub mod selector;

pub use addr::{
    Address, AddressParser, DEFAULT_PORT, IsdAs, PathAddr, is_valid_address, join_host_port,
    parse_address, resolve_address, split_host_port,
};
pub use error::{AddrError, ConfigError, ProbeError, ResolveError};
pub use path::{Liveness, Path, PathCandidate, PathId, PathInterface, PathMetadata};
pub use resolver::{MetadataProber, PathProber, PathResolver, StaticResolver};
pub use selector::{
    DefaultSelector, PathSelector, ProbingConfig, ProbingSelector, SelectorPolicy, SelectorState,
};
