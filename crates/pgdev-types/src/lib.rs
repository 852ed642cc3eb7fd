//! Shared type definitions for pgdev.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! where the database can be reached from ([`Scope`], [`NetworkInstance`]),
//! who it belongs to ([`ServiceIdentity`]) and what it hands to its
//! dependents ([`ConnectionConfiguration`]).
//!
//! # Modules
//!
//! - [`enums`] -- Network scopes
//! - [`identity`] -- Service identity and deterministic container names
//! - [`structs`] -- Credentials, network instances, endpoints, and the
//!   connection configuration exported to dependency consumers

pub mod enums;
pub mod identity;
pub mod structs;

pub use enums::{Scope, ScopeParseError};
pub use identity::ServiceIdentity;
pub use structs::{
    CONNECTION_KEY, ConfigurationValue, ConnectionConfiguration, Credentials, Endpoint,
    NetworkInstance, POSTGRES_PROVIDER,
};
