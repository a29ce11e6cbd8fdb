//! Cryostat auth - OpenShift-integrated authentication and authorization
//!
//! This crate gates access to the Cryostat JVM monitoring service when it is
//! deployed on OpenShift. Every authentication decision is delegated to the
//! cluster: bearer tokens are verified with `TokenReview`, permissions are
//! checked with `SelfSubjectAccessReview` probes running as the caller, and
//! interactive login/logout goes through the cluster's OAuth server.
//!
//! # Architecture
//!
//! A validation request flows through:
//! - token extraction from the HTTP `Authorization` header or the WebSocket
//!   subprotocol (no token short-circuits to "not valid", no cluster call)
//! - a `TokenReview` under the service account when no resource actions are
//!   required, or
//! - a parallel `SelfSubjectAccessReview` fan-out under the caller's own
//!   token, one probe per mapped group resource, joined under a deadline
//!
//! Per-token cluster clients are cached with idle expiry and invalidated on
//! failure; OAuth discovery and the login/logout URLs are computed once per
//! process and shared by all callers.
//!
//! # Modules
//!
//! - [`manager`] - The [`AuthManager`] facade and its OpenShift implementation
//! - [`security`] - Abstract permission vocabulary and the resource mapping
//! - [`token`] - Bearer token extraction from transport carriers
//! - [`client`] - Cluster client seams (service account and per-user)
//! - [`cache`] - Per-token cluster client cache
//! - [`oauth`] - OAuth server discovery, login/logout URLs, revocation naming
//! - [`error`] - Error types for the auth manager

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod security;
pub mod token;

pub use error::AuthError;
pub use manager::{
    AuthManager, AuthManagerConfig, AuthenticationScheme, OpenShiftAuthManager, UserInfo,
};
pub use security::{GroupResource, ResourceAction, ResourceMap, ResourceType, ResourceVerb};
