//! Authentication and assignment collaborators for the control plane
//!
//! - [`CredentialVerifier`] turns an agent's bearer credential into a tenant id.
//! - [`AssignmentResolver`] turns group/deployment names supplied at connect
//!   time into stable identifiers, creating them on first sight.

pub mod jwt;
pub mod resolver;
pub mod verifier;

pub use jwt::{FleetClaims, JwtError, JwtVerifier};
pub use resolver::{AssignmentResolver, InMemoryAssignmentResolver, ResolvedAssignment};
pub use verifier::{AuthError, CredentialVerifier, StaticTokenVerifier};

// Re-export useful types
pub use async_trait::async_trait;
