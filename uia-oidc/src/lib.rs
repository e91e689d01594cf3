pub mod config;
pub mod coordinator;
pub mod provider;

pub use config::{ProviderConfig, SsoConfig, SsoEndpoints};
pub use coordinator::{OidcCoordinator, OidcSession, RedirectOutcome};
pub use provider::{LoginToken, OidcProvider, VerifiedClaims};
