//! Azure AD authentication module.
//!
//! Provides the OAuth2 client-credentials flow and per-audience token caching.

pub mod oauth;
pub mod secure;
pub mod token;

pub use oauth::{Audience, OAuth2Client};
pub use token::TokenManager;
