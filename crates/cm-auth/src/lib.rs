pub mod client_credentials;
pub mod error;

pub use client_credentials::{
    AuthTokenResponse, ClientCredentialsTokenProvider, ClientCredentialsTokenProviderBuilder,
    StaticToken, TokenProvider,
};
pub use error::AuthError;
