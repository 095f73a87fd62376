// Downstream record store: conditional PATCH of the originating record and the
// bearer tokens needed to call it.

pub mod client;
pub mod token;

pub use client::{RecordStoreTarget, WebApiClient};
pub use token::{ClientCredentialsTokenProvider, StaticTokenProvider};
