// Brokered queue over its REST API
//
//   connection_string – typed parsing of Endpoint/SharedAccessKeyName/SharedAccessKey/EntityPath
//   sas_signer        – shared access signature (HMAC-SHA256) construction and caching
//   http_client       – send, peek-lock receive, complete and unlock over HTTPS

pub mod connection_string;
pub mod http_client;
pub mod sas_signer;

pub use connection_string::ConnectionString;
pub use http_client::{ClientBuildError, ServiceBusClient};
pub use sas_signer::{SasSigner, SignedCredential, SigningError, sign, url_encode};
