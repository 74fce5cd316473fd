pub mod ber;
pub mod client;
pub mod config;
pub mod error;
pub mod ldap_protocol;
pub mod queue;
pub mod root_dse;
pub mod sasl;
pub mod sasl_bind;
pub mod tls;
pub mod transport;
pub mod value;

#[cfg(test)]
mod test_support;

pub use client::LdapClient;
pub use config::Config;
pub use error::{LdapError, Result};
pub use ldap_protocol::{LdapMessage, ProtocolOp};
pub use queue::{ClientQueue, MessageWrapper, Transport};
pub use sasl::{Mechanism, Sasl, SecurityLayer};
pub use sasl_bind::{SaslBindOutcome, SaslBindRequest};
pub use transport::{LdapStream, LdapUrl};
