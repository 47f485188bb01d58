//! Encrypted credential storage
//!
//! - `crypto`: master key resolution and record sealing
//! - `store`: the file-backed Secret Store
//! - `broker`: async Credential Broker and plugin keychains

mod broker;
mod crypto;
mod store;

pub use broker::{CredentialBroker, Keychain, Namespace};
pub use crypto::MasterKey;
pub use store::{store_path, SecretStore, SecretValue, STORE_FILE};
