//! Request authentication seam.

use std::sync::{Arc, OnceLock};

use crate::errors::EncodeError;

/// Produces the credential blob a protocol packs ahead of the request.
pub trait Authenticator: Send + Sync {
    fn generate_credential(&self) -> Result<Vec<u8>, EncodeError>;
}

/// Stock authenticator for the ESP protocol.
///
/// ESP peers expect a credential block on every request; when channel options
/// carry no authenticator, init installs this one.
struct EspAuthenticator;

const ESP_CREDENTIAL_MAGIC: &[u8] = b"ESPA";

impl Authenticator for EspAuthenticator {
    fn generate_credential(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(ESP_CREDENTIAL_MAGIC.to_vec())
    }
}

/// The process-wide ESP authenticator.
pub fn global_esp_authenticator() -> Arc<dyn Authenticator> {
    static GLOBAL: OnceLock<Arc<dyn Authenticator>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(EspAuthenticator)).clone()
}
