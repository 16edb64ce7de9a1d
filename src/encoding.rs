//! Payload encoders and the negotiation registry.
//!
//! An [`Encoder`] turns application payloads into their on-the-wire form and
//! back. Sessions register encoders by name before they start; the handshake
//! then selects the first name the client prefers that the server also
//! knows. Two implementations ship with the crate: [`RawEncoder`] passes
//! bytes through untouched, [`BincodeEncoder`] applies bincode's standard
//! configuration.

use std::{error::Error, sync::Arc};

use bincode::config;

/// Boxed error type shared by encode and decode failures.
pub type CodecError = Box<dyn Error + Send + Sync>;

/// A named payload transformation selected by handshake.
///
/// Implementations must be pure: `decode` applied to `encode`'s output
/// yields the original payload.
pub trait Encoder: Send + Sync + 'static {
    /// Transform an application payload into its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented.
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Recover an application payload from its wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Ordered registry of named encoders.
///
/// Registration order is the client's preference order: the names are
/// advertised in the `Hello` exactly as registered.
#[derive(Clone, Default)]
pub struct EncoderRegistry {
    entries: Vec<(String, Arc<dyn Encoder>)>,
}

impl EncoderRegistry {
    /// Associate `name` with `encoder`, replacing any previous registration
    /// under the same name without changing its position.
    pub fn register(&mut self, name: impl Into<String>, encoder: impl Encoder) {
        let name = name.into();
        let encoder: Arc<dyn Encoder> = Arc::new(encoder);
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = encoder;
        } else {
            self.entries.push((name, encoder));
        }
    }

    /// Look up an encoder by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Encoder>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, encoder)| Arc::clone(encoder))
    }

    /// Select the first of `candidates` present in the registry.
    ///
    /// The candidate order wins, not the registration order: this is the
    /// server-side half of negotiation, honouring the client's preference.
    #[must_use]
    pub fn pick<'a, I>(&self, candidates: I) -> Option<(String, Arc<dyn Encoder>)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        candidates
            .into_iter()
            .find_map(|name| self.get(name).map(|encoder| (name.to_owned(), encoder)))
    }

    /// Registered names in preference order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Whether no encoder has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Identity encoder: payloads travel as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(value.to_vec()) }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(bytes.to_vec()) }
}

/// Encoder using `bincode` with its standard configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeEncoder;

impl Encoder for BincodeEncoder {
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CodecError> {
        bincode::encode_to_vec(value.to_vec(), config::standard())
            .map_err(|error| Box::new(error) as CodecError)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let (value, _consumed): (Vec<u8>, usize) =
            bincode::decode_from_slice(bytes, config::standard())
                .map_err(|error| Box::new(error) as CodecError)?;
        Ok(value)
    }
}
