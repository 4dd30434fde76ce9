// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config port and JSON config service.
//!
//! A [`ConfigStore`] moves opaque blobs keyed by name; [`ConfigService`]
//! layers typed JSON on top. The daemon keeps its [`ServiceSettings`] under
//! one key and writes defaults the first time it starts.
//!
//! [`ServiceSettings`]: crate::settings::ServiceSettings

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Where config blobs live.
pub trait ConfigStore {
    /// Raw bytes for `key`; [`ConfigError::NotFound`] when nothing is stored.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored for `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Config failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("not found")]
    NotFound,
    /// Backing storage failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not valid JSON for the expected type (or the value
    /// could not be encoded).
    #[error("config {key}: {source}")]
    Serde {
        /// Config key.
        key: String,
        /// Decoder or encoder error.
        source: serde_json::Error,
    },
    /// Well-formed but unusable value.
    #[error("invalid config for {key}: {reason}")]
    Invalid {
        /// Config key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Anything a store cannot express otherwise.
    #[error("other: {0}")]
    Other(String),
}

/// Typed JSON access over a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Decode the value stored for `key`. Missing or empty blobs are `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => return Ok(None),
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConfigError::Serde {
                key: key.to_owned(),
                source,
            })
    }

    /// Store `value` under `key` as pretty JSON, so operators can edit it.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(value).map_err(|source| ConfigError::Serde {
            key: key.to_owned(),
            source,
        })?;
        self.store.save_raw(key, &data)
    }

    /// Load `key`, or persist and return `T::default()` the first time.
    ///
    /// The boolean is `true` when the defaults were just written.
    pub fn load_or_init<T>(&self, key: &str) -> Result<(T, bool), ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(value) = self.load(key)? {
            return Ok((value, false));
        }
        let value = T::default();
        self.save(key, &value)?;
        Ok((value, true))
    }
}
