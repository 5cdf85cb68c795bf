//! # Translator Pipeline
//!
//! Symmetric byte transforms applied to every serialized frame before it leaves
//! a connection, and undone in reverse order on receipt.
//!
//! ```text
//! outbound:  frame -> T1.outbound -> T2.outbound -> ... -> wire
//! inbound:   wire  -> ... -> T2.inbound -> T1.inbound  -> frame
//! ```
//!
//! Translators may keep scratch state, so they take `&mut self`. A connection
//! builds one chain per direction from the same [`TranslatorFactory`] list;
//! the send path and the receive loop never share an instance.
//!
//! Any inbound failure is reported as [`ProtocolError::Garbled`], which the
//! connection treats as fatal.

pub mod compression;
pub mod encryption;

use crate::config::TranslatorConfig;
use crate::error::{ProtocolError, Result};
use std::sync::Arc;
use tracing::trace;

pub use compression::{CompressionFactory, CompressionKind, CompressionTranslator};
pub use encryption::{EncryptionFactory, EncryptionTranslator, KeyPair};

/// A reversible byte transform. `inbound(outbound(x)) == x` for every `x`.
pub trait Translator: Send {
    fn name(&self) -> &'static str;

    fn outbound(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    fn inbound(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Builds fresh translator instances for each connection and direction
pub trait TranslatorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Translator>>;
}

impl<F> TranslatorFactory for F
where
    F: Fn() -> Result<Box<dyn Translator>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Translator>> {
        self()
    }
}

/// Ordered list of translators
#[derive(Default)]
pub struct TranslatorChain {
    stages: Vec<Box<dyn Translator>>,
}

impl std::fmt::Debug for TranslatorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

impl TranslatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_factories(factories: &[Arc<dyn TranslatorFactory>]) -> Result<Self> {
        let stages = factories
            .iter()
            .map(|f| f.create())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stages })
    }

    pub fn push(&mut self, translator: Box<dyn Translator>) {
        self.stages.push(translator);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn outbound(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.stages.iter_mut().try_fold(data, |acc, stage| {
            let out = stage.outbound(&acc)?;
            trace!(stage = stage.name(), before = acc.len(), after = out.len(), "Outbound translate");
            Ok(out)
        })
    }

    pub fn inbound(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.stages.iter_mut().rev().try_fold(data, |acc, stage| {
            stage.inbound(&acc).map_err(|e| match e {
                ProtocolError::Garbled(_) => e,
                other => ProtocolError::Garbled(format!("{}: {other}", stage.name())),
            })
        })
    }
}

/// Factories described by configuration. Encryption needs keys, so it is only
/// included when `keys` is supplied and encryption is enabled.
pub fn factories_from_config(
    config: &TranslatorConfig,
    keys: Option<(Arc<KeyPair>, x25519_dalek::PublicKey)>,
) -> Result<Vec<Arc<dyn TranslatorFactory>>> {
    let mut factories: Vec<Arc<dyn TranslatorFactory>> = Vec::new();
    if config.compression_enabled {
        factories.push(Arc::new(CompressionFactory::new(
            config.compression_kind,
            config.compression_threshold_bytes,
        )));
    }
    if config.encryption_enabled {
        let (local, remote) = keys.ok_or_else(|| {
            ProtocolError::ConfigError("encryption enabled but no keys supplied".to_string())
        })?;
        factories.push(Arc::new(EncryptionFactory::new(
            config.key_block_bits,
            local,
            remote,
        )?));
    }
    Ok(factories)
}
