//! Checkpoint state store.
//!
//! Iterator state is checkpointed through a flat key/value store: each
//! iterator writes scalars, strings, and tensors under keys namespaced
//! by its own prefix (see [`full_name`]), and booleans are encoded as
//! key presence, so a reader probes them with [`StateReader::contains`].
//!
//! A [`StateBundle`] owns the entries and can round-trip through an
//! on-disk container: bincode-encoded payload prefixed with a SHA-256
//! digest that is recomputed and compared on load, so a truncated or
//! corrupted checkpoint fails loudly instead of restoring garbage.

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Join an iterator prefix and a local key into a store key.
pub fn full_name(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

/// One stored value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Int(i64),
    Str(String),
    Tensor(Tensor),
}

/// An ordered set of checkpoint entries.
///
/// Entries are keyed by full names; ordering is stable so encoded
/// checkpoints are deterministic for identical state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBundle {
    entries: BTreeMap<String, StateValue>,
}

impl StateBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writer view over this bundle.
    pub fn writer(&mut self) -> StateWriter<'_> {
        StateWriter { bundle: self }
    }

    /// Reader view over this bundle.
    pub fn reader(&self) -> StateReader<'_> {
        StateReader { bundle: self }
    }

    /// Encode this bundle into the checksummed container format.
    ///
    /// # Errors
    /// Internal if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| Error::internal(format!("failed to encode checkpoint: {e}")))?;
        let digest = Sha256::digest(&payload);
        let mut out = Vec::with_capacity(digest.len() + payload.len());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a container produced by [`StateBundle::encode`], verifying
    /// its digest.
    ///
    /// # Errors
    /// InvalidArgument if the container is truncated, fails the digest
    /// check, or does not decode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        const DIGEST_LEN: usize = 32;
        if bytes.len() < DIGEST_LEN {
            return Err(Error::invalid_argument(
                "checkpoint container shorter than its digest",
            ));
        }
        let (stored_digest, payload) = bytes.split_at(DIGEST_LEN);
        let digest = Sha256::digest(payload);
        if digest.as_slice() != stored_digest {
            return Err(Error::invalid_argument(
                "checkpoint integrity check failed: digest mismatch",
            ));
        }
        let (bundle, _len): (StateBundle, usize) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| Error::invalid_argument(format!("failed to decode checkpoint: {e}")))?;
        Ok(bundle)
    }

    /// Write the container to `path`, syncing before returning.
    ///
    /// # Errors
    /// Unknown for filesystem failures.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let encoded = self.encode()?;
        let path = path.as_ref();
        let io_err =
            |e: std::io::Error| Error::unknown(format!("checkpoint write {}: {e}", path.display()));
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(&encoded).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Load a container previously written with
    /// [`StateBundle::save_to_file`].
    ///
    /// # Errors
    /// Unknown for filesystem failures; InvalidArgument for corrupt
    /// contents.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let io_err =
            |e: std::io::Error| Error::unknown(format!("checkpoint read {}: {e}", path.display()));
        let mut file = File::open(path).map_err(io_err)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(io_err)?;
        Self::decode(&bytes)
    }
}

/// Write access to a [`StateBundle`].
pub struct StateWriter<'a> {
    bundle: &'a mut StateBundle,
}

impl StateWriter<'_> {
    pub fn write_scalar(&mut self, key: impl Into<String>, value: i64) {
        self.bundle
            .entries
            .insert(key.into(), StateValue::Int(value));
    }

    pub fn write_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bundle
            .entries
            .insert(key.into(), StateValue::Str(value.into()));
    }

    pub fn write_tensor(&mut self, key: impl Into<String>, value: Tensor) {
        self.bundle
            .entries
            .insert(key.into(), StateValue::Tensor(value));
    }

    /// Record a set boolean as key presence; absent means false.
    pub fn write_presence(&mut self, key: impl Into<String>) {
        self.write_str(key, "");
    }
}

/// Read access to a [`StateBundle`].
pub struct StateReader<'a> {
    bundle: &'a StateBundle,
}

impl StateReader<'_> {
    /// Whether any value was written under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.bundle.entries.contains_key(key)
    }

    /// # Errors
    /// InvalidArgument if `key` is missing or holds a non-integer value.
    pub fn read_scalar(&self, key: &str) -> Result<i64> {
        match self.bundle.entries.get(key) {
            Some(StateValue::Int(v)) => Ok(*v),
            Some(_) => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is not an integer scalar"
            ))),
            None => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is missing"
            ))),
        }
    }

    /// # Errors
    /// InvalidArgument if `key` is missing or holds a non-string value.
    pub fn read_str(&self, key: &str) -> Result<&str> {
        match self.bundle.entries.get(key) {
            Some(StateValue::Str(v)) => Ok(v),
            Some(_) => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is not a string"
            ))),
            None => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is missing"
            ))),
        }
    }

    /// # Errors
    /// InvalidArgument if `key` is missing or holds a non-tensor value.
    pub fn read_tensor(&self, key: &str) -> Result<&Tensor> {
        match self.bundle.entries.get(key) {
            Some(StateValue::Tensor(v)) => Ok(v),
            Some(_) => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is not a tensor"
            ))),
            None => Err(Error::invalid_argument(format!(
                "checkpoint entry {key} is missing"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorData};

    #[test]
    fn presence_encodes_booleans() {
        let mut bundle = StateBundle::new();
        bundle.writer().write_presence("it:end_of_input");
        let reader = bundle.reader();
        assert!(reader.contains("it:end_of_input"));
        assert!(!reader.contains("it:output_allocated"));
    }

    #[test]
    fn container_rejects_tampering() -> Result<()> {
        let mut bundle = StateBundle::new();
        {
            let mut w = bundle.writer();
            w.write_scalar("it:call_counter", 12);
            w.write_str("it:status_msg", "boom");
            w.write_tensor(
                "it:output_0",
                Tensor::new(TensorData::I64(vec![1, 2, 3]), vec![3])?,
            );
        }

        let mut encoded = bundle.encode()?;
        assert_eq!(StateBundle::decode(&encoded)?, bundle);

        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(StateBundle::decode(&encoded).is_err());
        Ok(())
    }

    #[test]
    fn typed_reads_reject_mismatches() {
        let mut bundle = StateBundle::new();
        bundle.writer().write_scalar("it:input_batch", 4);
        let reader = bundle.reader();
        assert_eq!(reader.read_scalar("it:input_batch").unwrap(), 4);
        assert!(reader.read_str("it:input_batch").is_err());
        assert!(reader.read_tensor("it:input_batch").is_err());
        assert!(reader.read_scalar("it:missing").is_err());
    }

    #[test]
    fn string_tensors_round_trip() -> Result<()> {
        let mut bundle = StateBundle::new();
        bundle.writer().write_tensor(
            "it:strings",
            Tensor::new(TensorData::Str(vec!["a".into(), "bb".into()]), vec![2])?,
        );
        let decoded = StateBundle::decode(&bundle.encode()?)?;
        assert_eq!(decoded.reader().read_tensor("it:strings")?.dtype(), DType::Str);
        Ok(())
    }
}
