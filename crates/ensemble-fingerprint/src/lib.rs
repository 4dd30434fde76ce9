// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Simulation signatures for the Ensemble result cache.
//!
//! A [`Signature`] names one cache namespace: every request with the same model
//! definition and solver parameters shares it, whatever trajectory count it
//! asks for. The count is a coverage dimension, so it is stripped from the
//! parameters before hashing.
//!
//! # Hash Domain Policy
//!
//! `Signature = BLAKE3(SIGNATURE_DOMAIN || canonical_cbor({model, parameters}))`.
//! The domain prefix is versioned; changing the canonical form requires a new
//! prefix so old and new namespaces can never alias.
#![forbid(unsafe_code)]

pub mod canonical;

use std::fmt;
use std::str::FromStr;

use ciborium::value::Value;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use canonical::CanonError;

/// Domain prefix mixed into every signature hash.
pub const SIGNATURE_DOMAIN: &[u8] = b"ensemble:signature:v1\0";

/// Parameter key that carries the requested trajectory count.
pub const TRAJECTORY_COUNT_KEY: &str = "number_of_trajectories";

/// Trajectory count assumed when a request does not name one.
pub const DEFAULT_TRAJECTORIES: u64 = 1;

/// A 32-byte BLAKE3 simulation signature.
///
/// `Display` and `FromStr` use 64 lowercase hex characters; serde uses the
/// same string form so signatures read the same in URLs, JSON and logs.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub [u8; 32]);

impl Signature {
    /// View the signature as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (same as `Display`).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// Error returned when a string is not a valid signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed signature {input:?}: expected 64 hex characters")]
pub struct SignatureParseError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for Signature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|_| SignatureParseError {
            input: s.to_owned(),
        })?;
        Ok(Self(out))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Input that cannot be turned into a signature.
///
/// Never retried: the same input always fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidModelError {
    /// The value could not be serialized at all.
    #[error("{field} could not be serialized: {reason}")]
    Serialize {
        /// Which input failed (`model` or `parameters`).
        field: &'static str,
        /// Serializer message.
        reason: String,
    },
    /// The top level of the input was not a map.
    #[error("{field} must be a map, got {found}")]
    NotAMap {
        /// Which input failed (`model` or `parameters`).
        field: &'static str,
        /// Kind of value that was found instead.
        found: &'static str,
    },
    /// The value has no canonical encoding.
    #[error("{field} is not canonically serializable: {source}")]
    Canonical {
        /// Which input failed (`model` or `parameters`).
        field: &'static str,
        /// Underlying canonicalization failure.
        source: CanonError,
    },
    /// `number_of_trajectories` was present but not a non-negative integer.
    #[error("number_of_trajectories must be a non-negative integer, got {found}")]
    TrajectoryCount {
        /// JSON rendering of the rejected value.
        found: String,
    },
}

/// Compute the signature of a model definition and its simulation parameters.
///
/// Both inputs must serialize to maps. `TRAJECTORY_COUNT_KEY` is removed from
/// `parameters` before hashing.
pub fn compute<M, P>(model: &M, parameters: &P) -> Result<Signature, InvalidModelError>
where
    M: Serialize + ?Sized,
    P: Serialize + ?Sized,
{
    let model = to_map(model, "model")?;
    let mut parameters = to_map(parameters, "parameters")?;
    if let Value::Map(entries) = &mut parameters {
        entries.retain(|(k, _)| !matches!(k, Value::Text(t) if t == TRAJECTORY_COUNT_KEY));
    }

    // Canonicalize each half separately so errors name the offending input.
    let model_bytes = canonical::encode(&model).map_err(|source| InvalidModelError::Canonical {
        field: "model",
        source,
    })?;
    let parameter_bytes =
        canonical::encode(&parameters).map_err(|source| InvalidModelError::Canonical {
            field: "parameters",
            source,
        })?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(SIGNATURE_DOMAIN);
    // {"model": <model>, "parameters": <parameters>} with keys already in
    // canonical order ("model" sorts before "parameters").
    hasher.update(&[0xa2]);
    hasher.update(&[0x65]);
    hasher.update(b"model");
    hasher.update(&model_bytes);
    hasher.update(&[0x6a]);
    hasher.update(b"parameters");
    hasher.update(&parameter_bytes);
    Ok(Signature(*hasher.finalize().as_bytes()))
}

fn to_map<T: Serialize + ?Sized>(value: &T, field: &'static str) -> Result<Value, InvalidModelError> {
    let value = Value::serialized(value).map_err(|err| InvalidModelError::Serialize {
        field,
        reason: err.to_string(),
    })?;
    match value {
        Value::Map(_) => Ok(value),
        other => Err(InvalidModelError::NotAMap {
            field,
            found: kind_of(&other),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "bytes",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(_, _) => "tag",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "unknown",
    }
}

/// A client's request for trajectories of one model.
///
/// Mirrors the run payload clients send: the model definition plus the solver
/// keyword arguments, with the requested count stored under
/// [`TRAJECTORY_COUNT_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    /// Model definition (species, reactions, parameters, timespan...).
    pub model: serde_json::Value,
    /// Solver keyword arguments, including the trajectory count.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl SimulationRequest {
    /// Build a request with no solver arguments.
    pub fn new(model: serde_json::Value) -> Self {
        Self {
            model,
            kwargs: serde_json::Map::new(),
        }
    }

    /// Set (or replace) a solver keyword argument.
    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Set the requested trajectory count.
    pub fn with_trajectories(self, n: u64) -> Self {
        self.with_kwarg(TRAJECTORY_COUNT_KEY, serde_json::Value::from(n))
    }

    /// Requested trajectory count; [`DEFAULT_TRAJECTORIES`] when absent.
    pub fn trajectories(&self) -> Result<u64, InvalidModelError> {
        match self.kwargs.get(TRAJECTORY_COUNT_KEY) {
            None => Ok(DEFAULT_TRAJECTORIES),
            Some(value) => value
                .as_u64()
                .ok_or_else(|| InvalidModelError::TrajectoryCount {
                    found: value.to_string(),
                }),
        }
    }

    /// Signature of this request's model and solver arguments.
    pub fn signature(&self) -> Result<Signature, InvalidModelError> {
        compute(&self.model, &self.kwargs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn decay_model() -> serde_json::Value {
        json!({
            "name": "decay",
            "species": [{"name": "A", "initial_value": 100}],
            "parameters": [{"name": "k", "expression": 0.5}],
            "reactions": [{"name": "r1", "reactants": {"A": 1}, "products": {}, "rate": "k"}],
            "timespan": [0.0, 1.0, 2.0]
        })
    }

    #[test]
    fn same_input_same_signature() {
        let a = compute(&decay_model(), &json!({"seed": 7})).unwrap();
        let b = compute(&decay_model(), &json!({"seed": 7})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn trajectory_count_is_not_identity() {
        let base = SimulationRequest::new(decay_model()).with_kwarg("seed", json!(7));
        let ten = base.clone().with_trajectories(10);
        let fifteen = base.clone().with_trajectories(15);
        assert_eq!(ten.signature().unwrap(), fifteen.signature().unwrap());
        assert_eq!(ten.signature().unwrap(), base.signature().unwrap());
        assert_eq!(ten.trajectories().unwrap(), 10);
        assert_eq!(base.trajectories().unwrap(), DEFAULT_TRAJECTORIES);
    }

    #[test]
    fn other_parameters_are_identity() {
        let a = compute(&decay_model(), &json!({"seed": 7})).unwrap();
        let b = compute(&decay_model(), &json!({"seed": 8})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn model_and_parameters_do_not_alias() {
        let a = compute(&json!({"x": 1}), &json!({})).unwrap();
        let b = compute(&json!({}), &json!({"x": 1})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn map_encoding_order_is_irrelevant() {
        let mut hashed: HashMap<String, f64> = HashMap::new();
        let mut ordered: BTreeMap<String, f64> = BTreeMap::new();
        for (i, name) in ["zeta", "alpha", "mu", "beta"].iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let v = i as f64 * 0.25;
            hashed.insert((*name).to_owned(), v);
            ordered.insert((*name).to_owned(), v);
        }
        assert_eq!(
            compute(&hashed, &json!({})).unwrap(),
            compute(&ordered, &json!({})).unwrap()
        );
    }

    #[test]
    fn integral_floats_match_integers() {
        let a = compute(&json!({"k": 2.0}), &json!({"t_end": 10.0})).unwrap();
        let b = compute(&json!({"k": 2}), &json!({"t_end": 10})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_map_model_rejected() {
        let err = compute(&json!([1, 2, 3]), &json!({})).unwrap_err();
        assert_eq!(
            err,
            InvalidModelError::NotAMap {
                field: "model",
                found: "array"
            }
        );
    }

    #[test]
    fn non_finite_parameter_rejected() {
        #[derive(Serialize)]
        struct Params {
            rate: f64,
        }
        let err = compute(&json!({"name": "m"}), &Params { rate: f64::INFINITY }).unwrap_err();
        assert!(matches!(
            err,
            InvalidModelError::Canonical {
                field: "parameters",
                source: CanonError::NonFiniteFloat { .. }
            }
        ));
    }

    #[test]
    fn bad_trajectory_count_rejected() {
        let req = SimulationRequest::new(decay_model()).with_kwarg(TRAJECTORY_COUNT_KEY, json!(-3));
        assert!(matches!(
            req.trajectories(),
            Err(InvalidModelError::TrajectoryCount { .. })
        ));
    }

    #[test]
    fn hex_round_trip() {
        let sig = compute(&decay_model(), &json!({})).unwrap();
        let text = sig.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Signature>().unwrap(), sig);
        assert!("not-hex".parse::<Signature>().is_err());
        let json_form = serde_json::to_string(&sig).unwrap();
        assert_eq!(json_form, format!("\"{text}\""));
        assert_eq!(serde_json::from_str::<Signature>(&json_form).unwrap(), sig);
    }
}
