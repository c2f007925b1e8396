use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};
use super::messages::ParamValue;

/// Flat parameter map keyed by `"<op_id>/<param>"` paths.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStore {
  pub map: HashMap<String, ParamValue>,
}

impl ParamStore {
  pub fn new() -> Self { Self { map: HashMap::new() } }
  pub fn set(&mut self, path: impl Into<String>, v: ParamValue) { self.map.insert(path.into(), v); }
  pub fn set_f32(&mut self, path: impl Into<String>, v: f32) { self.set(path, ParamValue::F32(v)); }
  pub fn set_i32(&mut self, path: impl Into<String>, v: i32) { self.set(path, ParamValue::I32(v)); }
  pub fn set_bool(&mut self, path: impl Into<String>, v: bool) { self.set(path, ParamValue::Bool(v)); }
  pub fn set_str(&mut self, path: impl Into<String>, v: impl Into<String>) { self.set(path, ParamValue::Str(v.into())); }
  pub fn remove(&mut self, path: &str) -> Option<ParamValue> { self.map.remove(path) }
  pub fn len(&self) -> usize { self.map.len() }
  pub fn is_empty(&self) -> bool { self.map.is_empty() }

  // Integers are accepted where a float is expected, not the other way round.
  pub fn get_f32(&self, path: &str, default: f32) -> EngineResult<f32> {
    match self.map.get(path) {
      None => Ok(default),
      Some(ParamValue::F32(v)) => Ok(*v),
      Some(ParamValue::I32(v)) => Ok(*v as f32),
      Some(other) => Err(type_error(path, "f32", other)),
    }
  }
  pub fn get_i32(&self, path: &str, default: i32) -> EngineResult<i32> {
    match self.map.get(path) {
      None => Ok(default),
      Some(ParamValue::I32(v)) => Ok(*v),
      Some(other) => Err(type_error(path, "i32", other)),
    }
  }
  pub fn get_bool(&self, path: &str, default: bool) -> EngineResult<bool> {
    match self.map.get(path) {
      None => Ok(default),
      Some(ParamValue::Bool(v)) => Ok(*v),
      Some(other) => Err(type_error(path, "bool", other)),
    }
  }
  pub fn get_str(&self, path: &str) -> EngineResult<Option<&str>> {
    match self.map.get(path) {
      None => Ok(None),
      Some(ParamValue::Str(v)) => Ok(Some(v.as_str())),
      Some(other) => Err(type_error(path, "string", other)),
    }
  }

  /// Parameter names (path minus `"<op_id>/"`) stored for one operator.
  pub fn names_for<'a>(&'a self, op_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self.map.keys().filter_map(move |k| k.strip_prefix(op_id).and_then(|rest| rest.strip_prefix('/')))
  }
}

fn type_error(path: &str, expected: &'static str, found: &ParamValue) -> EngineError {
  EngineError::ParamType { path: path.to_string(), expected, found: found.type_name() }
}

#[inline]
fn fast_hash(s: &str) -> u64 {
  // FNV-1a 64-bit
  let mut hash: u64 = 0xcbf29ce484222325; // offset basis
  for b in s.as_bytes() {
    hash ^= *b as u64;
    hash = hash.wrapping_mul(0x100000001b3);
  }
  hash
}

// Stable hash of a path, used to derive per-operator noise seeds
pub fn hash_path(path: &str) -> u64 { fast_hash(path) }
