//! Root-of-tree ingress and egress.
//!
//! The resource manager hands policies to the tree root and receives
//! samples back, through either a JSON file or a shared-memory exchange
//! cell. A path that is a bare `/name` (one leading slash, no other) is a
//! shared-memory key; anything else is a file path.
//!
//! JSON policies are objects of `{name: number | "NAN"}`. Channels beyond
//! an agent's required prefix may be omitted and default to NaN; a missing
//! required channel is invalid. A failed re-read keeps the previous
//! policy.

use std::collections::HashMap;
use std::fs;

use steer_shmem::{ExchangeCell, SharedMemory, CELL_SIZE};

use crate::error::{Error, Result};

fn is_shm_path(path: &str) -> bool {
    path.starts_with('/') && !path[1..].contains('/')
}

enum PolicyStore {
    File(String),
    Shmem(SharedMemory),
}

/// Reads policies on behalf of the tree root.
pub struct ManagerIoSampler {
    store: PolicyStore,
    signal_names: Vec<String>,
    num_required: usize,
    values: Vec<f64>,
    scratch: Vec<f64>,
}

impl ManagerIoSampler {
    /// Binds a policy source. `signal_names` declare the vector layout;
    /// the first `num_required` of them must always be present.
    pub fn new(path: &str,
               signal_names: &[&str],
               num_required: usize) -> Result<ManagerIoSampler> {
        let store = if is_shm_path(path) {
            let shmem = SharedMemory::create(path, CELL_SIZE)?;
            if shmem.is_owner() {
                unsafe { ExchangeCell::from_ptr(shmem.pointer()) }.initialize()?;
            }
            PolicyStore::Shmem(shmem)
        }
        else {
            PolicyStore::File(path.to_owned())
        };
        Ok(ManagerIoSampler {
            store,
            signal_names: signal_names.iter().map(|s| (*s).to_owned()).collect(),
            num_required,
            values: vec![f64::NAN; signal_names.len()],
            scratch: Vec::new(),
        })
    }

    /// Re-reads the source. Returns true when a fresh policy replaced the
    /// cached one; a parse or validation failure propagates after leaving
    /// the cached policy untouched.
    pub fn read_batch(&mut self) -> Result<bool> {
        match &mut self.store {
            PolicyStore::File(path) => {
                let text = fs::read_to_string(&*path)
                    .map_err(|err| Error::io(path.clone(), err))?;
                let parsed = parse_policy_json(&text, &self.signal_names, self.num_required)?;
                self.values = parsed;
                Ok(true)
            }
            PolicyStore::Shmem(shmem) => {
                let cell = unsafe { ExchangeCell::from_ptr(shmem.pointer()) };
                if !cell.read(&mut self.scratch)? {
                    return Ok(false);
                }
                if self.scratch.len() != self.signal_names.len() {
                    return Err(Error::InvalidArgument(format!(
                        "policy cell holds {} values, agent expects {}",
                        self.scratch.len(), self.signal_names.len())));
                }
                self.values.copy_from_slice(&self.scratch);
                Ok(true)
            }
        }
    }

    /// The most recently read policy vector.
    pub fn sample(&self) -> &[f64] {
        &self.values
    }

    /// One channel of the most recent policy, by name.
    pub fn sample_signal(&self, signal_name: &str) -> Result<f64> {
        self.position(signal_name).map(|index| self.values[index])
    }

    /// The declared vector layout.
    pub fn signal_names(&self) -> &[String] {
        &self.signal_names
    }

    fn position(&self, signal_name: &str) -> Result<usize> {
        self.signal_names
            .iter()
            .position(|name| name == signal_name)
            .ok_or_else(|| Error::InvalidArgument(
                format!("signal {:?} is not part of this policy", signal_name)))
    }
}

/// One value in a policy file: a double, or the string `"NAN"`.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum PolicyValue {
    Number(f64),
    Text(String),
}

fn parse_policy_json(text: &str, names: &[String], num_required: usize) -> Result<Vec<f64>> {
    let parsed: HashMap<String, PolicyValue> = serde_json::from_str(text)?;
    for key in parsed.keys() {
        if !names.iter().any(|name| name == key) {
            return Err(Error::InvalidArgument(
                format!("policy name {:?} is not accepted by this agent", key)));
        }
    }
    let mut values = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        match parsed.get(name) {
            Some(PolicyValue::Number(number)) => values.push(*number),
            Some(PolicyValue::Text(text)) if text.eq_ignore_ascii_case("nan") => {
                values.push(f64::NAN);
            }
            Some(PolicyValue::Text(text)) => {
                return Err(Error::FileParse(
                    format!("policy {:?} has unsupported value {:?}", name, text)));
            }
            None if index < num_required => {
                return Err(Error::InvalidArgument(
                    format!("required policy {:?} is missing", name)));
            }
            None => values.push(f64::NAN),
        }
    }
    Ok(values)
}

/// Writes samples (or policies) on behalf of the tree root.
pub struct ManagerIo {
    store: PolicyStore,
    signal_names: Vec<String>,
    values: Vec<f64>,
}

impl ManagerIo {
    /// Binds a sample sink with the declared vector layout.
    pub fn new(path: &str, signal_names: &[&str]) -> Result<ManagerIo> {
        let store = if is_shm_path(path) {
            let shmem = SharedMemory::create(path, CELL_SIZE)?;
            if shmem.is_owner() {
                unsafe { ExchangeCell::from_ptr(shmem.pointer()) }.initialize()?;
            }
            PolicyStore::Shmem(shmem)
        }
        else {
            PolicyStore::File(path.to_owned())
        };
        Ok(ManagerIo {
            store,
            signal_names: signal_names.iter().map(|s| (*s).to_owned()).collect(),
            values: vec![f64::NAN; signal_names.len()],
        })
    }

    /// Stages one channel by name.
    pub fn adjust(&mut self, signal_name: &str, setting: f64) -> Result<()> {
        let index = self
            .signal_names
            .iter()
            .position(|name| name == signal_name)
            .ok_or_else(|| Error::InvalidArgument(
                format!("signal {:?} is not part of this vector", signal_name)))?;
        self.values[index] = setting;
        Ok(())
    }

    /// Stages the whole vector.
    pub fn adjust_all(&mut self, settings: &[f64]) -> Result<()> {
        if settings.len() != self.values.len() {
            return Err(Error::InvalidArgument(format!(
                "vector of {} settings does not match {} declared names",
                settings.len(), self.values.len())));
        }
        self.values.copy_from_slice(settings);
        Ok(())
    }

    /// Publishes the staged vector to the file or cell.
    pub fn write_batch(&mut self) -> Result<()> {
        match &mut self.store {
            PolicyStore::File(path) => {
                let mut object = serde_json::Map::new();
                for (name, value) in self.signal_names.iter().zip(&self.values) {
                    let json_value = match serde_json::Number::from_f64(*value) {
                        Some(number) => serde_json::Value::Number(number),
                        None => serde_json::Value::String("NAN".to_owned()),
                    };
                    object.insert(name.clone(), json_value);
                }
                let text = serde_json::Value::Object(object).to_string();
                fs::write(&*path, text).map_err(|err| Error::io(path.clone(), err))
            }
            PolicyStore::Shmem(shmem) => {
                let cell = unsafe { ExchangeCell::from_ptr(shmem.pointer()) };
                cell.write(&self.values)?;
                Ok(())
            }
        }
    }

    /// The declared vector layout.
    pub fn signal_names(&self) -> &[String] {
        &self.signal_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NAMES: [&str; 4] = ["POWER_CAP", "STEP_COUNT", "MAX_EPOCH_RUNTIME", "POWER_SLACK"];

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn json_policy_parses_numbers_and_nan() {
        let file = write_file(r#"{"POWER_CAP": 160.0, "STEP_COUNT": "NAN"}"#);
        let mut sampler =
            ManagerIoSampler::new(file.path().to_str().unwrap(), &NAMES, 1).unwrap();
        assert!(sampler.read_batch().unwrap());
        assert_eq!(sampler.sample_signal("POWER_CAP").unwrap(), 160.0);
        assert!(sampler.sample_signal("STEP_COUNT").unwrap().is_nan());
        assert!(sampler.sample_signal("POWER_SLACK").unwrap().is_nan());
    }

    #[test]
    fn missing_required_policy_is_invalid() {
        let file = write_file(r#"{"STEP_COUNT": 1.0}"#);
        let mut sampler =
            ManagerIoSampler::new(file.path().to_str().unwrap(), &NAMES, 1).unwrap();
        assert!(matches!(sampler.read_batch(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn unknown_policy_name_is_invalid() {
        let file = write_file(r#"{"POWER_CAP": 1.0, "FRUIT": 2.0}"#);
        let mut sampler =
            ManagerIoSampler::new(file.path().to_str().unwrap(), &NAMES, 1).unwrap();
        assert!(sampler.read_batch().is_err());
    }

    #[test]
    fn parse_failure_keeps_previous_policy() {
        let file = write_file(r#"{"POWER_CAP": 200.0}"#);
        let path = file.path().to_str().unwrap().to_owned();
        let mut sampler = ManagerIoSampler::new(&path, &NAMES, 1).unwrap();
        sampler.read_batch().unwrap();
        assert_eq!(sampler.sample_signal("POWER_CAP").unwrap(), 200.0);

        fs::write(&path, "{ not json").unwrap();
        assert!(sampler.read_batch().is_err());
        assert_eq!(sampler.sample_signal("POWER_CAP").unwrap(), 200.0);
    }

    #[test]
    fn json_roundtrip_preserves_vector() {
        let file = write_file("{}");
        let path = file.path().to_str().unwrap().to_owned();
        let mut writer = ManagerIo::new(&path, &NAMES).unwrap();
        writer.adjust_all(&[160.0, 3.0, f64::NAN, 0.0]).unwrap();
        writer.write_batch().unwrap();

        let mut sampler = ManagerIoSampler::new(&path, &NAMES, 1).unwrap();
        sampler.read_batch().unwrap();
        let values = sampler.sample();
        assert_eq!(values[0], 160.0);
        assert_eq!(values[1], 3.0);
        assert!(values[2].is_nan());
        assert_eq!(values[3], 0.0);
    }

    #[test]
    fn shmem_cell_exchange_and_length_check() {
        let key = format!("/steer-endpoint-{}", std::process::id());
        let mut writer = ManagerIo::new(&key, &NAMES).unwrap();
        let mut sampler = ManagerIoSampler::new(&key, &NAMES, 1).unwrap();

        // Nothing published yet.
        assert!(!sampler.read_batch().unwrap());

        writer.adjust("POWER_CAP", 180.0).unwrap();
        writer.adjust("STEP_COUNT", 0.0).unwrap();
        writer.adjust("MAX_EPOCH_RUNTIME", 0.0).unwrap();
        writer.adjust("POWER_SLACK", 0.0).unwrap();
        writer.write_batch().unwrap();
        assert!(sampler.read_batch().unwrap());
        assert_eq!(sampler.sample_signal("POWER_CAP").unwrap(), 180.0);

        // A peer publishing the wrong arity is rejected.
        let mut short_writer = ManagerIo::new(&key, &NAMES[..2]).unwrap();
        short_writer.adjust_all(&[1.0, 2.0]).unwrap();
        short_writer.write_batch().unwrap();
        assert!(matches!(sampler.read_batch(), Err(Error::InvalidArgument(_))));
    }
}
