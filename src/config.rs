use std::env;
use std::str::FromStr;

use crate::benchmarks::{MAX_SIZE_SHIFT, MIN_SIZE_SHIFT, NUM_ITERATIONS};
use crate::error::{Error, Result};

/// Which devices to benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Wgpu,
    Soft,
    All,
}

impl FromStr for BackendChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(BackendChoice::Wgpu),
            "soft" => Ok(BackendChoice::Soft),
            "all" => Ok(BackendChoice::All),
            other => Err(Error::Config(format!(
                "unknown backend `{other}`, expected wgpu, soft or all"
            ))),
        }
    }
}

/// How the source buffer is filled and the destination read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPath {
    /// Temporary staging buffers per transfer.
    #[default]
    Helper,
    /// Staging buffers created once per case and reused for upload and readback.
    Explicit,
}

impl FromStr for TransferPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "helper" => Ok(TransferPath::Helper),
            "explicit" => Ok(TransferPath::Explicit),
            other => Err(Error::Config(format!(
                "unknown transfer path `{other}`, expected helper or explicit"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub iterations: u64,
    /// Buffer sizes run from `1 << min_shift` up to, but excluding, `1 << max_shift`.
    pub min_shift: u32,
    pub max_shift: u32,
    pub backend: BackendChoice,
    pub transfer: TransferPath,
    pub filter: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: NUM_ITERATIONS,
            min_shift: MIN_SIZE_SHIFT,
            max_shift: MAX_SIZE_SHIFT,
            backend: BackendChoice::default(),
            transfer: TransferPath::default(),
            filter: None,
        }
    }
}

impl BenchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            iterations: parse(&lookup, "COPY_BENCH_ITERATIONS")?.unwrap_or(defaults.iterations),
            min_shift: parse(&lookup, "COPY_BENCH_MIN_SHIFT")?.unwrap_or(defaults.min_shift),
            max_shift: parse(&lookup, "COPY_BENCH_MAX_SHIFT")?.unwrap_or(defaults.max_shift),
            backend: parse(&lookup, "COPY_BENCH_BACKEND")?.unwrap_or(defaults.backend),
            transfer: parse(&lookup, "COPY_BENCH_TRANSFER")?.unwrap_or(defaults.transfer),
            filter: lookup("COPY_BENCH_FILTER").filter(|f| !f.is_empty()),
        };

        if config.iterations == 0 {
            return Err(Error::Config("COPY_BENCH_ITERATIONS must be positive".into()));
        }
        if config.min_shift >= config.max_shift {
            return Err(Error::Config(format!(
                "empty size range: min shift {} is not below max shift {}",
                config.min_shift, config.max_shift
            )));
        }
        if config.max_shift > 40 {
            return Err(Error::Config(format!(
                "max shift {} is unreasonably large",
                config.max_shift
            )));
        }
        Ok(config)
    }

    pub fn buffer_sizes(&self) -> impl Iterator<Item = u64> + Clone {
        (self.min_shift..self.max_shift).map(|shift| 1u64 << shift)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<BenchConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BenchConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_sweep_one_to_thirty_two_mib() {
        let config = config(&[]).unwrap();
        assert_eq!(config, BenchConfig::default());
        let sizes: Vec<u64> = config.buffer_sizes().collect();
        assert_eq!(sizes.first(), Some(&(1 << 20)));
        assert_eq!(sizes.last(), Some(&(1 << 25)));
        assert_eq!(sizes.len(), 6);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("COPY_BENCH_ITERATIONS", "7"),
            ("COPY_BENCH_MIN_SHIFT", "12"),
            ("COPY_BENCH_MAX_SHIFT", "14"),
            ("COPY_BENCH_BACKEND", "Soft"),
            ("COPY_BENCH_TRANSFER", "explicit"),
            ("COPY_BENCH_FILTER", "vector"),
        ])
        .unwrap();
        assert_eq!(config.iterations, 7);
        assert_eq!(config.buffer_sizes().collect::<Vec<_>>(), vec![4096, 8192]);
        assert_eq!(config.backend, BackendChoice::Soft);
        assert_eq!(config.transfer, TransferPath::Explicit);
        assert_eq!(config.filter.as_deref(), Some("vector"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for vars in [
            [("COPY_BENCH_ITERATIONS", "many")],
            [("COPY_BENCH_ITERATIONS", "0")],
            [("COPY_BENCH_BACKEND", "vulkan")],
            [("COPY_BENCH_MIN_SHIFT", "26")],
        ] {
            assert!(matches!(config(&vars), Err(Error::Config(_))), "{vars:?}");
        }
    }
}
