//! Runtime options.
//!
//! Options are written as a flat command line, e.g.
//! `--quarantine_size=1048576 --trailer_padding_size=32`, and normally read
//! from the `SHADOWGUARD_OPTIONS` environment variable at setup.

use crate::error::ConfigError;
use crate::stack::StackId;
use crate::util::{
    DEFAULT_MAX_NUM_FRAMES, DEFAULT_QUARANTINE_BLOCK_BYTES, DEFAULT_QUARANTINE_BYTES,
    DEFAULT_SHARDING_FACTOR, DEFAULT_WINDOW_BYTES, MAX_WINDOW_SIZE,
};
use std::collections::BTreeSet;

/// Environment variable holding the option string.
pub const OPTIONS_ENV_VAR: &str = "SHADOWGUARD_OPTIONS";

const PARAM_QUARANTINE_SIZE: &str = "quarantine_size";
const PARAM_QUARANTINE_BLOCK_SIZE: &str = "quarantine_block_size";
const PARAM_TRAILER_PADDING_SIZE: &str = "trailer_padding_size";
const PARAM_SHARDING_FACTOR: &str = "sharding_factor";
const PARAM_ALLOCATION_GUARD_RATE: &str = "allocation_guard_rate";
const PARAM_MAX_NUM_FRAMES: &str = "max_num_frames";
const PARAM_BOTTOM_FRAMES_TO_SKIP: &str = "bottom_frames_to_skip";
const PARAM_IGNORED_STACK_IDS: &str = "ignored_stack_ids";
const PARAM_NO_CHECK_HEAP_ON_FAILURE: &str = "no_check_heap_on_failure";
const PARAM_WINDOW_SIZE: &str = "shadow_window_size";

#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    /// Aggregate quarantine budget in bytes; 0 disables the quarantine.
    pub quarantine_size: usize,
    /// Largest block footprint that may be quarantined.
    pub quarantine_block_size: usize,
    /// Extra bytes of right redzone per block.
    pub trailer_padding_size: usize,
    /// Number of quarantine shards.
    pub sharding_factor: usize,
    /// Fraction of allocations that get a block; the rest go straight to the
    /// backing heap.
    pub allocation_guard_rate: f32,
    pub max_num_frames: usize,
    pub bottom_frames_to_skip: usize,
    /// Run a full heap check when reporting an error.
    pub check_heap_on_failure: bool,
    /// Errors whose crash stack is listed here are not reported.
    pub ignored_stack_ids: BTreeSet<u32>,
    /// Size of the shadowed address window.
    pub shadow_window_size: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            quarantine_size: DEFAULT_QUARANTINE_BYTES,
            quarantine_block_size: DEFAULT_QUARANTINE_BLOCK_BYTES,
            trailer_padding_size: 0,
            sharding_factor: DEFAULT_SHARDING_FACTOR,
            allocation_guard_rate: 1.0,
            max_num_frames: DEFAULT_MAX_NUM_FRAMES,
            bottom_frames_to_skip: 0,
            check_heap_on_failure: true,
            ignored_stack_ids: BTreeSet::new(),
            shadow_window_size: DEFAULT_WINDOW_BYTES,
        }
    }
}

impl Parameters {
    /// Defaults overridden by `SHADOWGUARD_OPTIONS`, if set.
    pub fn from_env() -> Result<Parameters, ConfigError> {
        let mut params = Parameters::default();
        if let Ok(options) = std::env::var(OPTIONS_ENV_VAR) {
            params.parse_options(&options)?;
        }
        Ok(params)
    }

    /// Defaults overridden by `options`.
    pub fn parse(options: &str) -> Result<Parameters, ConfigError> {
        let mut params = Parameters::default();
        params.parse_options(options)?;
        Ok(params)
    }

    /// Apply every `--name[=value]` token of `options`.
    pub fn parse_options(&mut self, options: &str) -> Result<(), ConfigError> {
        for token in options.split_whitespace() {
            let Some(flag) = token.strip_prefix("--") else {
                return Err(ConfigError::UnknownOption(token.to_string()));
            };
            let (name, value) = match flag.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (flag, None),
            };
            self.apply(name, value)?;
        }
        self.validate()
    }

    fn apply(&mut self, name: &str, value: Option<&str>) -> Result<(), ConfigError> {
        match name {
            PARAM_QUARANTINE_SIZE => self.quarantine_size = parse_usize(name, value)?,
            PARAM_QUARANTINE_BLOCK_SIZE => {
                self.quarantine_block_size = parse_usize(name, value)?
            }
            PARAM_TRAILER_PADDING_SIZE => self.trailer_padding_size = parse_usize(name, value)?,
            PARAM_SHARDING_FACTOR => self.sharding_factor = parse_usize(name, value)?,
            PARAM_ALLOCATION_GUARD_RATE => {
                self.allocation_guard_rate = parse_value(name, value)?
            }
            PARAM_MAX_NUM_FRAMES => self.max_num_frames = parse_usize(name, value)?,
            PARAM_BOTTOM_FRAMES_TO_SKIP => self.bottom_frames_to_skip = parse_usize(name, value)?,
            PARAM_WINDOW_SIZE => self.shadow_window_size = parse_usize(name, value)?,
            PARAM_NO_CHECK_HEAP_ON_FAILURE => {
                if value.is_some() {
                    return Err(invalid(name, value));
                }
                self.check_heap_on_failure = false;
            }
            PARAM_IGNORED_STACK_IDS => {
                let list = value.ok_or_else(|| invalid(name, value))?;
                for id in list.split(';').filter(|s| !s.is_empty()) {
                    let hex = id
                        .strip_prefix("0x")
                        .or_else(|| id.strip_prefix("0X"))
                        .unwrap_or(id);
                    let parsed = u32::from_str_radix(hex, 16).map_err(|_| invalid(name, Some(id)))?;
                    self.ignored_stack_ids.insert(parsed);
                }
            }
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        log::debug!("set \"{}\" from options", name);
        Ok(())
    }

    /// Check ranges and clamp dependent values.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.sharding_factor == 0 {
            return Err(ConfigError::OutOfRange {
                name: PARAM_SHARDING_FACTOR,
                constraint: "at least 1",
            });
        }
        if !(0.0..=1.0).contains(&self.allocation_guard_rate) {
            return Err(ConfigError::OutOfRange {
                name: PARAM_ALLOCATION_GUARD_RATE,
                constraint: "between 0 and 1",
            });
        }
        if self.shadow_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::OutOfRange {
                name: PARAM_WINDOW_SIZE,
                constraint: "at most 2 GiB",
            });
        }
        self.quarantine_block_size = self.quarantine_block_size.min(self.quarantine_size);
        Ok(())
    }

    pub fn is_ignored(&self, id: StackId) -> bool {
        self.ignored_stack_ids.contains(&id.get())
    }
}

fn invalid(name: &str, value: Option<&str>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.unwrap_or_default().to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<T, ConfigError> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid(name, value))
}

fn parse_usize(name: &str, value: Option<&str>) -> Result<usize, ConfigError> {
    parse_value(name, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = Parameters::default();
        assert_eq!(p.quarantine_size, 16 << 20);
        assert_eq!(p.quarantine_block_size, 4 << 20);
        assert_eq!(p.trailer_padding_size, 0);
        assert_eq!(p.max_num_frames, 62);
        assert!(p.check_heap_on_failure);
    }

    #[test]
    fn parses_every_option() {
        let p = Parameters::parse(
            "--quarantine_size=4096 --quarantine_block_size=1024 \
             --trailer_padding_size=32 --sharding_factor=4 \
             --allocation_guard_rate=0.5 --max_num_frames=10 \
             --bottom_frames_to_skip=2 --no_check_heap_on_failure \
             --ignored_stack_ids=0x1;0X7E577E57;cafebabe \
             --shadow_window_size=8388608",
        )
        .unwrap();
        assert_eq!(p.quarantine_size, 4096);
        assert_eq!(p.quarantine_block_size, 1024);
        assert_eq!(p.trailer_padding_size, 32);
        assert_eq!(p.sharding_factor, 4);
        assert_eq!(p.allocation_guard_rate, 0.5);
        assert_eq!(p.max_num_frames, 10);
        assert_eq!(p.bottom_frames_to_skip, 2);
        assert!(!p.check_heap_on_failure);
        assert_eq!(
            p.ignored_stack_ids.iter().copied().collect::<Vec<_>>(),
            vec![0x1, 0x7E577E57, 0xCAFEBABE]
        );
        assert_eq!(p.shadow_window_size, 8 << 20);
    }

    #[test]
    fn block_size_clamped_to_quarantine() {
        let p = Parameters::parse("--quarantine_size=100").unwrap();
        assert_eq!(p.quarantine_block_size, 100);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            Parameters::parse("--bogus=1"),
            Err(ConfigError::UnknownOption("bogus".into()))
        );
        assert!(matches!(
            Parameters::parse("--quarantine_size=lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Parameters::parse("--sharding_factor=0"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            Parameters::parse("--allocation_guard_rate=1.5"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(Parameters::parse("quarantine_size=1").is_err());
    }
}
