//! Configuration of the snippet generator.
//!
//! A [`Config`] can be built in code with its builder methods or loaded from
//! a TOML file:
//!
//! ```toml
//! [code-cache]
//! segment-size = 2097152
//! max-segments = 8
//!
//! [dispatch]
//! force-unresolved = true
//!
//! [inline-cache]
//! virtual-slots = 4
//! virtual-policy = "evict-oldest"
//! ```

use crate::descriptor::CallKind;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What an inline dispatch cache does once all of its slots are filled and a
/// new receiver class shows up.
#[derive(serde_derive::Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Overwrite the slot filled longest ago.
    EvictOldest,
    /// Stop caching; every later call goes through generic dispatch.
    Megamorphic,
}

/// Global configuration, wrapping the named sections of the file.
#[derive(serde_derive::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "code-cache")]
    pub(crate) code_cache: CodeCacheConfig,
    #[serde(default)]
    pub(crate) dispatch: DispatchConfig,
    #[serde(default, rename = "inline-cache")]
    pub(crate) inline_cache: InlineCacheConfig,
}

/// Sizing of the code cache.
#[derive(serde_derive::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CodeCacheConfig {
    /// Bytes per segment, rounded up to the page size.
    #[serde(default = "default_segment_size", rename = "segment-size")]
    pub segment_size: usize,
    /// Segments that may be allocated before the cache reports itself full.
    #[serde(default = "default_max_segments", rename = "max-segments")]
    pub max_segments: usize,
    /// Bytes at the top of each segment kept for trampolines.
    #[serde(default = "default_trampoline_reserve", rename = "trampoline-reserve")]
    pub trampoline_reserve: usize,
    /// First target address to assign to segments, instead of their host
    /// addresses.
    #[serde(default, rename = "address-base")]
    pub address_base: Option<u64>,
}

fn default_segment_size() -> usize {
    1 << 20
}
fn default_max_segments() -> usize {
    16
}
fn default_trampoline_reserve() -> usize {
    16 << 10
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            max_segments: default_max_segments(),
            trampoline_reserve: default_trampoline_reserve(),
            address_base: None,
        }
    }
}

/// How call sites are dispatched.
#[derive(serde_derive::Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Treat every resolved call as unresolved, for ahead-of-time code.
    #[serde(default, rename = "force-unresolved")]
    pub force_unresolved: bool,
    /// Record class-redefinition patch sites for embedded method pointers.
    #[serde(default, rename = "class-redefinition")]
    pub class_redefinition: bool,
    /// Route every helper branch through a trampoline.
    #[serde(default, rename = "stress-trampolines")]
    pub stress_trampolines: bool,
}

/// Shape of the inline dispatch caches of virtual and interface calls.
#[derive(serde_derive::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InlineCacheConfig {
    /// Slots per virtual call site.
    #[serde(default = "default_virtual_slots", rename = "virtual-slots")]
    pub virtual_slots: u32,
    /// Slots per interface call site.
    #[serde(default = "default_interface_slots", rename = "interface-slots")]
    pub interface_slots: u32,
    /// Policy of a full virtual cache.
    #[serde(default = "default_policy", rename = "virtual-policy")]
    pub virtual_policy: EvictionPolicy,
    /// Policy of a full interface cache.
    #[serde(default = "default_policy", rename = "interface-policy")]
    pub interface_policy: EvictionPolicy,
}

fn default_virtual_slots() -> u32 {
    4
}
fn default_interface_slots() -> u32 {
    2
}
fn default_policy() -> EvictionPolicy {
    EvictionPolicy::Megamorphic
}

impl Default for InlineCacheConfig {
    fn default() -> Self {
        Self {
            virtual_slots: default_virtual_slots(),
            interface_slots: default_interface_slots(),
            virtual_policy: default_policy(),
            interface_policy: default_policy(),
        }
    }
}

/// Largest number of inline-cache slots a call site may have.
pub const MAX_CACHE_SLOTS: u32 = 64;

/// A configuration file could not be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read `{}`", path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for a `Config`.
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    /// The values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        trace!("Loaded configuration: {config:?}");
        Ok(config)
    }

    /// Loads a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks that the values can work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cc = &self.code_cache;
        if cc.max_segments == 0 {
            return Err(ConfigError::Invalid("max-segments must be at least 1".into()));
        }
        if cc.trampoline_reserve >= cc.segment_size {
            return Err(ConfigError::Invalid(format!(
                "trampoline-reserve ({}) must be smaller than segment-size ({})",
                cc.trampoline_reserve, cc.segment_size
            )));
        }
        let ic = &self.inline_cache;
        for (name, slots) in [
            ("virtual-slots", ic.virtual_slots),
            ("interface-slots", ic.interface_slots),
        ] {
            if slots > MAX_CACHE_SLOTS {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({slots}) exceeds the maximum of {MAX_CACHE_SLOTS}"
                )));
            }
        }
        Ok(())
    }

    /// Code-cache settings.
    pub fn code_cache(&self) -> &CodeCacheConfig {
        &self.code_cache
    }

    /// Dispatch settings.
    pub fn dispatch(&self) -> &DispatchConfig {
        &self.dispatch
    }

    /// Inline-cache settings.
    pub fn inline_cache(&self) -> &InlineCacheConfig {
        &self.inline_cache
    }

    /// Sets the size of each code-cache segment.
    pub fn segment_size(&mut self, bytes: usize) -> &mut Self {
        self.code_cache.segment_size = bytes;
        self
    }

    /// Sets how many segments the code cache may allocate.
    pub fn max_segments(&mut self, count: usize) -> &mut Self {
        self.code_cache.max_segments = count;
        self
    }

    /// Sets the per-segment trampoline reserve.
    pub fn trampoline_reserve(&mut self, bytes: usize) -> &mut Self {
        self.code_cache.trampoline_reserve = bytes;
        self
    }

    /// Assigns segment target addresses starting at `base`.
    pub fn address_base(&mut self, base: u64) -> &mut Self {
        self.code_cache.address_base = Some(base);
        self
    }

    /// Treat every resolved call as unresolved.
    pub fn force_unresolved(&mut self, enable: bool) -> &mut Self {
        self.dispatch.force_unresolved = enable;
        self
    }

    /// Record class-redefinition patch sites.
    pub fn class_redefinition(&mut self, enable: bool) -> &mut Self {
        self.dispatch.class_redefinition = enable;
        self
    }

    /// Route every helper branch through a trampoline.
    pub fn stress_trampolines(&mut self, enable: bool) -> &mut Self {
        self.dispatch.stress_trampolines = enable;
        self
    }

    /// Sets the slot count and full-cache policy for virtual calls.
    pub fn virtual_cache(&mut self, slots: u32, policy: EvictionPolicy) -> &mut Self {
        self.inline_cache.virtual_slots = slots;
        self.inline_cache.virtual_policy = policy;
        self
    }

    /// Sets the slot count and full-cache policy for interface calls.
    pub fn interface_cache(&mut self, slots: u32, policy: EvictionPolicy) -> &mut Self {
        self.inline_cache.interface_slots = slots;
        self.inline_cache.interface_policy = policy;
        self
    }

    /// Slot count and policy of the inline cache for `kind`, if it has one.
    pub fn cache_shape(&self, kind: CallKind) -> Option<(u32, EvictionPolicy)> {
        let ic = &self.inline_cache;
        match kind {
            CallKind::Virtual => Some((ic.virtual_slots, ic.virtual_policy)),
            CallKind::Interface => Some((ic.interface_slots, ic.interface_policy)),
            _ => None,
        }
    }
}
