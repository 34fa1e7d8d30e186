//! Resident module registry.
//!
//! Import resolution needs the target-space base of every module an image imports from. The
//! registry answers that question by module file name. Names are matched case-insensitively,
//! the way the platform loader compares import module names, so `NTOSKRNL.EXE` and
//! `ntoskrnl.exe` refer to the same module.

use std::collections::HashMap;

/// Lookup of resident module bases by name.
pub trait ModuleRegistry {
    /// Target-space base address of the module named `name`.
    ///
    /// `None` (or `Some(0)`) means the module is not resident.
    fn module_base(&self, name: &str) -> Option<u64>;
}

impl<R: ModuleRegistry + ?Sized> ModuleRegistry for &R {
    fn module_base(&self, name: &str) -> Option<u64> {
        (**self).module_base(name)
    }
}

/// A fixed, in-memory module table.
///
/// # Examples
///
/// ```rust
/// use pemap::{ModuleRegistry, StaticRegistry};
///
/// let registry = StaticRegistry::new().with_module("ntoskrnl.exe", 0xFFFF_F800_0000_0000);
/// assert_eq!(registry.module_base("NtosKrnl.exe"), Some(0xFFFF_F800_0000_0000));
/// assert_eq!(registry.module_base("hal.dll"), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    modules: HashMap<String, u64>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> StaticRegistry {
        StaticRegistry::default()
    }

    /// Add `name` at `base`, builder style.
    #[must_use]
    pub fn with_module(mut self, name: &str, base: u64) -> Self {
        self.insert(name, base);
        self
    }

    /// Add or replace `name` at `base`.
    pub fn insert(&mut self, name: &str, base: u64) {
        self.modules.insert(name.to_ascii_lowercase(), base);
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no module is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleRegistry for StaticRegistry {
    fn module_base(&self, name: &str) -> Option<u64> {
        self.modules
            .get(&name.to_ascii_lowercase())
            .copied()
            .filter(|&base| base != 0)
    }
}
