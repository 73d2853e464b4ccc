//! Dynamic library loading and symbol resolution
//!
//! Loading is idempotent: each library is opened once per cache and each
//! (library, symbol) pair resolved once.

use crate::error::{Error, Result};
use crate::logging::debug;
use core::ffi::c_void;
use dashmap::DashMap;
use libloading::Library;
use std::collections::HashMap;
use std::sync::Arc;

/// Library name that resolves symbols from the running process
pub const SELF_LIBRARY: &str = "@self";

/// Per-runtime cache of loaded libraries and resolved symbols
pub struct LibraryCache {
    aliases: HashMap<String, String>,
    libraries: DashMap<String, Arc<Library>>,
    symbols: DashMap<(String, String), usize>,
}

impl LibraryCache {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self {
            aliases,
            libraries: DashMap::new(),
            symbols: DashMap::new(),
        }
    }

    /// Load (or fetch the cached handle of) a library by alias or name.
    ///
    /// A comma-separated name tries each candidate in order.
    pub fn load(&self, name: &str) -> Result<Arc<Library>> {
        if let Some(lib) = self.libraries.get(name) {
            return Ok(lib.clone());
        }

        let target = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        let mut last_error = String::from("no candidate names");

        for candidate in target.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            match open(candidate) {
                Ok(lib) => {
                    debug!(library = name, path = candidate, "Library loaded");
                    let lib = Arc::new(lib);
                    self.libraries.insert(name.to_string(), lib.clone());
                    return Ok(lib);
                }
                Err(err) => last_error = err.to_string(),
            }
        }

        Err(Error::Library {
            name: name.to_string(),
            reason: last_error,
        })
    }

    /// Resolve a symbol address, loading the library on first use
    pub fn symbol(&self, library: &str, symbol: &str) -> Result<*const c_void> {
        let key = (library.to_string(), symbol.to_string());
        if let Some(addr) = self.symbols.get(&key) {
            return Ok(*addr as *const c_void);
        }

        let lib = self.load(library)?;

        // SAFETY: the address is only ever called through a descriptor-built
        // call interface; its signature is the generator's precondition.
        let addr = unsafe {
            lib.get::<*const c_void>(symbol.as_bytes())
                .map(|sym| *sym as usize)
                .map_err(|_| Error::Symbol {
                    library: library.to_string(),
                    symbol: symbol.to_string(),
                })?
        };

        if addr == 0 {
            return Err(Error::Symbol {
                library: library.to_string(),
                symbol: symbol.to_string(),
            });
        }

        self.symbols.insert(key, addr);
        Ok(addr as *const c_void)
    }

    /// Number of distinct libraries currently loaded
    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }

    /// Number of resolved symbols
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Drop every cached handle (libraries close when unreferenced)
    pub fn clear(&self) {
        self.symbols.clear();
        self.libraries.clear();
    }
}

impl Default for LibraryCache {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

fn open(name: &str) -> core::result::Result<Library, libloading::Error> {
    if name == SELF_LIBRARY {
        #[cfg(unix)]
        return Ok(libloading::os::unix::Library::this().into());
        #[cfg(windows)]
        return libloading::os::windows::Library::this().map(Into::into);
    }

    // SAFETY: loading runs the library's initialisers; callers name only
    // toolkit libraries they intend to bind.
    unsafe { Library::new(name) }
}
