//! Runtime configuration - library aliases, hook symbols, logging
//!
//! Loaded from TOML:
//!
//! ```toml
//! [libraries]
//! gtk = "libgtk-4.so.1"
//!
//! [hooks]
//! gobject = "gobject"
//! free = "g_free"
//!
//! [logging]
//! level = "debug"
//! install = true
//! ```
//!
//! The runtime installs a global `tracing` subscriber only when
//! `logging.install` is set. Hosts with their own subscriber leave it off
//! and still receive every event.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "GIR_BRIDGE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Alias → shared library name or path
    #[serde(default = "default_libraries")]
    pub libraries: HashMap<String, String>,

    #[serde(default)]
    pub hooks: HookSymbols,

    /// Resolve hook symbols at start; off for runtimes with injected hooks
    #[serde(default = "default_true")]
    pub resolve_hooks: bool,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Symbol names for the native hook table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSymbols {
    /// Library (alias or name) providing allocator symbols
    pub glib: String,
    /// Library (alias or name) providing object-system symbols
    pub gobject: String,
    pub alloc: String,
    pub free: String,
    pub object_ref: String,
    pub object_ref_sink: String,
    pub object_unref: String,
    pub boxed_copy: String,
    pub boxed_free: String,
    pub type_from_name: String,
    pub instance_type_name: String,
    pub signal_connect: String,
    pub signal_disconnect: String,
    pub list_free: String,
    pub slist_free: String,
}

impl Default for HookSymbols {
    fn default() -> Self {
        Self {
            glib: "glib".into(),
            gobject: "gobject".into(),
            alloc: "g_malloc".into(),
            free: "g_free".into(),
            object_ref: "g_object_ref".into(),
            object_ref_sink: "g_object_ref_sink".into(),
            object_unref: "g_object_unref".into(),
            boxed_copy: "g_boxed_copy".into(),
            boxed_free: "g_boxed_free".into(),
            type_from_name: "g_type_from_name".into(),
            instance_type_name: "g_type_name_from_instance".into(),
            signal_connect: "g_signal_connect_data".into(),
            signal_disconnect: "g_signal_handler_disconnect".into(),
            list_free: "g_list_free".into(),
            slist_free: "g_slist_free".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Install the crate's subscriber when a runtime starts
    #[serde(default)]
    pub install: bool,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub spans: bool,
}

impl LoggingSection {
    /// Overlay this section on environment-derived logging settings
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_env();
        if let Some(level) = &self.level {
            config.level = crate::logging::parse_level(level);
        }
        if self.json {
            config.json_format = true;
        }
        if let Some(file) = &self.file {
            config.file_output = true;
            config.log_path = Some(file.clone());
        }
        config.show_spans |= self.spans;
        config
    }

    /// Install the subscriber if this section asks for it
    pub fn apply(&self) -> bool {
        if self.install {
            crate::logging::init_with_config(self.to_log_config());
        }
        self.install
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            libraries: default_libraries(),
            hooks: HookSymbols::default(),
            resolve_hooks: true,
            logging: LoggingSection::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(source)?;
        // Aliases not overridden keep their defaults
        for (alias, name) in default_libraries() {
            config.libraries.entry(alias).or_insert(name);
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// `$GIR_BRIDGE_CONFIG` if set, defaults otherwise
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Configuration that loads nothing by itself (hooks are injected)
    pub fn detached() -> Self {
        Self {
            resolve_hooks: false,
            ..Self::default()
        }
    }

    /// Map a library alias to the name handed to the loader
    pub fn resolve_library<'a>(&'a self, name: &'a str) -> &'a str {
        self.libraries.get(name).map(String::as_str).unwrap_or(name)
    }
}

fn default_true() -> bool {
    true
}

fn default_libraries() -> HashMap<String, String> {
    let names: &[(&str, &str)] = if cfg!(target_os = "macos") {
        &[
            ("glib", "libglib-2.0.0.dylib"),
            ("gobject", "libgobject-2.0.0.dylib"),
            ("gio", "libgio-2.0.0.dylib"),
            ("gtk", "libgtk-4.1.dylib"),
        ]
    } else if cfg!(windows) {
        &[
            ("glib", "glib-2.0-0.dll"),
            ("gobject", "gobject-2.0-0.dll"),
            ("gio", "gio-2.0-0.dll"),
            ("gtk", "gtk-4-1.dll"),
        ]
    } else {
        &[
            ("glib", "libglib-2.0.so.0"),
            ("gobject", "libgobject-2.0.so.0"),
            ("gio", "libgio-2.0.so.0"),
            ("gtk", "libgtk-4.so.1"),
        ]
    };

    names
        .iter()
        .map(|(alias, name)| (alias.to_string(), name.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_aliases() {
        let config = RuntimeConfig::default();
        assert!(config.libraries.contains_key("gtk"));
        assert_eq!(config.resolve_library("unknown.so"), "unknown.so");
        assert_eq!(config.hooks.free, "g_free");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            resolve_hooks = false

            [hooks]
            free = "my_free"
            "#,
        )
        .unwrap();

        assert!(!config.resolve_hooks);
        assert_eq!(config.hooks.free, "my_free");
        assert_eq!(config.hooks.object_unref, "g_object_unref");
        assert!(config.libraries.contains_key("gobject"));
    }

    #[test]
    fn test_library_override() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [libraries]
            gtk = "/opt/gtk/lib/libgtk-4.so"
            "#,
        )
        .unwrap();

        assert_eq!(config.resolve_library("gtk"), "/opt/gtk/lib/libgtk-4.so");
        assert!(config.libraries.contains_key("glib"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"trace\"\njson = true").unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        let log = config.logging.to_log_config();
        assert_eq!(log.level, tracing::Level::TRACE);
        assert!(log.json_format);
    }

    #[test]
    fn test_subscriber_is_opt_in() {
        let config = RuntimeConfig::default();
        assert!(!config.logging.install);
        assert!(!config.logging.apply());

        let config = RuntimeConfig::from_toml_str("[logging]\ninstall = true").unwrap();
        assert!(config.logging.install);
    }

    #[test]
    fn test_invalid_toml() {
        let err = RuntimeConfig::from_toml_str("resolve_hooks = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
