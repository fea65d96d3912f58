use std::{env, str::FromStr};

/// Tunables for call-site linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkerOptions {
    /// log every bind / rebind / fallback decision
    pub log_binding: bool,
    /// log global variable site decisions
    pub log_globals: bool,
    /// relinks a call site may take before it goes megamorphic for good
    pub max_fail: u32,
    /// receiver types a single call site keeps chained
    pub max_poly: usize,
    /// guard failures a global site may take before it stops caching
    pub global_max_fail: u32,
    pub native_binding: bool,
    pub compiled_binding: bool,
    pub attr_binding: bool,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        Self {
            log_binding: false,
            log_globals: false,
            max_fail: 1000,
            max_poly: 6,
            global_max_fail: 100,
            native_binding: true,
            compiled_binding: true,
            attr_binding: true,
        }
    }
}

impl LinkerOptions {
    /// Read `SITELINK_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        Self {
            log_binding: flag(&lookup, "SITELINK_LOG_BINDING", default.log_binding),
            log_globals: flag(&lookup, "SITELINK_LOG_GLOBALS", default.log_globals),
            max_fail: number(&lookup, "SITELINK_MAXFAIL", default.max_fail),
            max_poly: number(&lookup, "SITELINK_MAXPOLY", default.max_poly),
            global_max_fail: number(
                &lookup,
                "SITELINK_GLOBAL_MAXFAIL",
                default.global_max_fail,
            ),
            native_binding: flag(&lookup, "SITELINK_NATIVE", default.native_binding),
            compiled_binding: flag(
                &lookup,
                "SITELINK_COMPILED",
                default.compiled_binding,
            ),
            attr_binding: flag(&lookup, "SITELINK_ATTR", default.attr_binding),
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).as_deref().map(str::trim) {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            log::warn!("ignoring {key}={other}: expected a boolean");
            default
        }
        None => default,
    }
}

fn number<T: FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring {key}={raw}: expected a number");
            default
        }),
        None => default,
    }
}
