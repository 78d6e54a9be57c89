//! Environment variable parsing.
//!
//! Harness-owned variables carry the `SYSTEST_` prefix. Variables that the
//! build system exports for all test tooling (`builddir`, `SHELL`, `PERL`)
//! are read verbatim through the `get_external_*` methods.

use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use super::source::Sourced;

const PREFIX: &str = "SYSTEST_";

/// A problem with one environment variable.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}='{value}' is not a valid {expected}")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var} must be set")]
    Missing { var: String },

    #[error("{var}={} is not a directory", path.display())]
    NotADirectory { var: String, path: PathBuf },

    #[error("{var}={value} is outside {range}")]
    OutOfRange {
        var: String,
        value: String,
        range: String,
    },
}

/// Reads harness settings from the environment, collecting every problem
/// instead of stopping at the first one.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Unprefixed string; unset and blank both mean `default`.
    pub fn get_external_string(&mut self, var: &str, default: &str) -> Sourced<String> {
        match non_blank(var) {
            Some(value) => Sourced::from_env(value, var),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Required unprefixed directory.
    pub fn get_external_dir(&mut self, var: &str) -> Option<Sourced<PathBuf>> {
        let Some(value) = non_blank(var) else {
            self.errors.push(EnvError::Missing { var: var.to_string() });
            return None;
        };
        let path = PathBuf::from(value.trim());
        if !path.is_dir() {
            self.errors.push(EnvError::NotADirectory {
                var: var.to_string(),
                path: path.clone(),
            });
        }
        Some(Sourced::from_env(path, var))
    }

    /// `1/true/yes/on` or `0/false/no/off`; empty counts as false.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var = format!("{PREFIX}{name}");
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Sourced::from_env(true, var),
            "0" | "false" | "no" | "off" | "" => Sourced::from_env(false, var),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean",
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Number within `range`; anything else is recorded and replaced by `default`.
    pub fn get_in_range<T>(
        &mut self,
        name: &str,
        default: T,
        range: RangeInclusive<T>,
    ) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var = format!("{PREFIX}{name}");
        let Ok(value) = env::var(&var) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(n) if range.contains(&n) => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    range: format!("{}..={}", range.start(), range.end()),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "number",
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Comma-separated list; blank items are dropped and an empty value
    /// yields an empty list.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let var = format!("{PREFIX}{name}");
        match env::var(&var) {
            Ok(value) => {
                let items = value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(ToString::to_string)
                    .collect();
                Sourced::from_env(items, var)
            }
            Err(_) => Sourced::default_value(default),
        }
    }
}

fn non_blank(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}
