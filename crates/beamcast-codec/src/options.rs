//! Typed encoder-option DSL.
//!
//! Descriptors declare options abstractly; at session construction they are
//! resolved against the negotiated config and applied to the backend element
//! through the backend's key dictionary. An `OptInt` that resolves to `None`
//! is omitted entirely.

use std::fmt;
use std::sync::Arc;

use beamcast_core::VideoConfig;

// ── OptionValue ───────────────────────────────────────────────────────────────

/// Value half of an encoder option.
#[derive(Clone)]
pub enum OptionValue {
    Int(i64),
    /// Present only when `Some`.
    OptInt(Option<i64>),
    /// Evaluated against the session config at apply time.
    IntFn(Arc<dyn Fn(&VideoConfig) -> i64 + Send + Sync>),
    Str(String),
    StrFn(Arc<dyn Fn(&VideoConfig) -> String + Send + Sync>),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            Self::OptInt(v) => write!(f, "OptInt({v:?})"),
            Self::IntFn(_) => write!(f, "IntFn(..)"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::StrFn(_) => write!(f, "StrFn(..)"),
        }
    }
}

/// One named encoder option.
#[derive(Debug, Clone)]
pub struct EncoderOption {
    pub name: &'static str,
    pub value: OptionValue,
}

impl EncoderOption {
    pub fn int(name: &'static str, value: i64) -> Self {
        Self { name, value: OptionValue::Int(value) }
    }

    pub fn opt_int(name: &'static str, value: Option<i64>) -> Self {
        Self { name, value: OptionValue::OptInt(value) }
    }

    pub fn int_fn(
        name: &'static str,
        f: impl Fn(&VideoConfig) -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self { name, value: OptionValue::IntFn(Arc::new(f)) }
    }

    pub fn str(name: &'static str, value: impl Into<String>) -> Self {
        Self { name, value: OptionValue::Str(value.into()) }
    }

    pub fn str_fn(
        name: &'static str,
        f: impl Fn(&VideoConfig) -> String + Send + Sync + 'static,
    ) -> Self {
        Self { name, value: OptionValue::StrFn(Arc::new(f)) }
    }

    /// Resolve against the config; `None` means the option is omitted.
    pub fn resolve(&self, config: &VideoConfig) -> Option<ResolvedOption> {
        let value = match &self.value {
            OptionValue::Int(v) => ResolvedValue::Int(*v),
            OptionValue::OptInt(v) => ResolvedValue::Int((*v)?),
            OptionValue::IntFn(f) => ResolvedValue::Int(f(config)),
            OptionValue::Str(s) => ResolvedValue::Str(s.clone()),
            OptionValue::StrFn(f) => ResolvedValue::Str(f(config)),
        };
        Some(ResolvedOption { name: self.name, value })
    }
}

// ── Resolved form ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOption {
    pub name: &'static str,
    pub value: ResolvedValue,
}

/// Resolve a whole option set, dropping omitted entries.
pub fn resolve_all(options: &[EncoderOption], config: &VideoConfig) -> Vec<ResolvedOption> {
    options.iter().filter_map(|o| o.resolve(config)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_none_is_omitted() {
        let cfg = VideoConfig::default();
        let opts = [
            EncoderOption::int("bitrate", 8000),
            EncoderOption::opt_int("qp", None),
            EncoderOption::opt_int("gop-size", Some(300)),
        ];
        let resolved = resolve_all(&opts, &cfg);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name, "bitrate");
        assert_eq!(resolved[1].value, ResolvedValue::Int(300));
    }

    #[test]
    fn callables_see_the_config() {
        let cfg = VideoConfig { bitrate_kbps: 12_345, framerate: 90, ..Default::default() };
        let opts = [
            EncoderOption::int_fn("bitrate", |c| c.bitrate_kbps as i64),
            EncoderOption::str_fn("keyint", |c| format!("{}", c.framerate * 2)),
        ];
        let resolved = resolve_all(&opts, &cfg);
        assert_eq!(resolved[0].value, ResolvedValue::Int(12_345));
        assert_eq!(resolved[1].value, ResolvedValue::Str("180".into()));
    }
}
