//! Compile-time plugin table
//!
//! Every configurable component is picked by the `type` tag of its section.
//! Deserialization itself goes through the tagged config enums; this table
//! lists what exists, for `--plugins` and for checking gun and provider
//! compatibility before anything is built.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginKind {
    Provider,
    Gun,
    Aggregator,
    Schedule,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::Provider => "provider",
            PluginKind::Gun => "gun",
            PluginKind::Aggregator => "aggregator",
            PluginKind::Schedule => "schedule",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Plugin {
    pub kind: PluginKind,
    /// Value of the `type` tag
    pub name: &'static str,
    /// Payload kind emitted (providers) or accepted (guns)
    pub payload: Option<&'static str>,
    pub about: &'static str,
}

const fn plugin(kind: PluginKind, name: &'static str, payload: Option<&'static str>, about: &'static str) -> Plugin {
    Plugin {
        kind,
        name,
        payload,
        about,
    }
}

use PluginKind::*;

pub const PLUGINS: &[Plugin] = &[
    plugin(Provider, "uri", Some("http"), "URI lines with [Header: value] lines"),
    plugin(Provider, "uripost", Some("http"), "<bytes> <uri> [tag] followed by the body"),
    plugin(Provider, "raw", Some("http"), "<bytes> [tag] followed by a raw HTTP request"),
    plugin(Provider, "jsonline", Some("http"), "one JSON request object per line"),
    plugin(Provider, "http/scenario", Some("scenario"), "multi-step scenarios, weighted round robin"),
    plugin(Gun, "http", Some("http"), "HTTP/1.1, HTTPS with ssl: true"),
    plugin(Gun, "http2", Some("http"), "HTTP/2 over TLS, fails warm up without h2"),
    plugin(Gun, "http/scenario", Some("scenario"), "runs scenario steps with variables"),
    plugin(Aggregator, "phout", None, "phantom-compatible TSV"),
    plugin(Aggregator, "log", None, "one log line per sample"),
    plugin(Aggregator, "discard", None, "counts samples and drops them"),
    plugin(Schedule, "once", None, "N tokens at start"),
    plugin(Schedule, "const", None, "constant rate for a duration"),
    plugin(Schedule, "line", None, "linear ramp between two rates"),
    plugin(Schedule, "step", None, "stepped ramp"),
    plugin(Schedule, "instance_step", None, "instance ramp by steps"),
    plugin(Schedule, "instance_const", None, "instance count held for a duration"),
    plugin(Schedule, "unlimited", None, "no rate limit for a duration"),
    plugin(Schedule, "composite", None, "plans run one after another"),
];

/// Registered plugins of one kind, in table order
pub fn plugins(kind: PluginKind) -> impl Iterator<Item = &'static Plugin> {
    PLUGINS.iter().filter(move |p| p.kind == kind)
}

pub fn lookup(kind: PluginKind, name: &str) -> Option<&'static Plugin> {
    plugins(kind).find(|p| p.name == name)
}

/// Whether gun `gun` can fire ammo of `payload_kind`
pub fn gun_accepts(gun: &str, payload_kind: &str) -> bool {
    lookup(Gun, gun).and_then(|p| p.payload) == Some(payload_kind)
}

/// Human readable listing for `--plugins`
pub fn describe() -> String {
    let mut out = String::new();
    for kind in [Provider, Gun, Aggregator, Schedule] {
        out.push_str(&format!("{}:\n", kind));
        for p in plugins(kind) {
            match p.payload {
                Some(payload) => out.push_str(&format!("  {:<16} [{}] {}\n", p.name, payload, p.about)),
                None => out.push_str(&format!("  {:<16} {}\n", p.name, p.about)),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gun::GunConfig;
    use crate::provider::ProviderConfig;

    #[test]
    fn test_gun_compatibility() {
        assert!(gun_accepts("http", "http"));
        assert!(gun_accepts("http2", "http"));
        assert!(gun_accepts("http/scenario", "scenario"));
        assert!(!gun_accepts("http", "scenario"));
        assert!(!gun_accepts("grpc", "http"));
    }

    #[test]
    fn test_table_matches_config_tags() {
        for p in plugins(Gun) {
            let yaml = format!("type: {}\ntarget: localhost:80\n", p.name);
            let cfg: GunConfig = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(cfg.type_name(), p.name);
            let factory = cfg.build().unwrap();
            assert!(factory.accepts(p.payload.unwrap()));
        }
        for p in plugins(Provider) {
            let yaml = format!("type: {}\nfile: ammo\n", p.name);
            let cfg: ProviderConfig = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(cfg.type_name(), p.name);
            assert_eq!(Some(cfg.payload_kind()), p.payload);
        }
    }

    #[test]
    fn test_describe_lists_every_kind() {
        let text = describe();
        assert!(text.contains("provider:\n  uri"));
        assert!(text.contains("schedule:"));
        assert!(text.contains("[scenario]"));
    }
}
