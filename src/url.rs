//! Travel URL parsing
//!
//! URLs have the form `[protocol://][host[:port]/]map[?opt=val]*[#portal]`.
//! Options are case-insensitive on the key; a map change keeps the last
//! URL's options when `?Restart` is given.

use std::fmt;

/// Prefix given to play-in-editor level packages. Stripped client-side
/// when interpreting a server's welcome message.
pub const PLAY_WORLD_PREFIX: &str = "PIE_";

/// How a travel URL is interpreted relative to the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TravelType {
    Relative,
    Absolute,
}

/// A parsed travel URL
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Url {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub map: String,
    pub options: Vec<String>,
    pub portal: String,
}

impl Url {
    pub fn parse(input: &str) -> Option<Url> {
        let mut url = Url::default();
        let mut rest = input.trim();
        if rest.is_empty() {
            return None;
        }

        if let Some(idx) = rest.find("://") {
            url.protocol = rest[..idx].to_string();
            rest = &rest[idx + 3..];
            // host[:port]/map
            let (authority, path) = match rest.find('/') {
                Some(slash) => (&rest[..slash], &rest[slash + 1..]),
                None => (rest, ""),
            };
            match authority.rsplit_once(':') {
                Some((host, port)) => {
                    url.host = host.to_string();
                    url.port = port.parse().ok();
                }
                None => url.host = authority.to_string(),
            }
            rest = path;
        }

        if let Some(idx) = rest.find('#') {
            url.portal = rest[idx + 1..].to_string();
            rest = &rest[..idx];
        }

        let mut parts = rest.split('?');
        url.map = parts.next().unwrap_or("").to_string();
        for opt in parts {
            if !opt.is_empty() {
                url.options.push(opt.to_string());
            }
        }
        Some(url)
    }

    /// Look up an option value by key. `?Listen` matches with an empty
    /// value, `?game=Foo` yields `Foo`.
    pub fn option(&self, key: &str) -> Option<&str> {
        let key_lower = key.to_ascii_lowercase();
        for opt in &self.options {
            let (name, value) = match opt.split_once('=') {
                Some((name, value)) => (name, value),
                None => (opt.as_str(), ""),
            };
            if name.to_ascii_lowercase() == key_lower {
                return Some(value);
            }
        }
        None
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.option(key).is_some()
    }

    /// All options joined back into `?a?b=c` form, as handed to game code
    pub fn options_string(&self) -> String {
        let mut out = String::new();
        for opt in &self.options {
            out.push('?');
            out.push_str(opt);
        }
        out
    }

    /// Replace or insert an option, used when coalescing travel requests
    pub fn set_option(&mut self, opt: &str) {
        let key = opt.split('=').next().unwrap_or(opt).to_ascii_lowercase();
        self.options
            .retain(|existing| existing.split('=').next().unwrap_or(existing).to_ascii_lowercase() != key);
        self.options.push(opt.to_string());
    }

    /// Strip a play-in-editor prefix from a server-sent map name
    pub fn strip_play_world_prefix(map: &str) -> &str {
        map.strip_prefix(PLAY_WORLD_PREFIX).unwrap_or(map)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            if !self.protocol.is_empty() {
                write!(f, "{}://", self.protocol)?;
            }
            write!(f, "{}", self.host)?;
            if let Some(port) = self.port {
                write!(f, ":{}", port)?;
            }
            write!(f, "/")?;
        }
        write!(f, "{}", self.map)?;
        for opt in &self.options {
            write!(f, "?{}", opt)?;
        }
        if !self.portal.is_empty() {
            write!(f, "#{}", self.portal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_map() {
        let url = Url::parse("EntryMap").expect("parse failed");
        assert_eq!(url.map, "EntryMap");
        assert!(url.options.is_empty());
        assert!(url.host.is_empty());
    }

    #[test]
    fn test_parse_full_url() {
        let url = Url::parse("unreal://10.0.0.2:7777/DM-Foo?game=MyGame.Arena?Listen#spawn")
            .expect("parse failed");
        assert_eq!(url.protocol, "unreal");
        assert_eq!(url.host, "10.0.0.2");
        assert_eq!(url.port, Some(7777));
        assert_eq!(url.map, "DM-Foo");
        assert_eq!(url.option("game"), Some("MyGame.Arena"));
        assert!(url.has_option("Listen"));
        assert_eq!(url.portal, "spawn");
    }

    #[test]
    fn test_option_lookup_is_case_insensitive() {
        let url = Url::parse("/Map?Name=Alice").expect("parse failed");
        assert_eq!(url.option("name"), Some("Alice"));
        assert_eq!(url.option("NAME"), Some("Alice"));
        assert!(!url.has_option("game"));
    }

    #[test]
    fn test_set_option_replaces() {
        let mut url = Url::parse("Map?game=A").expect("parse failed");
        url.set_option("game=B");
        assert_eq!(url.option("game"), Some("B"));
        assert_eq!(url.options.len(), 1);
    }

    #[test]
    fn test_roundtrip_display() {
        let text = "DM-Foo?Name=Alice?Listen";
        let url = Url::parse(text).expect("parse failed");
        assert_eq!(url.to_string(), text);
    }

    #[test]
    fn test_strip_play_world_prefix() {
        assert_eq!(Url::strip_play_world_prefix("PIE_DM-Foo"), "DM-Foo");
        assert_eq!(Url::strip_play_world_prefix("DM-Foo"), "DM-Foo");
    }
}
