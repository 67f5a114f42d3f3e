//! IRC wire protocol types.
//!
//! A raw line is parsed into a [`Message`]: optional IRCv3 tags, an optional
//! prefix, a verb (textual command or three-digit numeric) and a parameter
//! list. Parsing is lenient about anything past the structural level: a
//! syntactically valid line with an unknown verb still parses, and is left
//! to the command registry to resolve.

pub mod line;

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// A protocol verb, normalized into a single keyspace.
///
/// Textual commands are stored uppercased; three-digit numeric replies keep
/// their numeric value and render zero-padded, so `Verb::from(1)` and the
/// parsed `"001"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    Named(String),
    Numeric(u16),
}

impl Verb {
    pub fn parse(s: &str) -> Verb {
        if s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()) {
            // Length-checked, all digits: cannot overflow u16.
            Verb::Numeric(s.parse().unwrap_or(0))
        } else {
            Verb::Named(s.to_ascii_uppercase())
        }
    }

    pub fn as_numeric(&self) -> Option<u16> {
        match self {
            Verb::Numeric(n) => Some(*n),
            Verb::Named(_) => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Named(s) => f.write_str(s),
            Verb::Numeric(n) => write!(f, "{n:03}"),
        }
    }
}

impl From<&str> for Verb {
    fn from(s: &str) -> Verb {
        Verb::parse(s)
    }
}

impl From<u16> for Verb {
    fn from(n: u16) -> Verb {
        Verb::Numeric(n)
    }
}

/// Message source: a server name or a user mask (`nick[!user][@host]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    ServerName(String),
    Nickname {
        nick: String,
        user: Option<String>,
        host: Option<String>,
    },
}

impl Prefix {
    /// Parse the prefix body (without the leading `:`).
    ///
    /// A prefix with no `!`/`@` separators that contains a dot is taken to
    /// be a server name; everything else is a user mask.
    pub fn parse(s: &str) -> Prefix {
        if !s.contains('!') && !s.contains('@') && s.contains('.') {
            return Prefix::ServerName(s.to_owned());
        }
        let (rest, host) = match s.split_once('@') {
            Some((r, h)) => (r, Some(h.to_owned())),
            None => (s, None),
        };
        let (nick, user) = match rest.split_once('!') {
            Some((n, u)) => (n.to_owned(), Some(u.to_owned())),
            None => (rest.to_owned(), None),
        };
        Prefix::Nickname { nick, user, host }
    }

    /// Prefix consisting of a bare nickname.
    pub fn nick(nick: impl Into<String>) -> Prefix {
        Prefix::Nickname {
            nick: nick.into(),
            user: None,
            host: None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(s) => f.write_str(s),
            Prefix::Nickname { nick, user, host } => {
                f.write_str(nick)?;
                if let Some(user) = user {
                    write!(f, "!{user}")?;
                }
                if let Some(host) = host {
                    write!(f, "@{host}")?;
                }
                Ok(())
            }
        }
    }
}

/// A single IRCv3 message tag (key and optional unescaped value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// Unescape an IRCv3 tag value per the message-tags spec.
fn unescape_tag_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            // Unknown escape: the backslash is dropped.
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn parse_tags(s: &str) -> Vec<Tag> {
    s.split(';')
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once('=') {
            Some((k, v)) => Tag(k.to_owned(), Some(unescape_tag_value(v))),
            None => Tag(t.to_owned(), None),
        })
        .collect()
}

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<Prefix>,
    pub verb: Verb,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(verb: impl Into<Verb>, params: Vec<String>) -> Message {
        Message {
            tags: Vec::new(),
            prefix: None,
            verb: verb.into(),
            params,
        }
    }

    /// Convenience constructor from string slices.
    pub fn cmd(verb: &str, params: &[&str]) -> Message {
        Message::new(verb, params.iter().map(|p| (*p).to_owned()).collect())
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Positional parameter, or a malformed-input error naming the verb.
    pub fn require(&self, index: usize) -> Result<&str, ProtocolError> {
        self.param(index).ok_or_else(|| ProtocolError::MissingParam {
            verb: self.verb.to_string(),
            index,
        })
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.0 == key)
            .and_then(|t| t.1.as_deref())
    }

    /// Sender nick if the prefix is a user mask.
    pub fn sender_nick(&self) -> Option<&str> {
        match &self.prefix {
            Some(Prefix::Nickname { nick, .. }) => Some(nick),
            _ => None,
        }
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, ProtocolError> {
        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let mut tags = Vec::new();
        if let Some(body) = rest.strip_prefix('@') {
            let (raw_tags, after) = body
                .split_once(' ')
                .ok_or_else(|| ProtocolError::Malformed(s.to_owned()))?;
            tags = parse_tags(raw_tags);
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(body) = rest.strip_prefix(':') {
            let (raw_prefix, after) = body
                .split_once(' ')
                .ok_or_else(|| ProtocolError::Malformed(s.to_owned()))?;
            prefix = Some(Prefix::parse(raw_prefix));
            rest = after.trim_start_matches(' ');
        }

        let mut params = Vec::new();
        let mut verb = None;
        let mut cursor = rest;
        while !cursor.is_empty() {
            if verb.is_some() {
                if let Some(trailing) = cursor.strip_prefix(':') {
                    params.push(trailing.to_owned());
                    break;
                }
            }
            let (word, after) = match cursor.split_once(' ') {
                Some((w, a)) => (w, a.trim_start_matches(' ')),
                None => (cursor, ""),
            };
            if verb.is_none() {
                verb = Some(Verb::parse(word));
            } else {
                params.push(word.to_owned());
            }
            cursor = after;
        }

        let verb = verb.ok_or_else(|| ProtocolError::Malformed(s.to_owned()))?;
        Ok(Message {
            tags,
            prefix,
            verb,
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, Tag(key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(key)?;
                if let Some(value) = value {
                    write!(f, "={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.verb)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_ping() {
        let msg: Message = "PING :irc.example.net\r\n".parse().unwrap();
        assert_eq!(msg.verb, Verb::Named("PING".into()));
        assert_eq!(msg.param(0), Some("irc.example.net"));
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg: Message = ":alice!ally@host.example PRIVMSG #chat :hello there"
            .parse()
            .unwrap();
        assert_eq!(msg.sender_nick(), Some("alice"));
        assert_eq!(msg.param(0), Some("#chat"));
        assert_eq!(msg.param(1), Some("hello there"));
    }

    #[test]
    fn parse_numeric_normalizes() {
        let msg: Message = ":irc.example.net 001 alice :Welcome".parse().unwrap();
        assert_eq!(msg.verb, Verb::Numeric(1));
        assert_eq!(msg.verb.to_string(), "001");
        assert!(matches!(msg.prefix, Some(Prefix::ServerName(_))));
    }

    #[test]
    fn parse_tags_unescapes() {
        let msg: Message = "@time=2024-01-01T00:00:00Z;key=a\\sb\\:c PING :x"
            .parse()
            .unwrap();
        assert_eq!(msg.tag_value("time"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(msg.tag_value("key"), Some("a b;c"));
    }

    #[test]
    fn parse_empty_line_rejected() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
    }

    #[test]
    fn parse_prefix_only_rejected() {
        assert!(":irc.example.net".parse::<Message>().is_err());
    }

    #[test]
    fn missing_param_reports_verb() {
        let msg: Message = "KICK #chat".parse().unwrap();
        match msg.require(1) {
            Err(ProtocolError::MissingParam { verb, index }) => {
                assert_eq!(verb, "KICK");
                assert_eq!(index, 1);
            }
            other => panic!("expected MissingParam, got {other:?}"),
        }
    }

    #[test]
    fn display_round_trip() {
        let raw = ":alice!a@h PRIVMSG #chat :hello world";
        let msg: Message = raw.parse().unwrap();
        assert_eq!(msg.to_string(), raw);
    }

    #[test]
    fn display_escapes_tags() {
        let msg = Message {
            tags: vec![Tag("k".into(), Some("a b;c".into()))],
            prefix: None,
            verb: Verb::Named("PING".into()),
            params: vec!["x".into()],
        };
        assert_eq!(msg.to_string(), "@k=a\\sb\\:c PING x");
    }

    #[test]
    fn verb_keyspace_is_unified() {
        assert_eq!(Verb::parse("353"), Verb::from(353));
        assert_eq!(Verb::parse("join"), Verb::Named("JOIN".into()));
        // Four digits is a command name, not a numeric.
        assert_eq!(Verb::parse("1234"), Verb::Named("1234".into()));
    }
}
