//! Command formatting and reply parsing for the generator's ASCII protocol.
//!
//! Commands are `MNEMONIC:arg1,arg2,...` followed by the session terminator
//! (`HV:1\n`, `TP:3,01,30,00\n`, `CL\n`). Query replies are a `*` marker followed
//! by a fixed-width, zero-padded decimal field (`*0000017000\n`) or by free text
//! for string-valued fields (`*Co\n`).
//!
//! Every field of the instrument is described by an [`Alias`], the four-field
//! template `write;write_reply;read;read_reply;` used by the instrument's
//! documentation:
//!
//! ```text
//! SC:{value};;;;           write-only, `{value}` filled in from typed setpoints
//! ;;CN;*{value:d};         query CN, reply is `*` + integer field
//! ;;MR;*{value};           query MR, reply is `*` + text field
//! ```
//!
//! Numeric replies are validated digit by digit and checked against the expected
//! width, so a truncated read (`*00170\n`) is a format error rather than a
//! silently wrong value.

use crate::error::{FormatErrorKind, XrayError, XrayResult};
use std::collections::HashMap;
use std::fmt;
use strfmt::strfmt;

/// Leading marker of every query reply.
pub const REPLY_MARKER: char = '*';

/// Number of digits in a numeric reply (`*0000017000`).
pub const DEFAULT_REPLY_WIDTH: usize = 10;

/// A single outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    mnemonic: String,
    args: Vec<String>,
}

impl Command {
    /// Create a command without arguments.
    pub fn new(mnemonic: impl Into<String>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            args: Vec::new(),
        }
    }

    /// Append an already formatted argument token.
    pub fn arg(mut self, token: impl fmt::Display) -> Self {
        self.args.push(token.to_string());
        self
    }

    /// Parse rendered command text such as `TP:3,01,30,00`.
    pub fn parse(text: &str) -> XrayResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(XrayError::Template("empty command".to_string()));
        }

        match text.split_once(':') {
            Some((mnemonic, rest)) => Ok(Self {
                mnemonic: mnemonic.to_string(),
                args: rest.split(',').map(str::to_string).collect(),
            }),
            None => Ok(Self::new(text)),
        }
    }

    /// Command name, e.g. `SR` in `SR:12`.
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Comma-separated arguments after the colon, as sent.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Bytes to put on the wire.
    pub fn encode(&self, terminator: &str) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.extend_from_slice(terminator.as_bytes());
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{}:{}", self.mnemonic, self.args.join(","))
        }
    }
}

/// Type of the field extracted from a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `{name:d}` - fixed-width signed decimal.
    Int,
    /// `{name}` - free text up to the terminator.
    Text,
}

/// A parsed reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    /// Value of a `{name:d}` field.
    Int(i32),
    /// Value of a `{name}` field, marker and terminator stripped.
    Text(String),
}

impl ReplyValue {
    /// `None` for text replies.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            ReplyValue::Int(v) => Some(*v),
            ReplyValue::Text(_) => None,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            ReplyValue::Int(v) => v.to_string(),
            ReplyValue::Text(s) => s,
        }
    }
}

/// Reply layout such as `*{value:d}`: a literal prefix and one typed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTemplate {
    prefix: String,
    field: String,
    kind: FieldKind,
}

impl ReplyTemplate {
    pub fn parse(template: &str) -> XrayResult<Self> {
        let open = template
            .find('{')
            .ok_or_else(|| XrayError::Template(format!("no field in reply '{}'", template)))?;
        let close = template[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| XrayError::Template(format!("unclosed field in '{}'", template)))?;
        if close + 1 != template.len() {
            return Err(XrayError::Template(format!(
                "trailing text after field in '{}'",
                template
            )));
        }

        let inner = &template[open + 1..close];
        let (field, kind) = match inner.split_once(':') {
            Some((name, "d")) => (name, FieldKind::Int),
            Some((_, spec)) => {
                return Err(XrayError::Template(format!(
                    "unsupported field type '{}' in '{}'",
                    spec, template
                )))
            }
            None => (inner, FieldKind::Text),
        };

        Ok(Self {
            prefix: template[..open].to_string(),
            field: field.to_string(),
            kind,
        })
    }

    /// Name of the captured field.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Validate `raw` against this template and extract the field.
    pub fn parse_reply(&self, raw: &[u8], width: usize, terminator: &str) -> XrayResult<ReplyValue> {
        let body = strip_terminator(raw, terminator)?;
        let payload = body.strip_prefix(self.prefix.as_bytes()).ok_or_else(|| {
            let marker = self.prefix.chars().next().unwrap_or(REPLY_MARKER);
            XrayError::format(FormatErrorKind::MissingMarker(marker), raw)
        })?;

        match self.kind {
            FieldKind::Int => parse_digits(payload, width, raw).map(ReplyValue::Int),
            FieldKind::Text => std::str::from_utf8(payload)
                .map(|s| ReplyValue::Text(s.to_string()))
                .map_err(|_| XrayError::format(FormatErrorKind::NotText, raw)),
        }
    }
}

/// The four-field command/reply template of one instrument field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    write: Option<String>,
    write_reply: Option<ReplyTemplate>,
    read: Option<Command>,
    read_reply: Option<ReplyTemplate>,
}

impl Alias {
    /// Parse `write;write_reply;read;read_reply;` (trailing separators optional
    /// beyond the fourth field).
    pub fn parse(alias: &str) -> XrayResult<Self> {
        let fields: Vec<&str> = alias.split(';').collect();
        if fields.len() < 4 {
            return Err(XrayError::Template(format!(
                "alias '{}' has {} fields, expected 4",
                alias,
                fields.len()
            )));
        }

        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };

        Ok(Self {
            write: non_empty(fields[0]),
            write_reply: non_empty(fields[1])
                .map(|t| ReplyTemplate::parse(&t))
                .transpose()?,
            read: non_empty(fields[2]).map(|t| Command::parse(&t)).transpose()?,
            read_reply: non_empty(fields[3])
                .map(|t| ReplyTemplate::parse(&t))
                .transpose()?,
        })
    }

    /// Render the write command, substituting `{name}` placeholders from `vars`.
    pub fn write_command(&self, vars: &HashMap<String, String>) -> XrayResult<Command> {
        let template = self
            .write
            .as_ref()
            .ok_or_else(|| XrayError::Template("alias has no write command".to_string()))?;
        let text = strfmt(template, vars).map_err(|e| XrayError::Template(e.to_string()))?;
        Command::parse(&text)
    }

    /// Reply expected after the write command, if any.
    pub fn write_reply(&self) -> Option<&ReplyTemplate> {
        self.write_reply.as_ref()
    }

    pub fn read_command(&self) -> XrayResult<&Command> {
        self.read
            .as_ref()
            .ok_or_else(|| XrayError::Template("alias has no read command".to_string()))
    }

    pub fn read_reply(&self) -> XrayResult<&ReplyTemplate> {
        self.read_reply
            .as_ref()
            .ok_or_else(|| XrayError::Template("alias has no read reply".to_string()))
    }
}

/// Zero-pad a setpoint to the two digits the instrument expects (`05`, not `5`).
pub fn format_setpoint(value: i32) -> String {
    format!("{:02}", value)
}

/// Build the variable map for [`Alias::write_command`].
pub fn template_vars<I, K>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, String)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Parse a `*`-marked fixed-width integer reply.
pub fn parse_int(raw: &[u8], width: usize, terminator: &str) -> XrayResult<i32> {
    let body = strip_terminator(raw, terminator)?;
    let payload = strip_marker(body, raw)?;
    parse_digits(payload, width, raw)
}

/// Parse a `*`-marked text reply.
pub fn parse_text(raw: &[u8], terminator: &str) -> XrayResult<String> {
    let body = strip_terminator(raw, terminator)?;
    let payload = strip_marker(body, raw)?;
    std::str::from_utf8(payload)
        .map(str::to_string)
        .map_err(|_| XrayError::format(FormatErrorKind::NotText, raw))
}

fn strip_terminator<'a>(raw: &'a [u8], terminator: &str) -> XrayResult<&'a [u8]> {
    if terminator.is_empty() {
        return Ok(raw);
    }
    raw.strip_suffix(terminator.as_bytes())
        .ok_or_else(|| XrayError::format(FormatErrorKind::MissingTerminator, raw))
}

fn strip_marker<'a>(body: &'a [u8], raw: &[u8]) -> XrayResult<&'a [u8]> {
    body.strip_prefix(&[REPLY_MARKER as u8])
        .ok_or_else(|| XrayError::format(FormatErrorKind::MissingMarker(REPLY_MARKER), raw))
}

fn parse_digits(payload: &[u8], width: usize, raw: &[u8]) -> XrayResult<i32> {
    let (negative, digits) = match payload.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, payload),
    };

    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(XrayError::format(FormatErrorKind::NotNumeric, raw));
    }
    if digits.len() != width {
        return Err(XrayError::format(
            FormatErrorKind::WrongWidth {
                expected: width,
                actual: digits.len(),
            },
            raw,
        ));
    }

    let magnitude = digits.iter().try_fold(0i64, |acc, d| {
        acc.checked_mul(10)?.checked_add(i64::from(d - b'0'))
    });
    let value = magnitude
        .map(|m| if negative { -m } else { m })
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| XrayError::format(FormatErrorKind::Overflow, raw))?;

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: XrayError) -> FormatErrorKind {
        match err {
            XrayError::Format { reason, .. } => reason,
            other => panic!("expected format error, got {:?}", other),
        }
    }

    #[test]
    fn test_command_rendering() {
        assert_eq!(Command::new("HV").arg(1).to_string(), "HV:1");
        assert_eq!(Command::new("CL").to_string(), "CL");
        assert_eq!(
            Command::new("TP").arg(3).arg("01").arg("30").arg("00").encode("\n"),
            b"TP:3,01,30,00\n".to_vec()
        );
    }

    #[test]
    fn test_command_parse_keeps_colons_in_arguments() {
        let cmd = Command::parse("SW:14:181").unwrap();
        assert_eq!(cmd.mnemonic(), "SW");
        assert_eq!(cmd.to_string(), "SW:14:181");

        let cmd = Command::parse("TP:3,01,02,03").unwrap();
        assert_eq!(cmd.args(), &["3", "01", "02", "03"]);
        assert!(Command::parse("  ").is_err());
    }

    #[test]
    fn test_write_alias() {
        let alias = Alias::parse("SC:{value};;;;").unwrap();
        let vars = template_vars([("value", format_setpoint(5))]);
        let cmd = alias.write_command(&vars).unwrap();
        assert_eq!(cmd.encode("\n"), b"SC:05\n".to_vec());
        assert!(alias.read_command().is_err());
    }

    #[test]
    fn test_write_alias_missing_variable() {
        let alias = Alias::parse("WU:{time},{voltage};;;;").unwrap();
        let vars = template_vars([("time", "1".to_string())]);
        assert!(matches!(
            alias.write_command(&vars),
            Err(XrayError::Template(_))
        ));
    }

    #[test]
    fn test_query_alias() {
        let alias = Alias::parse(";;CN;*{value:d};").unwrap();
        assert_eq!(alias.read_command().unwrap().to_string(), "CN");
        let reply = alias.read_reply().unwrap();
        assert_eq!(reply.kind(), FieldKind::Int);
        assert_eq!(reply.field(), "value");
        assert_eq!(
            reply.parse_reply(b"*0000005000\n", 10, "\n").unwrap(),
            ReplyValue::Int(5000)
        );

        let alias = Alias::parse(";;TN:3;*{value:d};").unwrap();
        assert_eq!(alias.read_command().unwrap().to_string(), "TN:3");
    }

    #[test]
    fn test_text_alias() {
        let alias = Alias::parse(";;FR;*{value};").unwrap();
        let value = alias
            .read_reply()
            .unwrap()
            .parse_reply(b"*0.15 x 8 mm\n", 10, "\n")
            .unwrap();
        assert_eq!(value.into_text(), "0.15 x 8 mm");
    }

    #[test]
    fn test_malformed_alias() {
        assert!(Alias::parse("SC:{value}").is_err());
        assert!(Alias::parse(";;CN;*{value:x};").is_err());
        assert!(Alias::parse(";;CN;*{value;").is_err());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(b"*0000017000\n", 10, "\n").unwrap(), 17000);
        assert_eq!(parse_int(b"*0000000000\n", 10, "\n").unwrap(), 0);
        assert_eq!(parse_int(b"*-000000005\n", 9, "\n").unwrap(), -5);
        assert_eq!(parse_int(b"*+0000000005\n", 10, "\n").unwrap(), 5);
        assert_eq!(parse_int(b"*0000000076\r\n", 10, "\r\n").unwrap(), 76);
    }

    #[test]
    fn test_parse_int_rejects_truncated_reply() {
        let err = parse_int(b"*00170\n", 10, "\n").unwrap_err();
        assert_eq!(
            reason(err),
            FormatErrorKind::WrongWidth {
                expected: 10,
                actual: 5
            }
        );
    }

    #[test]
    fn test_parse_int_rejects_bad_framing() {
        assert_eq!(
            reason(parse_int(b"0000017000\n", 10, "\n").unwrap_err()),
            FormatErrorKind::MissingMarker('*')
        );
        assert_eq!(
            reason(parse_int(b"*0000017000", 10, "\n").unwrap_err()),
            FormatErrorKind::MissingTerminator
        );
        assert_eq!(
            reason(parse_int(b"*00000170x0\n", 10, "\n").unwrap_err()),
            FormatErrorKind::NotNumeric
        );
        assert_eq!(
            reason(parse_int(b"*9999999999\n", 10, "\n").unwrap_err()),
            FormatErrorKind::Overflow
        );
        assert_eq!(
            reason(parse_int(b"*\n", 10, "\n").unwrap_err()),
            FormatErrorKind::WrongWidth {
                expected: 10,
                actual: 0
            }
        );
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(parse_text(b"*Co\n", "\n").unwrap(), "Co");
        assert_eq!(parse_text(b"*\n", "\n").unwrap(), "");
        assert_eq!(
            reason(parse_text(b"*\xff\xfe\n", "\n").unwrap_err()),
            FormatErrorKind::NotText
        );
    }

    #[test]
    fn test_current_setpoint_round_trip() {
        let write = Alias::parse("SC:{value};;;;").unwrap();
        let read = Alias::parse(";;CN;*{value:d};").unwrap();
        for ma in 0..=80 {
            let cmd = write
                .write_command(&template_vars([("value", format_setpoint(ma))]))
                .unwrap();
            // The instrument echoes the setpoint in µA.
            let echoed: i32 = cmd.args()[0].parse::<i32>().unwrap() * 1000;
            let reply = format!("*{:010}\n", echoed);
            let wire = read
                .read_reply()
                .unwrap()
                .parse_reply(reply.as_bytes(), 10, "\n")
                .unwrap()
                .as_int()
                .unwrap();
            assert_eq!(crate::protocol::units::micro_to_milli(wire), ma);
        }
    }
}
