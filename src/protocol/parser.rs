//! IIOD Command Parser
//!
//! This module turns one request line into a [`Command`].
//!
//! ## Design
//!
//! 1. **Pure**: No I/O, no connection state. The caller strips the line
//!    terminator and hands over the text.
//! 2. **Positional**: After the command name, tokens are interpreted by
//!    position according to the command kind.
//! 3. **Client-visible errors**: A [`ParseError`] never tears down the
//!    connection. The state machine converts it to a negative numeric
//!    response with [`ParseError::code`].
//!
//! ## Numbers
//!
//! Numeric tokens follow `strtoul` rules: leading digits in the field's
//! base are consumed and anything after them is ignored, so `400abc`
//! parses as 400. A token with no leading digit is an error, except that a
//! hex field holding only a `0x` prefix reads as 0.

use crate::ops::errno;
use crate::protocol::command::{AttrTarget, Command, CommandKind};
use std::str::SplitAsciiWhitespace;
use thiserror::Error;

/// Errors that can occur while parsing a request line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line contained no tokens
    #[error("empty command")]
    EmptyCommand,

    /// The line is not valid UTF-8
    #[error("invalid UTF-8 in command line")]
    InvalidUtf8,

    /// The first token is not a known command
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A required argument is absent
    #[error("{command}: missing {field}")]
    MissingArgument {
        command: &'static str,
        field: &'static str,
    },

    /// A numeric argument did not convert
    #[error("{command}: invalid {field}: {token:?}")]
    InvalidNumber {
        command: &'static str,
        field: &'static str,
        token: String,
    },

    /// Tokens left over after the last expected argument
    #[error("{command}: unexpected argument {token:?}")]
    UnexpectedArgument {
        command: &'static str,
        token: String,
    },
}

impl ParseError {
    /// Returns the negative errno sent to the client for this error.
    pub fn code(&self) -> isize {
        -errno::EINVAL
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Command names in match priority order.
///
/// Names that share a prefix are listed longest first, so `READBUF` is
/// tried before `READ`.
const COMMANDS: &[(&str, CommandKind)] = &[
    ("READBUF", CommandKind::ReadBuf),
    ("WRITEBUF", CommandKind::WriteBuf),
    ("GETTRIG", CommandKind::GetTrig),
    ("SETTRIG", CommandKind::SetTrig),
    ("VERSION", CommandKind::Version),
    ("TIMEOUT", CommandKind::Timeout),
    ("BINARY", CommandKind::Binary),
    ("PRINT", CommandKind::Print),
    ("CLOSE", CommandKind::Close),
    ("WRITE", CommandKind::Write),
    ("READ", CommandKind::Read),
    ("OPEN", CommandKind::Open),
    ("HELP", CommandKind::Help),
    ("EXIT", CommandKind::Exit),
    ("SET", CommandKind::Set),
];

/// Looks up a command name in the fixed table.
pub fn lookup_command(name: &str) -> Option<CommandKind> {
    COMMANDS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, kind)| *kind)
}

/// Parses a request line given as raw bytes.
pub fn parse_command_bytes(line: &[u8]) -> ParseResult<Command> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;
    parse_command(line)
}

/// Parses a request line (without its terminator) into a [`Command`].
///
/// # Example
///
/// ```
/// use nbiiod::protocol::{parse_command, CommandKind};
///
/// let cmd = parse_command("OPEN dev0 100 3").unwrap();
/// assert_eq!(cmd.kind, CommandKind::Open);
/// assert_eq!(cmd.sample_count, 100);
/// assert_eq!(cmd.mask, 0x3);
/// ```
pub fn parse_command(line: &str) -> ParseResult<Command> {
    let mut tokens = Tokens::new(line);

    let name = tokens.next().ok_or(ParseError::EmptyCommand)?;
    let kind = lookup_command(name).ok_or_else(|| ParseError::UnknownCommand(name.to_string()))?;
    tokens.command = kind.name();

    let mut cmd = Command::new(kind);

    match kind {
        CommandKind::Help
        | CommandKind::Exit
        | CommandKind::Print
        | CommandKind::Version
        | CommandKind::Binary => {}

        CommandKind::Timeout => {
            cmd.timeout_ms = tokens.number("timeout", 10)?;
        }

        CommandKind::Open => {
            cmd.device = tokens.device()?;
            cmd.sample_count = tokens.number("sample count", 10)?;
            cmd.mask = tokens.number("channel mask", 16)?;
            if let Some(flag) = tokens.next() {
                if flag != "CYCLIC" {
                    return Err(tokens.unexpected(flag));
                }
                cmd.cyclic = true;
            }
        }

        CommandKind::Close | CommandKind::GetTrig => {
            cmd.device = tokens.device()?;
        }

        CommandKind::Read => {
            cmd.device = tokens.device()?;
            cmd.target = tokens.target()?;
            cmd.attr = tokens.next().map(str::to_string);
        }

        CommandKind::Write => {
            cmd.device = tokens.device()?;
            cmd.target = tokens.target()?;
            // The byte count is always the last token; an attribute name
            // may precede it.
            let first = tokens.required("byte count")?;
            match tokens.next() {
                Some(count) => {
                    cmd.attr = Some(first.to_string());
                    cmd.bytes_count = tokens.convert("byte count", count, 10)?;
                }
                None => {
                    cmd.bytes_count = tokens.convert("byte count", first, 10)?;
                }
            }
        }

        CommandKind::ReadBuf | CommandKind::WriteBuf => {
            cmd.device = tokens.device()?;
            cmd.bytes_count = tokens.number("byte count", 10)?;
        }

        CommandKind::SetTrig => {
            cmd.device = tokens.device()?;
            cmd.trigger = tokens.next().map(str::to_string);
        }

        CommandKind::Set => {
            cmd.device = tokens.device()?;
            let key = tokens.required("BUFFERS_COUNT")?;
            if key != "BUFFERS_COUNT" {
                return Err(tokens.unexpected(key));
            }
            cmd.buffers_count = tokens.number("buffers count", 10)?;
        }
    }

    tokens.finish()?;
    Ok(cmd)
}

/// Tokenizer cursor over one request line.
struct Tokens<'a> {
    inner: SplitAsciiWhitespace<'a>,
    command: &'static str,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            inner: line.split_ascii_whitespace(),
            command: "",
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    fn required(&mut self, field: &'static str) -> ParseResult<&'a str> {
        self.next().ok_or(ParseError::MissingArgument {
            command: self.command,
            field,
        })
    }

    fn device(&mut self) -> ParseResult<String> {
        self.required("device").map(str::to_string)
    }

    fn number<T: TryFrom<u64>>(&mut self, field: &'static str, radix: u32) -> ParseResult<T> {
        let token = self.required(field)?;
        self.convert(field, token, radix)
    }

    fn convert<T: TryFrom<u64>>(
        &self,
        field: &'static str,
        token: &str,
        radix: u32,
    ) -> ParseResult<T> {
        parse_uint(token, radix)
            .and_then(|n| T::try_from(n).ok())
            .ok_or_else(|| ParseError::InvalidNumber {
                command: self.command,
                field,
                token: token.to_string(),
            })
    }

    /// Consumes an optional `DEBUG`, `BUFFER`, `INPUT <ch>` or `OUTPUT <ch>`.
    fn target(&mut self) -> ParseResult<AttrTarget> {
        let mut peek = self.inner.clone();
        let target = match peek.next() {
            Some("DEBUG") => AttrTarget::Debug,
            Some("BUFFER") => AttrTarget::Buffer,
            Some(dir @ ("INPUT" | "OUTPUT")) => {
                self.inner = peek;
                let id = self.required("channel")?;
                return Ok(AttrTarget::Channel {
                    id: id.to_string(),
                    output: dir == "OUTPUT",
                });
            }
            _ => return Ok(AttrTarget::Device),
        };
        self.inner = peek;
        Ok(target)
    }

    fn unexpected(&self, token: &str) -> ParseError {
        ParseError::UnexpectedArgument {
            command: self.command,
            token: token.to_string(),
        }
    }

    fn finish(mut self) -> ParseResult<()> {
        match self.next() {
            Some(token) => Err(self.unexpected(token)),
            None => Ok(()),
        }
    }
}

/// Converts the leading digits of `token` in the given base.
///
/// Returns None if no digit was consumed or the value overflows.
fn parse_uint(token: &str, radix: u32) -> Option<u64> {
    let digits = if radix == 16 {
        token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token)
    } else {
        token
    };

    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(i, _)| i)
        .unwrap_or(digits.len());

    if end == 0 {
        // strtoul reads a dangling "0x" as the digit 0
        return (digits.len() < token.len()).then_some(0);
    }

    u64::from_str_radix(&digits[..end], radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_no_argument_commands() {
        for (line, kind) in [
            ("HELP", CommandKind::Help),
            ("EXIT", CommandKind::Exit),
            ("PRINT", CommandKind::Print),
            ("VERSION", CommandKind::Version),
            ("BINARY", CommandKind::Binary),
        ] {
            let cmd = parse_command(line).unwrap();
            assert_eq!(cmd.kind, kind);
            assert!(cmd.device.is_empty());
        }
    }

    #[test]
    fn test_parse_open() {
        let cmd = parse_command("OPEN dev0 100 3").unwrap();
        assert_eq!(cmd.kind, CommandKind::Open);
        assert_eq!(cmd.device, "dev0");
        assert_eq!(cmd.sample_count, 100);
        assert_eq!(cmd.mask, 3);
        assert!(!cmd.cyclic);
    }

    #[test]
    fn test_parse_open_cyclic_hex_mask() {
        let cmd = parse_command("OPEN iio:device1 4096 0000000f CYCLIC").unwrap();
        assert_eq!(cmd.device, "iio:device1");
        assert_eq!(cmd.mask, 0xf);
        assert!(cmd.cyclic);

        let cmd = parse_command("OPEN dev0 1 0xFF").unwrap();
        assert_eq!(cmd.mask, 0xff);
    }

    #[test]
    fn test_parse_open_bare_hex_prefix() {
        assert_eq!(parse_command("OPEN dev0 1 0x").unwrap().mask, 0);
        assert_eq!(parse_command("OPEN dev0 1 0xg").unwrap().mask, 0);
        assert!(parse_command("OPEN dev0 1 xg").is_err());
    }

    #[test]
    fn test_parse_open_bad_flag() {
        let err = parse_command("OPEN dev0 100 3 LOOP").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedArgument { .. }));
    }

    #[test]
    fn test_parse_read_channel_attr() {
        let cmd = parse_command("READ dev0 INPUT voltage0 raw").unwrap();
        assert_eq!(cmd.kind, CommandKind::Read);
        assert_eq!(cmd.target, AttrTarget::input("voltage0"));
        assert_eq!(cmd.attr.as_deref(), Some("raw"));
    }

    #[test]
    fn test_parse_read_variants() {
        let cmd = parse_command("READ dev0").unwrap();
        assert_eq!(cmd.target, AttrTarget::Device);
        assert!(cmd.attr.is_none());

        let cmd = parse_command("READ dev0 sampling_frequency").unwrap();
        assert_eq!(cmd.target, AttrTarget::Device);
        assert_eq!(cmd.attr.as_deref(), Some("sampling_frequency"));

        let cmd = parse_command("READ dev0 DEBUG direct_reg_access").unwrap();
        assert_eq!(cmd.target, AttrTarget::Debug);
        assert_eq!(cmd.attr.as_deref(), Some("direct_reg_access"));

        let cmd = parse_command("READ dev0 BUFFER").unwrap();
        assert_eq!(cmd.target, AttrTarget::Buffer);
        assert!(cmd.attr.is_none());

        let cmd = parse_command("READ dev0 OUTPUT altvoltage0").unwrap();
        assert_eq!(cmd.target, AttrTarget::output("altvoltage0"));
        assert!(cmd.attr.is_none());
    }

    #[test]
    fn test_parse_read_missing_channel() {
        let err = parse_command("READ dev0 INPUT").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingArgument {
                command: "READ",
                field: "channel"
            }
        );
    }

    #[test]
    fn test_parse_write() {
        let cmd = parse_command("WRITE dev0 OUTPUT altvoltage0 frequency 8").unwrap();
        assert_eq!(cmd.kind, CommandKind::Write);
        assert_eq!(cmd.target, AttrTarget::output("altvoltage0"));
        assert_eq!(cmd.attr.as_deref(), Some("frequency"));
        assert_eq!(cmd.bytes_count, 8);

        let cmd = parse_command("WRITE dev0 16").unwrap();
        assert!(cmd.attr.is_none());
        assert_eq!(cmd.bytes_count, 16);
    }

    #[test]
    fn test_parse_write_missing_count() {
        assert!(matches!(
            parse_command("WRITE dev0"),
            Err(ParseError::MissingArgument { .. })
        ));
        assert!(matches!(
            parse_command("WRITE dev0 BUFFER attr"),
            Err(ParseError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_parse_buffer_commands() {
        let cmd = parse_command("READBUF dev0 400").unwrap();
        assert_eq!(cmd.kind, CommandKind::ReadBuf);
        assert_eq!(cmd.bytes_count, 400);

        let cmd = parse_command("WRITEBUF dev0 12").unwrap();
        assert_eq!(cmd.kind, CommandKind::WriteBuf);
        assert_eq!(cmd.bytes_count, 12);
    }

    #[test]
    fn test_parse_triggers() {
        let cmd = parse_command("GETTRIG dev0").unwrap();
        assert_eq!(cmd.kind, CommandKind::GetTrig);

        let cmd = parse_command("SETTRIG dev0 trigger0").unwrap();
        assert_eq!(cmd.trigger.as_deref(), Some("trigger0"));

        let cmd = parse_command("SETTRIG dev0").unwrap();
        assert!(cmd.trigger.is_none());
    }

    #[test]
    fn test_parse_set_and_timeout() {
        let cmd = parse_command("SET dev0 BUFFERS_COUNT 4").unwrap();
        assert_eq!(cmd.kind, CommandKind::Set);
        assert_eq!(cmd.buffers_count, 4);

        assert!(matches!(
            parse_command("SET dev0 SAMPLES 4"),
            Err(ParseError::UnexpectedArgument { .. })
        ));

        let cmd = parse_command("TIMEOUT 5000").unwrap();
        assert_eq!(cmd.timeout_ms, 5000);
    }

    #[test]
    fn test_numeric_prefix_semantics() {
        let cmd = parse_command("READBUF dev0 400abc").unwrap();
        assert_eq!(cmd.bytes_count, 400);

        let err = parse_command("READBUF dev0 abc").unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { .. }));

        let err = parse_command("TIMEOUT 99999999999").unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { .. }));
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(
            parse_command("FOO").unwrap_err(),
            ParseError::UnknownCommand("FOO".to_string())
        );
        assert_eq!(parse_command("").unwrap_err(), ParseError::EmptyCommand);
        assert_eq!(parse_command("   ").unwrap_err(), ParseError::EmptyCommand);
    }

    #[test]
    fn test_names_are_case_sensitive() {
        assert!(matches!(
            parse_command("open dev0 1 1"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_prefix_related_names() {
        assert_eq!(lookup_command("READ"), Some(CommandKind::Read));
        assert_eq!(lookup_command("READBUF"), Some(CommandKind::ReadBuf));
        assert_eq!(lookup_command("SET"), Some(CommandKind::Set));
        assert_eq!(lookup_command("SETTRIG"), Some(CommandKind::SetTrig));
        assert_eq!(lookup_command("READB"), None);
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(matches!(
            parse_command("CLOSE dev0 now"),
            Err(ParseError::UnexpectedArgument { .. })
        ));
        assert!(matches!(
            parse_command("EXIT please"),
            Err(ParseError::UnexpectedArgument { .. })
        ));
    }

    #[test]
    fn test_error_codes_are_negative() {
        let err = parse_command("FOO").unwrap_err();
        assert!(err.code() < 0);
        assert_eq!(err.code(), -errno::EINVAL);
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(
            parse_command_bytes(b"READ \xff\xfe").unwrap_err(),
            ParseError::InvalidUtf8
        );
    }
}
