//! The command port protocol.
//!
//! Each line is split into tokens separated by ASCII whitespace.
//! The first token names the command, the rest are its arguments.
//!
//! A token starting with `"` runs to the next unescaped `"` and may contain
//! whitespace. Inside quotes these escapes are understood:
//! `\"`, `\\`, `\n`, `\r`, `\t` and `\xNN` (two hex digits).
//! A closing quote must be followed by whitespace or the end of the line.
//! Outside quotes, bytes are taken as they are.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    agent::AgentContext,
    packet::{Packet, PacketType},
    topology::Topology,
};

/// Problems splitting a command line into tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    /// A quote was opened but never closed.
    #[error("unterminated quote starting at byte {0}")]
    Unterminated(usize),

    /// Backslash followed by something we do not understand.
    #[error("bad escape sequence at byte {0}")]
    BadEscape(usize),

    /// Something other than whitespace directly after a closing quote.
    #[error("missing whitespace after closing quote at byte {0}")]
    Unseparated(usize),
}

/// Split a command line into tokens.
pub fn tokenize(line: &[u8]) -> Result<Vec<Vec<u8>>, TokenizeError> {
    let mut tokens = vec![];
    let mut i = 0;

    while i < line.len() {
        if line[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if line[i] != b'"' {
            let start = i;
            while i < line.len() && !line[i].is_ascii_whitespace() {
                i += 1;
            }
            tokens.push(line[start..i].to_vec());
            continue;
        }

        let opened = i;
        let mut token = vec![];
        i += 1;
        loop {
            match line.get(i) {
                None => return Err(TokenizeError::Unterminated(opened)),
                Some(b'"') => {
                    i += 1;
                    break;
                }
                Some(b'\\') => {
                    let (byte, used) =
                        unescape(&line[i + 1..]).ok_or(TokenizeError::BadEscape(i))?;
                    token.push(byte);
                    i += 1 + used;
                }
                Some(&byte) => {
                    token.push(byte);
                    i += 1;
                }
            }
        }

        if line.get(i).is_some_and(|byte| !byte.is_ascii_whitespace()) {
            return Err(TokenizeError::Unseparated(i));
        }
        tokens.push(token);
    }

    Ok(tokens)
}

/// Decode the escape following a backslash, giving the byte and how many input bytes it used.
fn unescape(after: &[u8]) -> Option<(u8, usize)> {
    match after.first()? {
        b'"' => Some((b'"', 1)),
        b'\\' => Some((b'\\', 1)),
        b'n' => Some((b'\n', 1)),
        b'r' => Some((b'\r', 1)),
        b't' => Some((b'\t', 1)),
        b'x' => {
            let digits = after.get(1..3)?;
            if !digits.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(digits).ok()?;
            u8::from_str_radix(hex, 16).ok().map(|byte| (byte, 3))
        }
        _ => None,
    }
}

/// What a command does when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Report `CONNECTED` or `DISCONNECTED`.
    State,
    /// Dump the running configuration as JSON.
    Config,
    /// Report the agent version.
    Version,
    /// Pass the command on to the instrument's auxiliary command channel.
    Vendor,
}

/// A registered command.
///
/// Handlers hold no agent state themselves; the state is handed over at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandler {
    /// The command name, case sensitive.
    pub name: &'static str,
    /// What to do.
    pub kind: HandlerKind,
}

impl CommandHandler {
    async fn invoke(&self, ctx: &AgentContext, args: &[Vec<u8>]) -> Vec<Packet> {
        match self.kind {
            HandlerKind::State => match ctx.agent().state().await {
                Ok(state) => Packet::create(state.to_string(), PacketType::PaStatus),
                Err(e) => fault(format!("Unable to get state: {e}")),
            },
            HandlerKind::Config => match serde_json::to_string(ctx.config()) {
                Ok(json) => Packet::create(json, PacketType::PaConfig),
                Err(e) => fault(format!("Unable to dump config: {e}")),
            },
            HandlerKind::Version => Packet::create(env!("CARGO_PKG_VERSION"), PacketType::PaConfig),
            HandlerKind::Vendor => ctx.topology().vendor_command(ctx, self.name, args).await,
        }
    }
}

/// Command name to handler mapping for one command connection.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, CommandHandler>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any with the same name.
    pub fn register(&mut self, handler: CommandHandler) {
        debug!(name = handler.name, kind = ?handler.kind, "Register command");
        self.handlers.insert(handler.name, handler);
    }

    /// The base commands plus whatever the topology adds.
    pub fn for_topology(topology: &dyn Topology) -> Self {
        let mut registry = Self::new();

        for (name, kind) in [
            ("get_state", HandlerKind::State),
            ("get_config", HandlerKind::Config),
            ("get_version", HandlerKind::Version),
        ] {
            registry.register(CommandHandler { name, kind });
        }

        for &name in topology.extra_commands() {
            registry.register(CommandHandler {
                name,
                kind: HandlerKind::Vendor,
            });
        }

        registry
    }

    /// Look up a command.
    pub fn get(&self, name: &str) -> Option<&CommandHandler> {
        self.handlers.get(name)
    }

    /// Handle one command line, giving the response packets.
    ///
    /// Problems with the line become `PA_FAULT` packets.
    pub async fn handle_line(&self, line: &[u8], ctx: &AgentContext) -> Vec<Packet> {
        let tokens = match tokenize(line) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(%e, "Bad command line");
                return fault(format!("Unable to parse command on command port: {e}"));
            }
        };

        let Some((name, args)) = tokens.split_first() else {
            return fault("Received empty command on command port".into());
        };

        let name = String::from_utf8_lossy(name);
        match self.handlers.get(name.as_ref()) {
            Some(handler) => {
                debug!(%name, args = args.len(), "Command");
                handler.invoke(ctx, args).await
            }
            None => {
                warn!(%name, "Unknown command");
                fault(format!("Received bad command on command port: {name:?}"))
            }
        }
    }
}

pub(crate) fn fault(message: String) -> Vec<Packet> {
    Packet::create(message, PacketType::PaFault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(line: &[u8]) -> Vec<Vec<u8>> {
        tokenize(line).unwrap()
    }

    #[test]
    fn whitespace_separated() {
        assert_eq!(
            tokens(b"  power   on\t1 "),
            vec![b"power".to_vec(), b"on".to_vec(), b"1".to_vec()]
        );
        assert!(tokens(b" \t ").is_empty());
    }

    #[test]
    fn quoted_tokens_keep_whitespace_and_escapes() {
        assert_eq!(
            tokens(br#"break "a b" "\x00\r\n\"\\" x\y"#),
            vec![
                b"break".to_vec(),
                b"a b".to_vec(),
                b"\x00\r\n\"\\".to_vec(),
                b"x\\y".to_vec(),
            ]
        );
        assert_eq!(tokens(br#""""#), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn tokenize_errors() {
        assert_eq!(tokenize(br#"time "open"#), Err(TokenizeError::Unterminated(5)));
        assert_eq!(tokenize(br#""\q""#), Err(TokenizeError::BadEscape(1)));
        assert_eq!(tokenize(br#""\x4""#), Err(TokenizeError::BadEscape(1)));
        assert_eq!(tokenize(br#""\x+f""#), Err(TokenizeError::BadEscape(1)));
        assert_eq!(tokenize(br#""\x-1""#), Err(TokenizeError::BadEscape(1)));
        assert_eq!(tokenize(br#""ab"cd"#), Err(TokenizeError::Unseparated(4)));
    }

    #[test]
    fn base_registry() {
        let registry = CommandRegistry::for_topology(&crate::topology::SingleLink::new(
            "127.0.0.1".into(),
            4001,
        ));

        for name in ["get_state", "get_config", "get_version"] {
            assert!(registry.get(name).is_some());
        }
        assert!(registry.get("GET_STATE").is_none());
        assert!(registry.get("tinfo").is_none());
    }
}
