//! Remote shell session over the gateway's line-oriented service
//!
//! The gateway runs a plain telnet daemon once the control channel enables
//! it. The session logs in, then scrapes command output between the echoed
//! command line and the next shell prompt. Option negotiation bytes embedded
//! in the stream are filtered out before prompt matching.

use crate::client::{ShellConnector, ShellRunner};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const LOGIN_PROMPT: &[u8] = b"login: ";
const LOGIN_USER: &str = "admin";
const GREETING_PROMPT: &[u8] = b"\r\n# ";
const SHELL_PROMPT: &[u8] = b"# ";
const LINE_END: &[u8] = b"\r\n";

/// Telnet option negotiation filter state
enum NegotiationState {
    Normal,
    /// Last byte was IAC
    Command,
    /// Last bytes were IAC + WILL/WONT/DO/DONT; one option byte follows
    Option,
}

/// Strips telnet negotiation sequences from an inbound byte stream
struct NegotiationFilter {
    state: NegotiationState,
}

impl NegotiationFilter {
    fn new() -> Self {
        Self {
            state: NegotiationState::Normal,
        }
    }

    fn feed(&mut self, raw: &[u8], out: &mut Vec<u8>) {
        for &byte in raw {
            match self.state {
                NegotiationState::Normal => {
                    if byte == 0xFF {
                        self.state = NegotiationState::Command;
                    } else {
                        out.push(byte);
                    }
                }
                NegotiationState::Command => match byte {
                    // escaped literal 0xFF
                    0xFF => {
                        out.push(0xFF);
                        self.state = NegotiationState::Normal;
                    }
                    // WILL/WONT/DO/DONT carry one option byte
                    0xFB..=0xFE => self.state = NegotiationState::Option,
                    _ => self.state = NegotiationState::Normal,
                },
                NegotiationState::Option => self.state = NegotiationState::Normal,
            }
        }
    }
}

/// A logged-in shell session
pub struct ShellSession {
    stream: TcpStream,
    pending: Vec<u8>,
    filter: NegotiationFilter,
    read_timeout: Duration,
}

impl ShellSession {
    /// Connect and log in. Any failure up to the first prompt surfaces as a
    /// shell error; callers treat it as "shell unavailable".
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| GatewayError::shell(format!("Connect to {host}:{port} timed out")))?
            .map_err(|e| GatewayError::shell(format!("Connect to {host}:{port} failed: {e}")))?;

        let mut session = Self {
            stream,
            pending: Vec::new(),
            filter: NegotiationFilter::new(),
            read_timeout: connect_timeout,
        };

        session.read_until(LOGIN_PROMPT).await?;
        session.write_line(LOGIN_USER).await?;
        session.read_until(GREETING_PROMPT).await?;

        debug!("Shell session to {host}:{port} established");
        Ok(session)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut raw = line.as_bytes().to_vec();
        raw.extend_from_slice(LINE_END);
        self.stream
            .write_all(&raw)
            .await
            .map_err(|e| GatewayError::shell(format!("Write failed: {e}")))
    }

    /// Read until `needle` appears, returning everything before it and
    /// consuming the needle itself
    async fn read_until(&mut self, needle: &[u8]) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.pending, needle) {
                let mut head: Vec<u8> = self.pending.drain(..pos + needle.len()).collect();
                head.truncate(pos);
                return Ok(head);
            }

            let mut chunk = [0u8; 4096];
            let n = timeout(self.read_timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| GatewayError::shell("Prompt not found before timeout"))?
                .map_err(|e| GatewayError::shell(format!("Read failed: {e}")))?;

            if n == 0 {
                return Err(GatewayError::shell("Connection closed before prompt"));
            }

            self.filter.feed(&chunk[..n], &mut self.pending);
        }
    }
}

#[async_trait]
impl ShellRunner for ShellSession {
    async fn run_and_capture(&mut self, command: &str) -> Result<Vec<u8>> {
        self.write_line(command).await?;

        // discard the echoed command line
        self.read_until(LINE_END).await?;

        self.read_until(SHELL_PROMPT).await
    }

    async fn run_fire_and_forget(&mut self, command: &str) -> Result<()> {
        self.write_line(command).await?;

        // drain whatever arrives promptly; completion timing is not
        // guaranteed for these administrative commands
        let mut chunk = [0u8; 4096];
        while let Ok(Ok(n)) =
            timeout(Duration::from_millis(100), self.stream.read(&mut chunk)).await
        {
            if n == 0 {
                break;
            }
        }
        self.pending.clear();

        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// [`ShellConnector`] opening telnet sessions against a fixed endpoint
pub struct TelnetConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TelnetConnector {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ShellConnector for TelnetConnector {
    async fn open(&self) -> Result<Box<dyn ShellRunner>> {
        let session = ShellSession::connect(&self.host, self.port, self.connect_timeout).await?;
        Ok(Box::new(session))
    }
}
