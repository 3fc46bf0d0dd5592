//! Tunnel control and data messages
//!
//! Every exchange on the tunnel is a message: a dictionary of string keys
//! mapped to [`Value`]s, selected by the required `command` key. This module
//! defines the key vocabulary, the command and code enums, and the typed
//! [`Message`] wrapper with constructor helpers for everything the engine
//! emits.
//!
//! # Message kinds
//!
//! | Code | Command | Direction |
//! |------|---------|-----------|
//! | 1 | Data | both |
//! | 2 | Suspend | both |
//! | 3 | Resume | both |
//! | 4 | Close | both |
//! | 5 | DNS | reserved |
//! | 6 | Open | client → server |
//! | 7 | OpenResult | server → client |
//! | 8 | Packets | both |
//! | 9 | FetchConfiguration | both |

mod codec;
mod value;

pub use codec::{decode_payload, encode_frame, FrameCodec, LENGTH_FIELD_LEN, MAX_FRAME_LEN};
pub use value::Value;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::FrameError;

/// Recognized message keys
pub mod keys {
    /// Message kind selector (required, integer)
    pub const COMMAND: &str = "command";
    /// Flow identifier (integer)
    pub const IDENTIFIER: &str = "identifier";
    /// Payload bytes of a data message
    pub const DATA: &str = "data";
    /// Half-close direction (integer 1-4)
    pub const CLOSE_TYPE: &str = "close-type";
    /// Open result (integer 0-5)
    pub const RESULT_CODE: &str = "result-code";
    /// App-layer or IP-layer flow (integer 0-1)
    pub const TUNNEL_TYPE: &str = "tunnel-type";
    /// TCP or UDP sub-kind of an app-layer flow (integer 1 or 3)
    pub const APP_PROXY_FLOW_TYPE: &str = "app-proxy-flow-type";
    /// Open target or UDP peer host (string)
    pub const HOST: &str = "host";
    /// Open target or UDP peer port (integer)
    pub const PORT: &str = "port";
    /// List of raw IP packets (byte strings)
    pub const PACKETS: &str = "packets";
    /// AF family per packet (integer list, same length as `packets`)
    pub const PROTOCOLS: &str = "protocols";
    /// Tunnel network settings (nested mapping)
    pub const CONFIGURATION: &str = "configuration";
    /// Reserved for the DNS sub-protocol
    pub const DNS_PACKET: &str = "dns-packet";
    /// Reserved for the DNS sub-protocol
    pub const DNS_PACKET_SOURCE: &str = "dns-packet-source";
}

/// Message command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Command {
    /// Payload bytes for a flow
    Data = 1,
    /// Ask the peer to stop sending on a flow
    Suspend = 2,
    /// Ask the peer to resume sending on a flow
    Resume = 3,
    /// Half- or fully close a flow
    Close = 4,
    /// DNS sub-protocol (reserved, unimplemented)
    Dns = 5,
    /// Open a new flow
    Open = 6,
    /// Answer to an open
    OpenResult = 7,
    /// Batch of raw IP packets for a flow
    Packets = 8,
    /// Request or deliver the tunnel configuration
    FetchConfiguration = 9,
}

impl Command {
    /// Create a command from its wire code
    ///
    /// # Errors
    ///
    /// Returns `FrameError::UnknownCommand` if the code is not a valid
    /// command.
    pub fn from_code(code: i64) -> Result<Self, FrameError> {
        match code {
            1 => Ok(Self::Data),
            2 => Ok(Self::Suspend),
            3 => Ok(Self::Resume),
            4 => Ok(Self::Close),
            5 => Ok(Self::Dns),
            6 => Ok(Self::Open),
            7 => Ok(Self::OpenResult),
            8 => Ok(Self::Packets),
            9 => Ok(Self::FetchConfiguration),
            _ => Err(FrameError::UnknownCommand(code)),
        }
    }

    /// Convert command to its wire code
    #[must_use]
    pub const fn as_code(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Close => "close",
            Self::Dns => "dns",
            Self::Open => "open",
            Self::OpenResult => "openResult",
            Self::Packets => "packets",
            Self::FetchConfiguration => "fetchConfiguration",
        };
        f.write_str(name)
    }
}

/// Half-close direction carried by `close-type`
///
/// Doubles as the connection's close state: `None` is fully open, `All` is
/// fully closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum CloseDirection {
    /// Neither direction closed
    #[default]
    None = 1,
    /// Read side closed
    Read = 2,
    /// Write side closed
    Write = 3,
    /// Both directions closed
    All = 4,
}

impl CloseDirection {
    /// Create a direction from its wire code
    ///
    /// Unknown codes yield `None` here; the dispatch layer defaults a
    /// missing or invalid `close-type` to `All`.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::None),
            2 => Some(Self::Read),
            3 => Some(Self::Write),
            4 => Some(Self::All),
            _ => Option::None,
        }
    }

    /// Convert direction to its wire code
    #[must_use]
    pub const fn as_code(self) -> i64 {
        self as i64
    }

    /// Whether the read side is closed under this direction
    #[must_use]
    pub const fn closes_read(self) -> bool {
        matches!(self, Self::Read | Self::All)
    }

    /// Whether the write side is closed under this direction
    #[must_use]
    pub const fn closes_write(self) -> bool {
        matches!(self, Self::Write | Self::All)
    }
}

/// Result code of an open attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ResultCode {
    /// Flow opened
    Success = 0,
    /// Open parameters were invalid
    InvalidParameter = 1,
    /// Target host did not resolve
    NoSuchHost = 2,
    /// Remote endpoint refused
    Refused = 3,
    /// Connect timed out
    Timeout = 4,
    /// Internal server error
    Internal = 5,
}

impl ResultCode {
    /// Create a result code from its wire value
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::InvalidParameter),
            2 => Some(Self::NoSuchHost),
            3 => Some(Self::Refused),
            4 => Some(Self::Timeout),
            5 => Some(Self::Internal),
            _ => None,
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_code(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::InvalidParameter => "invalid-param",
            Self::NoSuchHost => "no-such-host",
            Self::Refused => "refused",
            Self::Timeout => "timeout",
            Self::Internal => "internal-error",
        };
        f.write_str(name)
    }
}

/// Flow layer carried by `tunnel-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum TunnelLayer {
    /// App-layer flow (TCP stream or UDP datagrams)
    #[default]
    App = 0,
    /// IP-layer flow (raw packets)
    Ip = 1,
}

impl TunnelLayer {
    /// Create a layer from its wire value
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::App),
            1 => Some(Self::Ip),
            _ => None,
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_code(self) -> i64 {
        self as i64
    }
}

/// Sub-kind of an app-layer flow, carried by `app-proxy-flow-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum AppFlowKind {
    /// TCP byte stream
    Tcp = 1,
    /// UDP datagrams
    Udp = 3,
}

impl AppFlowKind {
    /// Create a flow kind from its wire value
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Tcp),
            3 => Some(Self::Udp),
            _ => None,
        }
    }

    /// Convert to the wire value
    #[must_use]
    pub const fn as_code(self) -> i64 {
        self as i64
    }
}

/// A single tunnel message: string keys mapped to typed values
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    entries: BTreeMap<String, Value>,
}

impl Message {
    /// Create an empty message carrying only a command
    #[must_use]
    pub fn with_command(command: Command) -> Self {
        let mut message = Self::default();
        message.insert(keys::COMMAND, Value::Int(command.as_code()));
        message
    }

    /// Insert a value under a key, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Get the value stored under a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Borrow the underlying dictionary
    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    /// Build a message from an existing dictionary
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Self { entries }
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    /// The message command
    ///
    /// # Errors
    ///
    /// Returns `FrameError::MissingCommand` when the key is absent or not
    /// an integer, and `FrameError::UnknownCommand` for unrecognized codes.
    pub fn command(&self) -> Result<Command, FrameError> {
        let code = self
            .get(keys::COMMAND)
            .and_then(Value::as_int)
            .ok_or(FrameError::MissingCommand)?;
        Command::from_code(code)
    }

    /// The flow identifier, when present and in range
    #[must_use]
    pub fn identifier(&self) -> Option<u32> {
        self.get(keys::IDENTIFIER).and_then(Value::as_u32)
    }

    /// The data payload, when present
    #[must_use]
    pub fn data(&self) -> Option<Bytes> {
        self.get(keys::DATA).and_then(Value::as_bytes).cloned()
    }

    /// The half-close direction, when present and valid
    #[must_use]
    pub fn close_type(&self) -> Option<CloseDirection> {
        self.get(keys::CLOSE_TYPE)
            .and_then(Value::as_int)
            .and_then(CloseDirection::from_code)
    }

    /// The open result code, when present and valid
    #[must_use]
    pub fn result_code(&self) -> Option<ResultCode> {
        self.get(keys::RESULT_CODE)
            .and_then(Value::as_int)
            .and_then(ResultCode::from_code)
    }

    /// The flow layer, when present and valid
    #[must_use]
    pub fn tunnel_layer(&self) -> Option<TunnelLayer> {
        self.get(keys::TUNNEL_TYPE)
            .and_then(Value::as_int)
            .and_then(TunnelLayer::from_code)
    }

    /// The app-layer flow kind, when present and valid
    #[must_use]
    pub fn app_flow_kind(&self) -> Option<AppFlowKind> {
        self.get(keys::APP_PROXY_FLOW_TYPE)
            .and_then(Value::as_int)
            .and_then(AppFlowKind::from_code)
    }

    /// The target or peer host, when present
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.get(keys::HOST).and_then(Value::as_str)
    }

    /// The target or peer port, when present and in range
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.get(keys::PORT).and_then(Value::as_u16)
    }

    /// The raw packet batch, when present and well-typed
    #[must_use]
    pub fn packets(&self) -> Option<Vec<Bytes>> {
        let items = self.get(keys::PACKETS).and_then(Value::as_list)?;
        items
            .iter()
            .map(|v| v.as_bytes().cloned())
            .collect::<Option<Vec<_>>>()
    }

    /// The per-packet protocol numbers, when present
    #[must_use]
    pub fn protocols(&self) -> Option<Vec<i64>> {
        self.get(keys::PROTOCOLS)
            .and_then(Value::as_int_list)
            .map(<[i64]>::to_vec)
    }

    /// The nested configuration mapping, when present
    #[must_use]
    pub fn configuration(&self) -> Option<&BTreeMap<String, Value>> {
        self.get(keys::CONFIGURATION).and_then(Value::as_map)
    }

    // ------------------------------------------------------------------
    // Constructors for the messages the engine emits
    // ------------------------------------------------------------------

    /// Data message for a stream flow
    #[must_use]
    pub fn data_message(identifier: u32, data: Bytes) -> Self {
        let mut message = Self::with_command(Command::Data);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::DATA, data);
        message
    }

    /// Data message for a datagram flow, carrying the peer endpoint
    #[must_use]
    pub fn datagram_message(identifier: u32, data: Bytes, host: &str, port: u16) -> Self {
        let mut message = Self::data_message(identifier, data);
        message.insert(keys::HOST, host);
        message.insert(keys::PORT, port);
        message
    }

    /// Advisory suspend for a flow
    #[must_use]
    pub fn suspend(identifier: u32) -> Self {
        let mut message = Self::with_command(Command::Suspend);
        message.insert(keys::IDENTIFIER, identifier);
        message
    }

    /// Advisory resume for a flow
    #[must_use]
    pub fn resume(identifier: u32) -> Self {
        let mut message = Self::with_command(Command::Resume);
        message.insert(keys::IDENTIFIER, identifier);
        message
    }

    /// Close a flow in the given direction
    #[must_use]
    pub fn close(identifier: u32, direction: CloseDirection) -> Self {
        let mut message = Self::with_command(Command::Close);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::CLOSE_TYPE, Value::Int(direction.as_code()));
        message
    }

    /// Answer an open attempt
    #[must_use]
    pub fn open_result(identifier: u32, code: ResultCode) -> Self {
        let mut message = Self::with_command(Command::OpenResult);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::RESULT_CODE, Value::Int(code.as_code()));
        message
    }

    /// Answer an open attempt, attaching tunnel network settings
    #[must_use]
    pub fn open_result_with_configuration(
        identifier: u32,
        code: ResultCode,
        configuration: Value,
    ) -> Self {
        let mut message = Self::open_result(identifier, code);
        message.insert(keys::CONFIGURATION, configuration);
        message
    }

    /// Raw packet batch for an IP flow
    ///
    /// The two lists must be the same length; callers enforce the batch
    /// caps before building the message.
    #[must_use]
    pub fn packets_message(identifier: u32, packets: Vec<Bytes>, protocols: Vec<i64>) -> Self {
        let mut message = Self::with_command(Command::Packets);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(
            keys::PACKETS,
            Value::List(packets.into_iter().map(Value::Bytes).collect()),
        );
        message.insert(keys::PROTOCOLS, Value::IntList(protocols));
        message
    }

    /// Request the tunnel configuration
    #[must_use]
    pub fn fetch_configuration() -> Self {
        Self::with_command(Command::FetchConfiguration)
    }

    /// Deliver the tunnel configuration
    #[must_use]
    pub fn configuration_response(configuration: Value) -> Self {
        let mut message = Self::with_command(Command::FetchConfiguration);
        message.insert(keys::CONFIGURATION, configuration);
        message
    }

    /// Open a TCP stream flow to `host:port`
    #[must_use]
    pub fn open_stream(identifier: u32, host: &str, port: u16) -> Self {
        let mut message = Self::with_command(Command::Open);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::TUNNEL_TYPE, Value::Int(TunnelLayer::App.as_code()));
        message.insert(
            keys::APP_PROXY_FLOW_TYPE,
            Value::Int(AppFlowKind::Tcp.as_code()),
        );
        message.insert(keys::HOST, host);
        message.insert(keys::PORT, port);
        message
    }

    /// Open a UDP datagram flow
    #[must_use]
    pub fn open_datagram(identifier: u32) -> Self {
        let mut message = Self::with_command(Command::Open);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::TUNNEL_TYPE, Value::Int(TunnelLayer::App.as_code()));
        message.insert(
            keys::APP_PROXY_FLOW_TYPE,
            Value::Int(AppFlowKind::Udp.as_code()),
        );
        message
    }

    /// Open an IP packet flow
    #[must_use]
    pub fn open_packets(identifier: u32) -> Self {
        let mut message = Self::with_command(Command::Open);
        message.insert(keys::IDENTIFIER, identifier);
        message.insert(keys::TUNNEL_TYPE, Value::Int(TunnelLayer::Ip.as_code()));
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::from_code(1).unwrap(), Command::Data);
        assert_eq!(Command::from_code(9).unwrap(), Command::FetchConfiguration);
        assert!(Command::from_code(0).is_err());
        assert!(Command::from_code(10).is_err());
        assert_eq!(Command::Open.as_code(), 6);
    }

    #[test]
    fn test_close_direction_codes() {
        assert_eq!(CloseDirection::from_code(1), Some(CloseDirection::None));
        assert_eq!(CloseDirection::from_code(4), Some(CloseDirection::All));
        assert_eq!(CloseDirection::from_code(5), Option::None);

        assert!(CloseDirection::Read.closes_read());
        assert!(!CloseDirection::Read.closes_write());
        assert!(CloseDirection::All.closes_read());
        assert!(CloseDirection::All.closes_write());
        assert!(!CloseDirection::None.closes_read());
    }

    #[test]
    fn test_result_code_display() {
        assert_eq!(ResultCode::Success.to_string(), "success");
        assert_eq!(ResultCode::Internal.to_string(), "internal-error");
        assert_eq!(ResultCode::from_code(3), Some(ResultCode::Refused));
        assert_eq!(ResultCode::from_code(6), None);
    }

    #[test]
    fn test_data_message_accessors() {
        let message = Message::data_message(7, Bytes::from_static(b"hello"));
        assert_eq!(message.command().unwrap(), Command::Data);
        assert_eq!(message.identifier(), Some(7));
        assert_eq!(message.data().unwrap().as_ref(), b"hello");
        assert!(message.host().is_none());
        assert!(message.port().is_none());
    }

    #[test]
    fn test_datagram_message_endpoint() {
        let message =
            Message::datagram_message(3, Bytes::from_static(b"\x01\x02"), "198.51.100.5", 53);
        assert_eq!(message.host(), Some("198.51.100.5"));
        assert_eq!(message.port(), Some(53));
    }

    #[test]
    fn test_open_stream_shape() {
        let message = Message::open_stream(7, "192.0.2.10", 7);
        assert_eq!(message.command().unwrap(), Command::Open);
        assert_eq!(message.tunnel_layer(), Some(TunnelLayer::App));
        assert_eq!(message.app_flow_kind(), Some(AppFlowKind::Tcp));
        assert_eq!(message.host(), Some("192.0.2.10"));
        assert_eq!(message.port(), Some(7));
    }

    #[test]
    fn test_open_packets_shape() {
        let message = Message::open_packets(1);
        assert_eq!(message.tunnel_layer(), Some(TunnelLayer::Ip));
        assert!(message.app_flow_kind().is_none());
    }

    #[test]
    fn test_packets_message_accessors() {
        let packets = vec![Bytes::from_static(b"\x45"), Bytes::from_static(b"\x60")];
        let message = Message::packets_message(9, packets, vec![2, 30]);
        assert_eq!(message.packets().unwrap().len(), 2);
        assert_eq!(message.protocols().unwrap(), vec![2, 30]);
    }

    #[test]
    fn test_missing_command() {
        let message = Message::default();
        assert!(matches!(
            message.command(),
            Err(FrameError::MissingCommand)
        ));

        let mut message = Message::default();
        message.insert(keys::COMMAND, Value::Int(99));
        assert!(matches!(
            message.command(),
            Err(FrameError::UnknownCommand(99))
        ));
    }

    #[test]
    fn test_mistyped_value_reads_as_absent() {
        let mut message = Message::with_command(Command::Data);
        message.insert(keys::IDENTIFIER, "seven");
        assert!(message.identifier().is_none());

        message.insert(keys::PORT, Value::Int(70_000));
        assert!(message.port().is_none());
    }
}
