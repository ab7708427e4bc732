//! Brain <-> collector wire protocol.
//!
//! Every frame is a websocket text frame holding one JSON `Message`. A collector first talks to
//! the rendezvous endpoint (`connect` / `confirm-ports`), then opens two dedicated channels:
//! `in` carries commands to the collector, `out` carries its responses back.

use crate::error::ArbError;
use crate::market::{Depth, TickersMap};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio_tungstenite::tungstenite::Message as Frame;

pub const ARG_ID: &str = "id";
pub const ARG_PORT_IN: &str = "port_in";
pub const ARG_PORT_OUT: &str = "port_out";
pub const ARG_EXCHANGE: &str = "exchange";
pub const ARG_CURRENCY_PAIR: &str = "currency_pair";
pub const ARG_LIMIT: &str = "limit";
pub const ARG_REQUEST_TS: &str = "request_ts_micros";
pub const ARG_FETCH_TIME: &str = "fetch_time_micros";
pub const ARG_PAYLOAD: &str = "payload";
pub const ARG_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Connect,
    ConfirmPorts,
    DepthRequest,
    DepthResponse,
    TickerRequest,
    TickerResponse,
    ConfirmIn,
    ConfirmOut,
    Kill,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::ConfirmPorts => "confirm-ports",
            Command::DepthRequest => "depth-request",
            Command::DepthResponse => "depth-response",
            Command::TickerRequest => "ticker-request",
            Command::TickerResponse => "ticker-response",
            Command::ConfirmIn => "confirm-in",
            Command::ConfirmOut => "confirm-out",
            Command::Kill => "kill",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Message {
            command,
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn encode(&self) -> Result<String, ArbError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Message, ArbError> {
        serde_json::from_str(raw)
            .map_err(|e| ArbError::ProtocolError(format!("malformed message: {}", e)))
    }

    pub fn arg(&self, key: &str) -> Result<&str, ArbError> {
        self.args
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ArbError::ProtocolError(format!("{} is missing '{}'", self.command, key)))
    }

    pub fn arg_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T, ArbError> {
        self.arg(key)?
            .parse()
            .map_err(|_| ArbError::ProtocolError(format!("{} has invalid '{}'", self.command, key)))
    }

    pub fn error(&self) -> Option<&str> {
        self.args.get(ARG_ERROR).map(String::as_str)
    }

    pub fn request_ts_micros(&self) -> Result<i64, ArbError> {
        self.arg_parsed(ARG_REQUEST_TS)
    }

    // Handshake

    pub fn connect() -> Self {
        Message::new(Command::Connect)
    }

    pub fn confirm_ports(id: usize, port_in: u16, port_out: u16) -> Self {
        Message::new(Command::ConfirmPorts)
            .with_arg(ARG_ID, id)
            .with_arg(ARG_PORT_IN, port_in)
            .with_arg(ARG_PORT_OUT, port_out)
    }

    pub fn confirm_in(id: usize) -> Self {
        Message::new(Command::ConfirmIn).with_arg(ARG_ID, id)
    }

    pub fn confirm_out(id: usize) -> Self {
        Message::new(Command::ConfirmOut).with_arg(ARG_ID, id)
    }

    pub fn kill() -> Self {
        Message::new(Command::Kill)
    }

    // Fetch commands

    pub fn ticker_request(exchange: &str, request_ts_micros: i64) -> Self {
        Message::new(Command::TickerRequest)
            .with_arg(ARG_EXCHANGE, exchange)
            .with_arg(ARG_REQUEST_TS, request_ts_micros)
    }

    pub fn depth_request(exchange: &str, symbol: &str, limit: u32, request_ts_micros: i64) -> Self {
        Message::new(Command::DepthRequest)
            .with_arg(ARG_EXCHANGE, exchange)
            .with_arg(ARG_CURRENCY_PAIR, symbol)
            .with_arg(ARG_LIMIT, limit)
            .with_arg(ARG_REQUEST_TS, request_ts_micros)
    }

    pub fn ticker_response(
        request: &Message,
        tickers: &TickersMap,
        fetch_time_micros: i64,
    ) -> Result<Self, ArbError> {
        Ok(Message::response_to(request, Command::TickerResponse, fetch_time_micros)
            .with_arg(ARG_PAYLOAD, serde_json::to_string(tickers)?))
    }

    pub fn depth_response(
        request: &Message,
        depth: &Depth,
        fetch_time_micros: i64,
    ) -> Result<Self, ArbError> {
        Ok(Message::response_to(request, Command::DepthResponse, fetch_time_micros)
            .with_arg(ARG_PAYLOAD, serde_json::to_string(depth)?))
    }

    /// A response that carries a fetch failure instead of a payload.
    pub fn error_response(request: &Message, command: Command, error: &str, fetch_time_micros: i64) -> Self {
        Message::response_to(request, command, fetch_time_micros).with_arg(ARG_ERROR, error)
    }

    fn response_to(request: &Message, command: Command, fetch_time_micros: i64) -> Self {
        let mut response = Message::new(command).with_arg(ARG_FETCH_TIME, fetch_time_micros);
        for key in [ARG_EXCHANGE, ARG_CURRENCY_PAIR, ARG_REQUEST_TS] {
            if let Some(value) = request.args.get(key) {
                response.args.insert(key.to_string(), value.clone());
            }
        }
        response
    }

    pub fn tickers_payload(&self) -> Result<TickersMap, ArbError> {
        Ok(serde_json::from_str(self.arg(ARG_PAYLOAD)?)?)
    }

    pub fn depth_payload(&self) -> Result<Depth, ArbError> {
        Ok(serde_json::from_str(self.arg(ARG_PAYLOAD)?)?)
    }
}

/// Wraps a message in a websocket text frame.
pub fn to_frame(message: &Message) -> Result<Frame, ArbError> {
    Ok(Frame::Text(message.encode()?))
}

/// Reads the next protocol message, skipping control frames. `None` once the peer closed.
pub async fn next_message<S>(stream: &mut S) -> Option<Result<Message, ArbError>>
where
    S: Stream<Item = Result<Frame, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Text(text)) => return Some(Message::decode(&text)),
            Ok(Frame::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(e.into())),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_names_on_the_wire() {
        let raw = Message::confirm_ports(3, 7106, 7107).encode().unwrap();
        assert!(raw.contains("\"confirm-ports\""));
        let decoded = Message::decode(&raw).unwrap();
        assert_eq!(decoded.command, Command::ConfirmPorts);
        assert_eq!(decoded.arg_parsed::<u16>(ARG_PORT_OUT).unwrap(), 7107);
    }

    #[test]
    fn test_response_echoes_request_context() {
        let request = Message::depth_request("binance", "ETHBTC", 20, 42);
        let response = Message::depth_response(&request, &Depth::default(), 1500).unwrap();
        assert_eq!(response.command, Command::DepthResponse);
        assert_eq!(response.arg(ARG_CURRENCY_PAIR).unwrap(), "ETHBTC");
        assert_eq!(response.request_ts_micros().unwrap(), 42);
        assert_eq!(response.depth_payload().unwrap(), Depth::default());
        assert!(response.error().is_none());
    }

    #[test]
    fn test_malformed_and_unknown_commands_are_protocol_errors() {
        assert!(matches!(Message::decode("{not json"), Err(ArbError::ProtocolError(_))));
        assert!(matches!(
            Message::decode(r#"{"command":"reboot","args":{}}"#),
            Err(ArbError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_missing_argument() {
        let msg = Message::new(Command::TickerRequest);
        assert!(matches!(msg.request_ts_micros(), Err(ArbError::ProtocolError(_))));
    }
}
