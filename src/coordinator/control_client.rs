//! Client side of the control protocol

use crate::common::{Error, Result};
use crate::coordinator::control::{ControlRequest, ERROR};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// What the coordinator answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// The verb's result (`SUCCESS`, a state id, a JSON document, ...).
    Done(String),
    /// The coordinator refused; carries its message.
    Refused(String),
}

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }

    /// Send one request and wait for its reply.
    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut line = request.to_line();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            return Err(Error::Protocol(format!(
                "server closed connection unexpectedly after {}",
                request.verb()
            )));
        }
        parse_reply(request.verb(), &reply)
    }
}

fn parse_reply(verb: &str, reply: &str) -> Result<ControlResponse> {
    let value: Value = serde_json::from_str(reply)
        .map_err(|_| Error::Protocol(format!("got non-JSON message {}", reply.trim_end())))?;
    let Value::Object(map) = value else {
        return Err(Error::Protocol(format!(
            "got invalid JSON message {}",
            reply.trim_end()
        )));
    };
    match map.get(verb) {
        Some(Value::String(s)) if s == ERROR => Ok(ControlResponse::Refused(
            map.get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        Some(Value::String(s)) => Ok(ControlResponse::Done(s.clone())),
        _ => Err(Error::Protocol(format!(
            "server message {} does not contain response to {}",
            reply.trim_end(),
            verb
        ))),
    }
}
