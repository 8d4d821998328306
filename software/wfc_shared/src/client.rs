//! Blocking REQ client for turbine emulators and tests.
//!
//! Each request must be followed by exactly one reply before the next
//! request is sent, matching the strict alternation of a ZeroMQ REQ socket.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::codec::{decode_setpoints, encode_measurements};
use crate::zmtp::{
    handshake, parse_tcp_endpoint, read_incoming, split_envelope, write_multipart, write_pong,
    Incoming, SocketType, ZmtpError,
};
use crate::{ChannelMap, Schema};

/// Connection to a REP endpoint such as the wind farm controller server
pub struct ReqClient {
    endpoint: String,
    stream: TcpStream,
}

impl ReqClient {
    /// Connect to a `tcp://host:port` endpoint and complete the handshake.
    /// `timeout` bounds the connection attempt and every subsequent read or write.
    /// A `*` host is taken to mean the local machine.
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, ZmtpError> {
        let addr = parse_tcp_endpoint(endpoint, "127.0.0.1")?;

        let mut last_err = None;
        let mut stream = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let mut stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => return Err(ZmtpError::InvalidEndpoint(endpoint.to_owned())),
        };

        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        handshake(&mut stream, SocketType::Req)?;

        Ok(Self {
            endpoint: endpoint.to_owned(),
            stream,
        })
    }

    /// The endpoint this client connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one request and wait for its reply body.
    pub fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, ZmtpError> {
        write_multipart(&mut self.stream, &[b"".as_slice(), payload])?;

        loop {
            match read_incoming(&mut self.stream)? {
                Incoming::Message(parts) => {
                    let (_envelope, body) = split_envelope(parts);
                    return Ok(body);
                }
                Incoming::Ping { context } => write_pong(&mut self.stream, &context)?,
            }
        }
    }

    /// Send a text request and wait for a text reply.
    pub fn request_str(&mut self, payload: &str) -> Result<String, ZmtpError> {
        let reply = self.request(payload.as_bytes())?;
        String::from_utf8(reply).map_err(|_| ZmtpError::NotUtf8)
    }

    /// Report measurements the way a turbine controller would
    /// and return the decoded setpoint reply.
    ///
    /// The raw reply is returned in the error string if it does not match the schema.
    pub fn exchange(
        &mut self,
        schema: &Schema,
        measurements: &ChannelMap,
    ) -> Result<ChannelMap, String> {
        let msg = encode_measurements(schema, measurements);
        let reply = self.request_str(&msg).map_err(|e| e.to_string())?;
        decode_setpoints(schema, reply.as_bytes())
            .map_err(|e| format!("Unable to decode reply `{reply}`: {e}"))
    }
}
