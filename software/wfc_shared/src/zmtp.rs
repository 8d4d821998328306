//! ZeroMQ message transport protocol (ZMTP 3.x) framing with the NULL
//! security mechanism, which is what stock ZeroMQ REQ/REP sockets speak
//! over TCP when no security is configured.
//!
//! ```text
//! greeting   = signature(10) version(2) mechanism(20) as-server(1) filler(31)
//! frame      = flags(1) size(1 or 8, big-endian) body
//! flags      = 0b0000_0CLM  (C: command, L: long size, M: more frames follow)
//! command    = name-size(1) name data
//! READY data = *(name-size(1) name value-size(4) value)
//! ```
//!
//! A REQ socket prefixes each request with an empty delimiter frame,
//! and a REP socket echoes every frame up to and including the delimiter
//! (the envelope) in front of its reply.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use thiserror::Error;

/// Length of the fixed-size greeting exchanged on connect
pub const GREETING_LEN: usize = 64;

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Protocol major version advertised in the greeting
pub const VERSION_MAJOR: u8 = 3;

/// Protocol minor version advertised in the greeting
pub const VERSION_MINOR: u8 = 0;

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

const MECHANISM_NULL: &[u8] = b"NULL";
const SOCKET_TYPE_PROPERTY: &str = "Socket-Type";

#[derive(Error, Debug)]
pub enum ZmtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Peer did not send a ZMTP signature")]
    BadSignature,

    #[error("Unsupported ZMTP version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("Unsupported security mechanism `{0}`")]
    UnsupportedMechanism(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Incompatible peer socket type: expected {expected}, found {found}")]
    IncompatiblePeer {
        expected: &'static str,
        found: String,
    },

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u64),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Invalid endpoint `{0}`; expected tcp://host:port")]
    InvalidEndpoint(String),

    #[error("Message is not valid UTF-8")]
    NotUtf8,
}

/// Socket roles that take part in the request/reply pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Req,
    Rep,
}

impl SocketType {
    /// Name of the socket type as advertised in the READY command
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
        }
    }

    /// The only socket type this one may talk to
    pub fn peer(&self) -> Self {
        match self {
            SocketType::Req => SocketType::Rep,
            SocketType::Rep => SocketType::Req,
        }
    }
}

/// A single frame as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub more: bool,
    pub command: bool,
    pub body: Vec<u8>,
}

/// Traffic received from a peer after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A complete multipart message
    Message(Vec<Vec<u8>>),

    /// A heartbeat that must be answered with a PONG carrying the same context
    Ping { context: Vec<u8> },
}

/// Greeting advertising ZMTP 3.0 with the NULL mechanism
pub fn greeting() -> [u8; GREETING_LEN] {
    let mut g = [0_u8; GREETING_LEN];
    g[0] = 0xFF;
    g[9] = 0x7F;
    g[10] = VERSION_MAJOR;
    g[11] = VERSION_MINOR;
    g[12..12 + MECHANISM_NULL.len()].copy_from_slice(MECHANISM_NULL);
    g
}

/// Check a peer's greeting for a compatible version and mechanism.
pub fn check_greeting(g: &[u8; GREETING_LEN]) -> Result<(), ZmtpError> {
    if g[0] != 0xFF || g[9] & 0x01 != 0x01 {
        return Err(ZmtpError::BadSignature);
    }

    let (major, minor) = (g[10], g[11]);
    if major < VERSION_MAJOR {
        return Err(ZmtpError::UnsupportedVersion(major, minor));
    }

    let mechanism = &g[12..32];
    let end = mechanism.iter().position(|&b| b == 0).unwrap_or(mechanism.len());
    if &mechanism[..end] != MECHANISM_NULL {
        return Err(ZmtpError::UnsupportedMechanism(
            String::from_utf8_lossy(&mechanism[..end]).into_owned(),
        ));
    }

    Ok(())
}

/// Read one frame, rejecting bodies larger than [MAX_FRAME_LEN].
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame, ZmtpError> {
    let mut flags = [0_u8; 1];
    r.read_exact(&mut flags)?;
    let flags = flags[0];

    let size = if flags & FLAG_LONG != 0 {
        let mut size = [0_u8; 8];
        r.read_exact(&mut size)?;
        u64::from_be_bytes(size)
    } else {
        let mut size = [0_u8; 1];
        r.read_exact(&mut size)?;
        size[0] as u64
    };

    if size > MAX_FRAME_LEN {
        return Err(ZmtpError::FrameTooLarge(size));
    }

    let mut body = vec![0_u8; size as usize];
    r.read_exact(&mut body)?;

    Ok(Frame {
        more: flags & FLAG_MORE != 0,
        command: flags & FLAG_COMMAND != 0,
        body,
    })
}

/// Write one frame with a single call to the underlying writer.
pub fn write_frame<W: Write>(
    w: &mut W,
    body: &[u8],
    more: bool,
    command: bool,
) -> Result<(), ZmtpError> {
    let mut buf = Vec::with_capacity(body.len() + 9);
    let mut flags = 0_u8;
    if more {
        flags |= FLAG_MORE;
    }
    if command {
        flags |= FLAG_COMMAND;
    }

    if body.len() > u8::MAX as usize {
        buf.push(flags | FLAG_LONG);
        buf.extend_from_slice(&(body.len() as u64).to_be_bytes());
    } else {
        buf.push(flags);
        buf.push(body.len() as u8);
    }
    buf.extend_from_slice(body);

    w.write_all(&buf)?;
    Ok(())
}

/// Write a multipart message, flagging every part but the last with MORE.
pub fn write_multipart<W: Write>(w: &mut W, parts: &[&[u8]]) -> Result<(), ZmtpError> {
    let last = parts.len().saturating_sub(1);
    for (i, part) in parts.iter().enumerate() {
        write_frame(w, part, i < last, false)?;
    }
    w.flush()?;
    Ok(())
}

/// Encode a command body from its name and data.
pub fn command_body(name: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + name.len() + data.len());
    body.push(name.len() as u8);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(data);
    body
}

/// Split a command body into its name and data.
pub fn parse_command(body: &[u8]) -> Result<(String, &[u8]), ZmtpError> {
    let name_len = *body
        .first()
        .ok_or_else(|| ZmtpError::MalformedCommand("empty command".to_owned()))?
        as usize;
    if body.len() < 1 + name_len {
        return Err(ZmtpError::MalformedCommand("truncated command name".to_owned()));
    }
    let name = String::from_utf8_lossy(&body[1..1 + name_len]).into_owned();
    Ok((name, &body[1 + name_len..]))
}

/// READY command advertising the local socket type
pub fn ready_command(socket_type: SocketType) -> Vec<u8> {
    let mut data = Vec::new();
    let value = socket_type.as_str().as_bytes();
    data.push(SOCKET_TYPE_PROPERTY.len() as u8);
    data.extend_from_slice(SOCKET_TYPE_PROPERTY.as_bytes());
    data.extend_from_slice(&(value.len() as u32).to_be_bytes());
    data.extend_from_slice(value);
    command_body("READY", &data)
}

/// Parse the metadata properties of a READY command.
pub fn parse_properties(mut data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, ZmtpError> {
    let truncated = || ZmtpError::MalformedCommand("truncated property".to_owned());
    let mut props = BTreeMap::new();

    while !data.is_empty() {
        let name_len = data[0] as usize;
        data = &data[1..];
        if data.len() < name_len + 4 {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
        data = &data[name_len..];

        let mut value_len = [0_u8; 4];
        value_len.copy_from_slice(&data[..4]);
        let value_len = u32::from_be_bytes(value_len) as usize;
        data = &data[4..];
        if data.len() < value_len {
            return Err(truncated());
        }
        props.insert(name, data[..value_len].to_vec());
        data = &data[value_len..];
    }

    Ok(props)
}

/// Exchange greetings and READY commands, checking that the peer
/// is the counterpart of `local` in the request/reply pattern.
pub fn handshake<S: Read + Write>(stream: &mut S, local: SocketType) -> Result<(), ZmtpError> {
    stream.write_all(&greeting())?;
    stream.flush()?;

    let mut peer_greeting = [0_u8; GREETING_LEN];
    stream.read_exact(&mut peer_greeting)?;
    check_greeting(&peer_greeting)?;

    write_frame(stream, &ready_command(local), false, true)?;
    stream.flush()?;

    let frame = read_frame(stream)?;
    if !frame.command {
        return Err(ZmtpError::Handshake(
            "expected READY command, received a message".to_owned(),
        ));
    }
    let (name, data) = parse_command(&frame.body)?;
    match name.as_str() {
        "READY" => {}
        "ERROR" => {
            let reason = data.get(1..).unwrap_or_default();
            return Err(ZmtpError::Handshake(format!(
                "peer rejected handshake: {}",
                String::from_utf8_lossy(reason)
            )));
        }
        other => {
            return Err(ZmtpError::Handshake(format!(
                "expected READY command, received {other}"
            )));
        }
    }

    let props = parse_properties(data)?;
    let found = props
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(SOCKET_TYPE_PROPERTY))
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();
    let expected = local.peer().as_str();
    if found != expected {
        return Err(ZmtpError::IncompatiblePeer { expected, found });
    }

    Ok(())
}

/// Read frames until a complete message or a PING arrives.
/// Other commands are skipped.
pub fn read_incoming<R: Read>(r: &mut R) -> Result<Incoming, ZmtpError> {
    let mut parts = Vec::new();
    loop {
        let frame = read_frame(r)?;
        if frame.command {
            let (name, data) = parse_command(&frame.body)?;
            if name == "PING" {
                // Skip the 2-byte TTL
                let context = data.get(2..).unwrap_or_default().to_vec();
                return Ok(Incoming::Ping { context });
            }
            continue;
        }

        parts.push(frame.body);
        if !frame.more {
            return Ok(Incoming::Message(parts));
        }
    }
}

/// Answer a PING with a PONG carrying the same context.
pub fn write_pong<W: Write>(w: &mut W, context: &[u8]) -> Result<(), ZmtpError> {
    write_frame(w, &command_body("PONG", context), false, true)?;
    w.flush()?;
    Ok(())
}

/// Separate the routing envelope (every frame up to and including the empty
/// delimiter) from the message body. Body frames are concatenated.
pub fn split_envelope(mut parts: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<u8>) {
    match parts.iter().position(|p| p.is_empty()) {
        Some(delim) => {
            let body = parts.split_off(delim + 1).concat();
            (parts, body)
        }
        None => (Vec::new(), parts.concat()),
    }
}

/// Convert a `tcp://host:port` endpoint into a `host:port` socket address string,
/// substituting `wildcard` for a `*` host.
pub fn parse_tcp_endpoint(endpoint: &str, wildcard: &str) -> Result<String, ZmtpError> {
    let invalid = || ZmtpError::InvalidEndpoint(endpoint.to_owned());

    let rest = endpoint.strip_prefix("tcp://").ok_or_else(invalid)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() {
        return Err(invalid());
    }

    let host = if host == "*" { wildcard } else { host };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn greeting_is_accepted() {
        let g = greeting();
        check_greeting(&g).unwrap();

        let mut curve = greeting();
        curve[12..17].copy_from_slice(b"CURVE");
        assert!(matches!(
            check_greeting(&curve),
            Err(ZmtpError::UnsupportedMechanism(m)) if m == "CURVE"
        ));

        let mut old = greeting();
        old[10] = 2;
        assert!(matches!(
            check_greeting(&old),
            Err(ZmtpError::UnsupportedVersion(2, _))
        ));
    }

    #[test]
    fn frames_use_short_and_long_sizes() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc", true, false).unwrap();
        assert_eq!(&buf[..2], &[FLAG_MORE, 3]);

        let long_body = vec![7_u8; 300];
        write_frame(&mut buf, &long_body, false, false).unwrap();

        let mut cursor = Cursor::new(buf);
        let short = read_frame(&mut cursor).unwrap();
        assert!(short.more);
        assert_eq!(short.body, b"abc");

        let long = read_frame(&mut cursor).unwrap();
        assert!(!long.more);
        assert_eq!(long.body, long_body);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = vec![FLAG_LONG];
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let result = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(ZmtpError::FrameTooLarge(_))));
    }

    #[test]
    fn ready_properties_round_trip() {
        let body = ready_command(SocketType::Rep);
        let (name, data) = parse_command(&body).unwrap();
        assert_eq!(name, "READY");
        let props = parse_properties(data).unwrap();
        assert_eq!(props["Socket-Type"], b"REP");
    }

    #[test]
    fn reads_messages_and_pings() {
        let mut buf = Vec::new();
        // TTL of 0 followed by a context
        let mut ping = vec![0_u8, 0];
        ping.extend_from_slice(b"ctx");
        write_frame(&mut buf, &command_body("PING", &ping), false, true).unwrap();
        write_multipart(&mut buf, &[b"".as_slice(), b"1.0,1.0".as_slice()]).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_incoming(&mut cursor).unwrap(),
            Incoming::Ping {
                context: b"ctx".to_vec()
            }
        );
        match read_incoming(&mut cursor).unwrap() {
            Incoming::Message(parts) => {
                let (envelope, body) = split_envelope(parts);
                assert_eq!(envelope, vec![Vec::<u8>::new()]);
                assert_eq!(body, b"1.0,1.0");
            }
            other => panic!("Expected message, got {other:?}"),
        }
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            parse_tcp_endpoint("tcp://*:5555", "0.0.0.0").unwrap(),
            "0.0.0.0:5555"
        );
        assert_eq!(
            parse_tcp_endpoint("tcp://localhost:80", "0.0.0.0").unwrap(),
            "localhost:80"
        );
        for bad in ["udp://*:5555", "tcp://*", "tcp://:5555", "tcp://*:port"] {
            assert!(
                parse_tcp_endpoint(bad, "0.0.0.0").is_err(),
                "`{bad}` should be rejected"
            );
        }
    }

    #[test]
    fn handshake_rejects_mismatched_socket_types() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            handshake(&mut stream, SocketType::Req)
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let client_result = handshake(&mut client, SocketType::Req);
        let server_result = server.join().unwrap();

        assert!(matches!(
            client_result,
            Err(ZmtpError::IncompatiblePeer { expected: "REP", .. })
        ));
        assert!(matches!(
            server_result,
            Err(ZmtpError::IncompatiblePeer { expected: "REP", .. })
        ));
    }
}
