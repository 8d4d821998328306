//! Request/reply serving loop.
//!
//! The server waits for one request at a time, decodes it, updates the
//! sender's session, asks the control strategy for setpoints and replies to
//! the same peer. It stops once every turbine it has seen has announced a
//! disconnect. Every other way out of the loop is an error, and the transport
//! is closed before the error is returned.

use std::fmt::Display;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, error, info};

use wfc_shared::codec::{decode_measurements, encode_setpoints, turbine_id};
use wfc_shared::{ChannelMap, Schema, TIME_CHANNEL, TurbineId};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::logging;
use crate::registry::Registry;
use crate::socket::{Request, Transport, ZmtpRepSocket};
use crate::strategy::ControlStrategy;

/// Where the serving loop is in its cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for the next request
    Listening,
    /// Handling a request
    Processing,
    /// Transport closed; no further requests are received
    Shutdown,
}

/// Wind farm controller server
pub struct Server {
    cfg: ServerConfig,
    timeout: Duration,
    state: ServerState,
    registry: Registry,
    transport: Box<dyn Transport>,
    strategy: Option<Box<dyn ControlStrategy>>,
}

impl Server {
    /// Set up logging and open the transport, if it isn't open already.
    ///
    /// A server without a strategy can be built, but fails on its first request.
    pub fn new(
        cfg: ServerConfig,
        schema: Schema,
        mut transport: Box<dyn Transport>,
        strategy: Option<Box<dyn ControlStrategy>>,
    ) -> Result<Self, ServerError> {
        cfg.validate()?;
        schema.validate()?;
        let timeout = cfg.timeout()?;
        logging::init_logging(cfg.logfile.as_deref()).map_err(ServerError::Configuration)?;

        if !transport.is_open() {
            transport.open()?;
        }

        let server = Self {
            cfg,
            timeout,
            state: ServerState::Listening,
            registry: Registry::new(schema),
            transport,
            strategy,
        };
        info!(
            "Server listening on {} with a {:?} timeout",
            server.transport.address(),
            server.timeout
        );
        server.narrate(format!("Listening on {}", server.transport.address()));

        Ok(server)
    }

    /// Bind a ZeroMQ-compatible REP socket on the configured address.
    pub fn bind(
        cfg: ServerConfig,
        schema: Schema,
        strategy: Option<Box<dyn ControlStrategy>>,
    ) -> Result<Self, ServerError> {
        let socket = ZmtpRepSocket::new(&cfg.address);
        Self::new(cfg, schema, Box::new(socket), strategy)
    }

    /// Serve requests until every turbine has disconnected.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while self.state != ServerState::Shutdown {
            self.step()?;
        }
        Ok(())
    }

    /// Wait for and serve a single request, returning the state afterwards.
    /// Once shut down, returns immediately without receiving.
    ///
    /// A request that cannot be decoded is fatal: the transport is closed and
    /// `ServerError::Decode` is returned.
    pub fn step(&mut self) -> Result<ServerState, ServerError> {
        if self.state == ServerState::Shutdown {
            return Ok(self.state);
        }

        self.state = ServerState::Listening;
        debug!("Waiting for a request");
        let request = match self.transport.recv(self.timeout) {
            Ok(Some(request)) => request,
            Ok(None) => {
                let err = ServerError::Timeout {
                    address: self.transport.address(),
                    timeout: self.timeout,
                };
                return Err(self.fail(err));
            }
            Err(e) => return Err(self.fail(e.into())),
        };

        self.state = ServerState::Processing;
        if let Err(e) = self.serve_one(&request) {
            return Err(self.fail(e));
        }

        if self.registry.connected_count() == 0 {
            info!("All turbines have disconnected");
            self.narrate("All turbines have disconnected");
            self.shutdown();
        } else {
            self.state = ServerState::Listening;
        }

        Ok(self.state)
    }

    /// Decode, update, compute and reply for one request.
    fn serve_one(&mut self, request: &Request) -> Result<(), ServerError> {
        let raw = String::from_utf8_lossy(request.payload());
        let raw = raw.trim_end_matches('\0');
        info!("Received request from peer {}: {raw}", request.peer);
        self.narrate(format!("Received request: {raw}"));

        let measurements = decode_measurements(self.registry.schema(), request.payload())?;
        let id = turbine_id(&measurements)?;
        let current_time = measurements.get(TIME_CHANNEL).copied().unwrap_or_default();
        info!("Decoded measurements from turbine {id} at t = {current_time} s: {measurements:?}");
        self.narrate(format!(
            "Decoded measurements from turbine {id} at t = {current_time} s: {measurements:?}"
        ));

        self.registry.register(id);
        self.registry.update_measurements(id, measurements)?;

        let strategy = self.strategy.as_mut().ok_or_else(|| {
            ServerError::Configuration("No control strategy has been set".to_owned())
        })?;
        let session = self
            .registry
            .get(id)
            .ok_or(ServerError::UnknownTurbine(id))?;
        let computed = strategy.update(id, current_time, &session.measurements);
        info!("Computed setpoints for turbine {id}: {computed:?}");
        self.narrate(format!("Computed setpoints for turbine {id}: {computed:?}"));

        // Every setpoint in the schema is overwritten; ones the strategy omits are zeroed
        let setpoints: Vec<(String, f64)> = self
            .registry
            .schema()
            .setpoints
            .iter()
            .map(|ch| (ch.clone(), computed.get(ch).copied().unwrap_or(0.0)))
            .collect();
        for (channel, value) in &setpoints {
            self.registry.set_setpoint(id, channel, *value)?;
        }

        let reply = self.encode_reply(id)?;
        self.transport.reply(request.peer, reply.as_bytes())?;
        info!("Sent setpoints to turbine {id}: {reply}");
        self.narrate(format!("Sent setpoints to turbine {id}: {reply}"));

        Ok(())
    }

    fn encode_reply(&self, id: TurbineId) -> Result<String, ServerError> {
        let session = self
            .registry
            .get(id)
            .ok_or(ServerError::UnknownTurbine(id))?;
        Ok(encode_setpoints(self.registry.schema(), &session.setpoints))
    }

    /// Log a fatal error and shut down before handing it back.
    fn fail(&mut self, err: ServerError) -> ServerError {
        error!("{err}");
        self.narrate(format!("Error: {err}"));
        self.shutdown();
        err
    }

    /// Close the transport. No requests are received afterwards.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::Shutdown {
            return;
        }
        self.transport.close();
        self.state = ServerState::Shutdown;
        info!("Server on {} shut down", self.transport.address());
        self.narrate("Shut down");
    }

    /// Print a timestamped progress line in verbose mode.
    fn narrate(&self, msg: impl Display) {
        if self.cfg.verbose {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            println!("[{now}] {msg}");
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Sessions of every turbine seen so far
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Address of the underlying transport
    pub fn address(&self) -> String {
        self.transport.address()
    }

    /// Setpoints most recently sent to a turbine
    pub fn setpoints(&self, id: TurbineId) -> Option<&ChannelMap> {
        self.registry.get(id).map(|s| &s.setpoints)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use wfc_shared::codec::encode_measurements;
    use wfc_shared::DecodeError;

    use crate::socket::{ChannelClient, ChannelTransport};

    const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

    fn quiet_config() -> ServerConfig {
        ServerConfig {
            timeout_s: 5.0,
            ..Default::default()
        }
    }

    fn no_setpoints() -> Option<Box<dyn ControlStrategy>> {
        Some(Box::new(|_: TurbineId, _: f64, _: &ChannelMap| {
            ChannelMap::new()
        }))
    }

    /// A schema-ordered measurement line from a turbine
    fn line(schema: &Schema, id: TurbineId, status: f64, time: f64) -> Vec<u8> {
        let m = ChannelMap::from([
            ("ZMQ_ID".to_owned(), id as f64),
            ("iStatus".to_owned(), status),
            ("Time".to_owned(), time),
            ("HorWindV".to_owned(), 8.0),
        ]);
        encode_measurements(schema, &m).into_bytes()
    }

    /// Server on a channel transport with `n` clients
    fn channel_server(
        n: usize,
        schema: Schema,
        strategy: Option<Box<dyn ControlStrategy>>,
    ) -> (Server, Vec<ChannelClient>) {
        let transport = ChannelTransport::new("server-test");
        let clients = (0..n).map(|_| transport.client()).collect();
        let server = Server::new(quiet_config(), schema, Box::new(transport), strategy).unwrap();
        (server, clients)
    }

    fn reply_fields(reply: &[u8]) -> Vec<String> {
        String::from_utf8(reply.to_vec())
            .unwrap()
            .split(", ")
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn replies_with_zeros_when_strategy_sets_nothing() {
        let schema = Schema::default();
        let (mut server, clients) = channel_server(2, schema.clone(), no_setpoints());

        for (i, client) in clients.iter().enumerate() {
            client.send(&line(&schema, i as u32 + 1, 1.0, 0.0)).unwrap();
            assert_eq!(server.step().unwrap(), ServerState::Listening);

            let reply = client.recv_reply(REPLY_TIMEOUT).unwrap();
            let fields = reply_fields(&reply);
            assert_eq!(fields.len(), schema.num_setpoints());
            for f in fields {
                assert_eq!(f, "0000000000.00000");
            }
        }

        assert_eq!(server.registry().connected_count(), 2);
        assert_eq!(server.registry().len(), 2);
    }

    #[test]
    fn shuts_down_once_every_turbine_disconnects() {
        let schema = Schema::default();
        let (mut server, clients) = channel_server(1, schema.clone(), no_setpoints());
        let client = &clients[0];

        client.send(&line(&schema, 1, 1.0, 0.0)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Listening);
        client.recv_reply(REPLY_TIMEOUT).unwrap();

        client.send(&line(&schema, 1, -1.0, 0.1)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Shutdown);
        // The disconnecting turbine still gets its reply
        assert!(client.recv_reply(REPLY_TIMEOUT).is_some());
        assert_eq!(server.registry().connected_count(), 0);

        // Nothing is received once shut down
        client.send(&line(&schema, 1, 1.0, 0.2)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Shutdown);
        assert!(client.recv_reply(Duration::from_millis(50)).is_none());
        assert_eq!(server.registry().get(1).unwrap().requests, 2);
    }

    #[test]
    fn keeps_serving_while_any_turbine_is_connected() {
        let schema = Schema::default();
        let (mut server, clients) = channel_server(2, schema.clone(), no_setpoints());

        clients[0].send(&line(&schema, 1, 1.0, 0.0)).unwrap();
        server.step().unwrap();
        clients[1].send(&line(&schema, 2, 1.0, 0.0)).unwrap();
        server.step().unwrap();

        clients[0].send(&line(&schema, 1, -1.0, 0.1)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Listening);
        assert_eq!(server.registry().connected_count(), 1);

        clients[1].send(&line(&schema, 2, -1.0, 0.1)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Shutdown);
    }

    #[test]
    fn missing_setpoints_are_zeroed() {
        let schema = Schema::new(
            Schema::default().measurements,
            vec!["ZMQ_YawOffset".to_owned(), "ZMQ_PitOffset(1)".to_owned()],
        )
        .unwrap();
        let strategy: Box<dyn ControlStrategy> =
            Box::new(|_: TurbineId, _: f64, _: &ChannelMap| {
                ChannelMap::from([("ZMQ_YawOffset".to_owned(), -7.25)])
            });
        let (mut server, clients) = channel_server(1, schema.clone(), Some(strategy));

        clients[0].send(&line(&schema, 3, 1.0, 0.0)).unwrap();
        server.step().unwrap();

        let reply = clients[0].recv_reply(REPLY_TIMEOUT).unwrap();
        assert_eq!(reply, b"-000000007.25000, 0000000000.00000");
        let setpoints = server.setpoints(3).unwrap();
        assert_eq!(setpoints["ZMQ_YawOffset"], -7.25);
        assert_eq!(setpoints["ZMQ_PitOffset(1)"], 0.0);
    }

    #[test]
    fn strategy_sees_latest_measurements() {
        let schema = Schema::default();
        let calls: Arc<Mutex<Vec<(TurbineId, f64, f64)>>> = Arc::default();
        let recorded = calls.clone();
        let strategy: Box<dyn ControlStrategy> =
            Box::new(move |id: TurbineId, t: f64, m: &ChannelMap| {
                recorded.lock().unwrap().push((id, t, m["Time"]));
                ChannelMap::new()
            });
        let (mut server, clients) = channel_server(1, schema.clone(), Some(strategy));

        for t in [0.0, 0.05, 0.1] {
            clients[0].send(&line(&schema, 4, 1.0, t)).unwrap();
            server.step().unwrap();
            clients[0].recv_reply(REPLY_TIMEOUT).unwrap();
            assert_eq!(server.registry().get(4).unwrap().measurements["Time"], t);
        }

        assert_eq!(
            *calls.lock().unwrap(),
            vec![(4, 0.0, 0.0), (4, 0.05, 0.05), (4, 0.1, 0.1)]
        );
    }

    #[test]
    fn times_out_and_closes_transport() {
        let cfg = ServerConfig {
            timeout_s: 0.05,
            ..Default::default()
        };
        let transport = ChannelTransport::new("idle");
        let mut server =
            Server::new(cfg, Schema::default(), Box::new(transport), no_setpoints()).unwrap();

        match server.run() {
            Err(ServerError::Timeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(50))
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(server.state(), ServerState::Shutdown);
    }

    #[test]
    fn missing_strategy_fails_on_first_request() {
        let schema = Schema::default();
        let (mut server, clients) = channel_server(1, schema.clone(), None);

        clients[0].send(&line(&schema, 1, 1.0, 0.0)).unwrap();
        assert!(matches!(
            server.step(),
            Err(ServerError::Configuration(_))
        ));
        assert_eq!(server.state(), ServerState::Shutdown);

        // The session was recorded before the strategy was needed
        let session = server.registry().get(1).unwrap();
        assert_eq!(session.requests, 1);
        assert!(clients[0].recv_reply(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn malformed_request_is_fatal() {
        let (mut server, clients) = channel_server(1, Schema::default(), no_setpoints());

        clients[0].send(b"1.0,2.0").unwrap();
        assert!(matches!(
            server.step(),
            Err(ServerError::Decode(DecodeError::FieldCount { .. }))
        ));
        assert_eq!(server.state(), ServerState::Shutdown);
        assert!(server.registry().is_empty());

        // No reply goes out and nothing more is received
        assert!(clients[0].recv_reply(Duration::from_millis(50)).is_none());
        clients[0].send(&line(&Schema::default(), 1, 1.0, 0.0)).unwrap();
        assert_eq!(server.step().unwrap(), ServerState::Shutdown);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let cfg = ServerConfig {
            timeout_s: 0.0,
            ..Default::default()
        };
        let transport = ChannelTransport::new("never-opened");
        assert!(matches!(
            Server::new(cfg, Schema::default(), Box::new(transport), no_setpoints()),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn run_serves_concurrent_turbines_until_disconnect() {
        let schema = Schema::default();
        let (mut server, clients) = channel_server(3, schema.clone(), no_setpoints());

        // Every turbine checks in before any of them can finish
        for (i, client) in clients.iter().enumerate() {
            client.send(&line(&schema, i as TurbineId + 1, 1.0, 0.0)).unwrap();
            server.step().unwrap();
            client.recv_reply(REPLY_TIMEOUT).unwrap();
        }

        let handles: Vec<_> = clients
            .into_iter()
            .enumerate()
            .map(|(i, client)| {
                let schema = schema.clone();
                thread::spawn(move || {
                    let id = i as TurbineId + 1;
                    for k in 1..20 {
                        let req = line(&schema, id, 1.0, k as f64 * 0.05);
                        client.request(&req, REPLY_TIMEOUT).unwrap();
                    }
                    let bye = line(&schema, id, -1.0, 1.0);
                    client.request(&bye, REPLY_TIMEOUT).unwrap();
                })
            })
            .collect();

        server.run().unwrap();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(server.state(), ServerState::Shutdown);
        assert_eq!(server.registry().len(), 3);
        for session in server.registry().sessions() {
            assert_eq!(session.requests, 21);
            assert!(!session.connected);
        }
    }
}
