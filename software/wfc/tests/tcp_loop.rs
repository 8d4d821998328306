//! Full control loop over TCP: several turbine emulators talk to a server
//! running the wake steering controller, as a FAST.Farm run would.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use wfc::socket::{Transport, ZmtpRepSocket};
use wfc::strategy::{WakeSteeringConfig, WakeSteeringController, YawLookup};
use wfc::{Server, ServerConfig, ServerState};
use wfc_shared::client::ReqClient;
use wfc_shared::{ChannelMap, Schema};

const N_TURBINES: u32 = 3;
const DT: f64 = 1.0;
const T_END: f64 = 90.0;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn measurements(id: u32, status: f64, time: f64) -> ChannelMap {
    ChannelMap::from([
        ("ZMQ_ID".to_owned(), id as f64),
        ("iStatus".to_owned(), status),
        ("Time".to_owned(), time),
        ("HorWindV".to_owned(), 8.0),
        ("VS_GenPwr".to_owned(), 5.0e6),
    ])
}

/// Run one turbine to the end of the simulation in lockstep with the others,
/// returning the yaw offset it was told to use at every step.
fn turbine(endpoint: String, id: u32, step: Arc<Barrier>) -> Vec<(f64, f64)> {
    let schema = Schema::default();
    let mut client = ReqClient::connect(&endpoint, CLIENT_TIMEOUT).unwrap();

    let mut yaw = Vec::new();
    let mut t = 0.0;
    while t <= T_END {
        let setpoints = client.exchange(&schema, &measurements(id, 1.0, t)).unwrap();
        assert_eq!(setpoints.len(), schema.num_setpoints());
        assert_eq!(setpoints["ZMQ_PitOffset(1)"], 0.0);
        yaw.push((t, setpoints["ZMQ_YawOffset"]));
        t += DT;
        step.wait();
    }

    client
        .exchange(&schema, &measurements(id, -1.0, t))
        .unwrap();
    yaw
}

#[test]
fn wake_steering_over_tcp() {
    let mut socket = ZmtpRepSocket::new("tcp://127.0.0.1:0");
    socket.open().unwrap();
    let endpoint = format!("tcp://{}", socket.local_addr().unwrap());

    let lookup = YawLookup::new(
        vec![6.0, 10.0],
        vec![vec![20.0, 10.0], vec![10.0, 0.0], vec![0.0, 0.0]],
    )
    .unwrap();
    let controller =
        WakeSteeringController::new(WakeSteeringConfig::default(), Box::new(lookup)).unwrap();

    let cfg = ServerConfig {
        timeout_s: 10.0,
        ..Default::default()
    };
    let mut server = Server::new(
        cfg,
        Schema::default(),
        Box::new(socket),
        Some(Box::new(controller)),
    )
    .unwrap();

    let step = Arc::new(Barrier::new(N_TURBINES as usize));
    let turbines: Vec<_> = (1..=N_TURBINES)
        .map(|id| {
            let endpoint = endpoint.clone();
            let step = step.clone();
            thread::spawn(move || turbine(endpoint, id, step))
        })
        .collect();

    server.run().unwrap();
    assert_eq!(server.state(), ServerState::Shutdown);

    let yaw: Vec<Vec<(f64, f64)>> = turbines.into_iter().map(|t| t.join().unwrap()).collect();

    // Nothing is steered during warm-up
    for history in &yaw {
        for &(t, offset) in history.iter().filter(|(t, _)| *t < 60.0) {
            assert_eq!(offset, 0.0, "unexpected steering at t = {t}");
        }
    }

    // Turbine 1 sees the update triggered by its own request at t = 60.
    // The others may be served before turbine 1 within that timestep,
    // so only check them from the following step on.
    let at = |id: usize, t: f64| yaw[id].iter().find(|(tt, _)| *tt == t).unwrap().1;
    assert_eq!(at(0, 60.0), 15.0);
    assert_eq!(at(0, T_END), 15.0);
    assert_eq!(at(1, 61.0), 5.0);
    assert_eq!(at(2, 61.0), 0.0);

    let registry = server.registry();
    assert_eq!(registry.len(), N_TURBINES as usize);
    assert_eq!(registry.connected_count(), 0);
    for session in registry.sessions() {
        assert_eq!(session.requests, (T_END / DT) as u64 + 2);
    }
}

#[test]
fn times_out_when_no_turbine_connects() {
    let cfg = ServerConfig {
        address: "tcp://127.0.0.1:0".to_owned(),
        timeout_s: 0.2,
        ..Default::default()
    };
    let mut server = Server::bind(cfg, Schema::default(), None).unwrap();
    let err = server.run().unwrap_err();
    assert!(matches!(err, wfc::ServerError::Timeout { .. }), "{err}");
    assert_eq!(server.state(), ServerState::Shutdown);
}
