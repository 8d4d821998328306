//! A three-turbine row steered over a local TCP link.
//!
//! Demonstrated here:
//!   * Running the server with the wake steering controller on its own thread
//!   * Emulating ROSCO turbine controllers with the bundled REQ client
//!   * Disconnecting every turbine to shut the server down

use std::thread;
use std::time::Duration;

use wfc::socket::{Transport, ZmtpRepSocket};
use wfc::strategy::{WakeSteeringConfig, WakeSteeringController, YawLookup};
use wfc::{Server, ServerConfig};
use wfc_shared::client::ReqClient;
use wfc_shared::{ChannelMap, Schema};

const N_TURBINES: u32 = 3;

fn main() {
    // Bind on any free port and find out which one we got
    let mut socket = ZmtpRepSocket::new("tcp://127.0.0.1:0");
    socket.open().unwrap();
    let endpoint = format!("tcp://{}", socket.local_addr().unwrap());

    // Steer the two upstream turbines; warm up for 20 s and update every 5 s
    let lookup = YawLookup::new(
        vec![6.0, 8.0, 10.0],
        vec![
            vec![20.0, 15.0, 5.0],
            vec![12.0, 8.0, 2.0],
            vec![0.0, 0.0, 0.0],
        ],
    )
    .unwrap();
    let tuning = WakeSteeringConfig {
        warmup_s: 20.0,
        update_rate_s: 5.0,
        ..Default::default()
    };
    let controller = WakeSteeringController::new(tuning, Box::new(lookup)).unwrap();

    let cfg = ServerConfig {
        timeout_s: 10.0,
        verbose: false,
        ..Default::default()
    };
    let mut server = Server::new(
        cfg,
        Schema::default(),
        Box::new(socket),
        Some(Box::new(controller)),
    )
    .unwrap();
    let server_thread = thread::spawn(move || server.run());

    // Connect the turbines and step them together, like FAST.Farm does
    let schema = Schema::default();
    let mut turbines: Vec<ReqClient> = (0..N_TURBINES)
        .map(|_| ReqClient::connect(&endpoint, Duration::from_secs(10)).unwrap())
        .collect();

    let mut t = 0.0;
    while t <= 40.0 {
        let mut yaw = Vec::new();
        for (i, client) in turbines.iter_mut().enumerate() {
            let measurements = ChannelMap::from([
                ("ZMQ_ID".to_owned(), (i + 1) as f64),
                ("iStatus".to_owned(), 1.0),
                ("Time".to_owned(), t),
                ("HorWindV".to_owned(), 7.0 + 0.05 * t),
            ]);
            let setpoints = client.exchange(&schema, &measurements).unwrap();
            yaw.push(setpoints["ZMQ_YawOffset"]);
        }
        println!("t = {t:4.1} s  yaw offsets = {yaw:?} deg");
        t += 1.0;
    }

    // Tell the server every turbine is done
    for (i, client) in turbines.iter_mut().enumerate() {
        let bye = ChannelMap::from([
            ("ZMQ_ID".to_owned(), (i + 1) as f64),
            ("iStatus".to_owned(), -1.0),
            ("Time".to_owned(), t),
        ]);
        client.exchange(&schema, &bye).unwrap();
    }

    server_thread.join().unwrap().unwrap();
}
