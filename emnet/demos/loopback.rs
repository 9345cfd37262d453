//! Two stacks joined by an in-memory wire.
//!
//! One host runs an echo service on port 7, the other connects to it, sends a line and prints
//! what comes back. Frames are carried between the hosts by copying them out of the capture of one
//! device into the receive queue of the other.
use std::sync::{Arc, Mutex};

use emnet::layer::tcp::TcpStream;
use emnet::layer::NetifConfig;
use emnet::nic::external::{Capture, External};
use emnet::nic::RxHandle;
use emnet::stream::{Direction, Stream, WriteFlags};
use emnet::time::{Duration, Instant};
use emnet::wire::{EthernetAddress, Ipv4Address, Ipv4Cidr};
use emnet::{Config, Stack};

const SERVER: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const CLIENT: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);
const MESSAGE: &[u8] = b"hello through the wire\n";

struct Host {
    stack: Stack,
    rx: RxHandle,
    capture: Capture,
}

impl Host {
    fn new(mac: EthernetAddress, addr: Ipv4Address) -> Host {
        let mut stack = Stack::new(Config::default());
        let (device, capture) = External::new();
        let config = NetifConfig::new(mac, Ipv4Cidr::new(addr, 24));
        let (_, rx) = stack.attach(config, Box::new(device))
            .expect("a fresh stack has room for an interface");
        Host { stack, rx, capture }
    }

    /// Move every frame this host sent over to `other`.
    fn carry(&self, other: &Host) {
        while let Some(frame) = self.capture.next_frame() {
            match other.stack.pool().alloc_from(0, &frame) {
                Some(pb) => other.rx.receive(pb),
                None => eprintln!("pool exhausted, dropping a frame"),
            }
        }
    }
}

fn main() {
    let mut server = Host::new(EthernetAddress([0x02, 0, 0, 0, 0, 1]), SERVER);
    let mut client = Host::new(EthernetAddress([0x02, 0, 0, 0, 0, 2]), CLIENT);

    let accepted = Arc::new(Mutex::new(Vec::<TcpStream>::new()));
    let queue = accepted.clone();
    server.stack.tcp_listen(7, Box::new(move |stream| {
        queue.lock().unwrap().push(stream)
    })).expect("port 7 is free");

    let mut stream = client.stack.tcp_connect(SERVER, 7).expect("server is on link");
    let mut sent = false;
    let mut received = Vec::new();

    let mut now = Instant::ZERO;
    for _ in 0..1000 {
        server.stack.poll(now);
        client.stack.poll(now);
        server.carry(&client);
        client.carry(&server);

        for echo in accepted.lock().unwrap().iter_mut() {
            if echo.poll(Direction::Read).is_some() {
                continue;
            }
            let mut buf = [0; 256];
            match echo.read(&mut buf, 1) {
                Ok(count) => {
                    echo.write(&buf[..count], WriteFlags::NO_WAIT).ok();
                },
                Err(_) => echo.close(),
            }
        }

        if !sent && stream.poll(Direction::Write).is_none() {
            stream.write(MESSAGE, WriteFlags::NO_WAIT).expect("connection is open");
            sent = true;
        }

        if stream.poll(Direction::Read).is_none() {
            let mut buf = [0; 256];
            if let Ok(count) = stream.read(&mut buf, 1) {
                received.extend_from_slice(&buf[..count]);
            }
            if received.len() >= MESSAGE.len() {
                break;
            }
        }

        now += Duration::from_millis(1);
    }

    print!("{}", String::from_utf8_lossy(&received));
    for info in client.stack.tcp_connections() {
        println!("{}:{} -> {}:{} {} rto={}ms",
            info.local_addr, info.local_port, info.remote_addr, info.remote_port,
            info.state, info.rto.as_millis());
    }

    stream.close();
    client.stack.poll(now);
}
