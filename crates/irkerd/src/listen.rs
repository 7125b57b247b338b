//! The request listeners. One TCP acceptor and one UDP receiver share the same `(host, port)`;
//! both feed the relay one JSON request per line. Neither transport ever sends a response.

use crate::relay::Relay;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};

pub(crate) async fn tcp_task(listener: TcpListener, relay: Relay) {
    loop {
        match listener.accept().await {
            Err(err) => {
                warn!("accept failed: {}", err);
            }
            Ok((sock, peer)) => {
                debug!("request stream from {}", peer);
                let relay = relay.clone();
                tokio::task::spawn_local(async move {
                    // Each stream carries a sequence of newline-terminated requests.
                    let mut lines = BufReader::new(sock).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => relay.handle(&line, false),
                            Ok(None) => break,
                            Err(err) => {
                                debug!("request stream from {} failed: {}", peer, err);
                                break;
                            }
                        }
                    }
                });
            }
        }
    }
}

pub(crate) async fn udp_task(socket: UdpSocket, relay: Relay) {
    // One request per datagram, trailing newline optional.
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Err(err) => {
                warn!("datagram receive failed: {}", err);
            }
            Ok((len, _peer)) => match std::str::from_utf8(&buf[..len]) {
                Ok(line) => relay.handle(line, false),
                Err(err) => error!("irkerd: datagram is not valid UTF-8: {}", err),
            },
        }
    }
}
