//! Minimal end-to-end demo: two connections sharing an in-memory duplex
//! pipe, one sending a message at high priority, the other printing it
//! as soon as it is fully received.
//!
//! There is no network transport in this crate (see `src/socket.rs`) so
//! this demo stands in for the echo-server demos a real binding would
//! ship: plug a `FramedSocket` impl over your WebSocket/QUIC/whatever of
//! choice in place of `DuplexFramedSocket` and the rest is unchanged.

use log::info;
use mux_socket::callback::MessageEvent;
use mux_socket::config::TransportConfig;
use mux_socket::connection::Connection;
use mux_socket::message::Message;
use mux_socket::socket::DuplexFramedSocket;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();

    let (client_pipe, server_pipe) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_pipe);
    let (server_read, server_write) = tokio::io::split(server_pipe);

    let client_socket = Arc::new(DuplexFramedSocket::new(client_read, client_write));
    let server_socket = Arc::new(DuplexFramedSocket::new(server_read, server_write));

    let client = Connection::new(client_socket, TransportConfig::default(), "client", true);
    let server = Connection::new(server_socket, TransportConfig::default(), "server", true);

    server.register_callback(
        MessageEvent::COMPLETE,
        Arc::new(|message, _events| {
            info!("server received: {:?}", String::from_utf8_lossy(&message.payload()));
        }),
    );
    server.begin_dispatch();

    let payload = b"hello from the client".to_vec();
    let message = Message::new_outgoing(payload, None);

    client
        .send_message(message, 0, None)
        .await
        .expect("priority 0 is in range and the connection is open");

    tokio::time::sleep(Duration::from_millis(250)).await;

    client.force_close("demo finished", true).await;
    server.force_close("demo finished", true).await;
}
