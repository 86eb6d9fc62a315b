//! TCP networking on top of the event loop: acceptor, connector, the
//! connection state machine, and the server/client that wire them up.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

mod acceptor;
mod client;
mod connection;
mod connector;
mod server;
pub(crate) mod sock;

pub use self::acceptor::Acceptor;
pub use self::client::TcpClient;
pub use self::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, ConnectionState,
    HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use self::connector::Connector;
pub use self::server::TcpServer;

/// Resolves `host` to a socket address, blocking on the system resolver.
///
/// Returns the first address the resolver yields.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"))
}
