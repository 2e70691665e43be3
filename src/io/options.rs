//! Socket options applied through socket2.

use serde::Deserialize;
use socket2::SockRef;
use std::io;
use std::time::Duration;

/// A single socket option with its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    ReceiveBufferSize(usize),
    SendBufferSize(usize),
    ReuseAddress(bool),
    KeepAlive(bool),
    Linger(Option<Duration>),
    NoDelay(bool),
}

/// Option name without a value, for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    ReceiveBufferSize,
    SendBufferSize,
    ReuseAddress,
    KeepAlive,
    Linger,
    NoDelay,
}

impl SocketOption {
    pub fn kind(&self) -> OptionKind {
        match self {
            SocketOption::ReceiveBufferSize(_) => OptionKind::ReceiveBufferSize,
            SocketOption::SendBufferSize(_) => OptionKind::SendBufferSize,
            SocketOption::ReuseAddress(_) => OptionKind::ReuseAddress,
            SocketOption::KeepAlive(_) => OptionKind::KeepAlive,
            SocketOption::Linger(_) => OptionKind::Linger,
            SocketOption::NoDelay(_) => OptionKind::NoDelay,
        }
    }

    pub fn apply(&self, socket: &SockRef<'_>) -> io::Result<()> {
        match *self {
            SocketOption::ReceiveBufferSize(size) => socket.set_recv_buffer_size(size),
            SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(size),
            SocketOption::ReuseAddress(on) => socket.set_reuse_address(on),
            SocketOption::KeepAlive(on) => socket.set_keepalive(on),
            SocketOption::Linger(linger) => socket.set_linger(linger),
            SocketOption::NoDelay(on) => socket.set_nodelay(on),
        }
    }

    pub fn read(kind: OptionKind, socket: &SockRef<'_>) -> io::Result<Self> {
        Ok(match kind {
            OptionKind::ReceiveBufferSize => SocketOption::ReceiveBufferSize(socket.recv_buffer_size()?),
            OptionKind::SendBufferSize => SocketOption::SendBufferSize(socket.send_buffer_size()?),
            OptionKind::ReuseAddress => SocketOption::ReuseAddress(socket.reuse_address()?),
            OptionKind::KeepAlive => SocketOption::KeepAlive(socket.keepalive()?),
            OptionKind::Linger => SocketOption::Linger(socket.linger()?),
            OptionKind::NoDelay => SocketOption::NoDelay(socket.nodelay()?),
        })
    }
}

/// Options applied to a socket before bind or connect.
///
/// Unset fields leave the OS default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub reuse_address: Option<bool>,
    pub keepalive: Option<bool>,
    /// Linger in seconds.
    pub linger_secs: Option<u64>,
    pub nodelay: Option<bool>,
}

impl SocketOptions {
    /// The set options, in a fixed order.
    pub fn to_list(&self) -> Vec<SocketOption> {
        let mut options = Vec::new();
        if let Some(size) = self.receive_buffer_size {
            options.push(SocketOption::ReceiveBufferSize(size));
        }
        if let Some(size) = self.send_buffer_size {
            options.push(SocketOption::SendBufferSize(size));
        }
        if let Some(on) = self.reuse_address {
            options.push(SocketOption::ReuseAddress(on));
        }
        if let Some(on) = self.keepalive {
            options.push(SocketOption::KeepAlive(on));
        }
        if let Some(secs) = self.linger_secs {
            options.push(SocketOption::Linger(Some(Duration::from_secs(secs))));
        }
        if let Some(on) = self.nodelay {
            options.push(SocketOption::NoDelay(on));
        }
        options
    }

    pub fn apply(&self, socket: &SockRef<'_>) -> io::Result<()> {
        for option in self.to_list() {
            option.apply(socket)?;
        }
        Ok(())
    }
}
