//! Socket plane. One poller thread owns every socket and the OS event
//! primitive; services drive it through `SocketServer`, which serialises
//! requests over a control channel and wakes the poll loop. Socket
//! readiness comes back as SOCKET-protocol messages to the owning service.

pub mod buffer;
mod poller;
mod slot;

pub use self::poller::Poller;
pub use self::slot::{SocketState, MAX_SOCKET};

use self::slot::SlotStates;
use crate::error::SocketError;
use crate::handle::ServiceHandle;
use crate::message::Payload;
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{unbounded, Sender};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use strand::logging::{self, Logger};

pub type SocketId = i32;

/// Event kinds delivered to socket owners. The set is part of the external
/// contract; the byte layout of the carrier message is not.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SocketEvent {
    /// Inbound bytes; `data` holds them.
    Data = 1,
    /// Connection established or resumed; `info` holds the peer address.
    Connect = 2,
    /// Terminal: orderly close.
    Close = 3,
    /// New inbound connection on a listener; `ud` is the accepted id.
    Accept = 4,
    /// Terminal: failure; `info` holds the reason.
    Error = 5,
    /// Datagram; `data` holds it, `info` the peer address.
    Udp = 6,
    /// Write queue crossed a threshold; `ud` is the size in KiB.
    Warning = 7,
}

impl SocketEvent {
    fn from_u8(raw: u8) -> Option<SocketEvent> {
        match raw {
            1 => Some(SocketEvent::Data),
            2 => Some(SocketEvent::Connect),
            3 => Some(SocketEvent::Close),
            4 => Some(SocketEvent::Accept),
            5 => Some(SocketEvent::Error),
            6 => Some(SocketEvent::Udp),
            7 => Some(SocketEvent::Warning),
            _ => None,
        }
    }
}

/// One socket event, encoded into a SOCKET-protocol message payload.
#[derive(Debug)]
pub struct SocketMessage {
    pub event: SocketEvent,
    pub id: SocketId,
    pub ud: i32,
    pub data: Box<[u8]>,
    pub info: String,
}

impl SocketMessage {
    pub fn event(event: SocketEvent, id: SocketId) -> SocketMessage {
        SocketMessage {
            event,
            id,
            ud: 0,
            data: Box::from(&[][..]),
            info: String::new(),
        }
    }

    pub fn encode(&self) -> Payload {
        let info = self.info.as_bytes();
        let mut out = vec![0u8; 11 + info.len() + self.data.len()];
        out[0] = self.event as u8;
        LittleEndian::write_i32(&mut out[1..5], self.id);
        LittleEndian::write_i32(&mut out[5..9], self.ud);
        LittleEndian::write_u16(&mut out[9..11], info.len() as u16);
        out[11..11 + info.len()].copy_from_slice(info);
        out[11 + info.len()..].copy_from_slice(&self.data);
        out.into()
    }

    pub fn decode(bytes: &[u8]) -> Option<SocketMessage> {
        if bytes.len() < 11 {
            return None;
        }
        let event = SocketEvent::from_u8(bytes[0])?;
        let id = LittleEndian::read_i32(&bytes[1..5]);
        let ud = LittleEndian::read_i32(&bytes[5..9]);
        let info_len = LittleEndian::read_u16(&bytes[9..11]) as usize;
        if bytes.len() < 11 + info_len {
            return None;
        }
        let info = String::from_utf8_lossy(&bytes[11..11 + info_len]).into_owned();
        let data = Box::from(&bytes[11 + info_len..]);
        Some(SocketMessage {
            event,
            id,
            ud,
            data,
            info,
        })
    }
}

/// Requests executed on the poller thread.
pub(crate) enum Ctrl {
    Listen {
        owner: ServiceHandle,
        id: SocketId,
        listener: TcpListener,
    },
    Connect {
        owner: ServiceHandle,
        id: SocketId,
        stream: TcpStream,
    },
    Bind {
        owner: ServiceHandle,
        id: SocketId,
        stream: TcpStream,
    },
    Udp {
        owner: ServiceHandle,
        id: SocketId,
        socket: UdpSocket,
    },
    Start {
        owner: ServiceHandle,
        id: SocketId,
    },
    Pause {
        id: SocketId,
    },
    Close {
        id: SocketId,
        force: bool,
    },
    Send {
        id: SocketId,
        data: Box<[u8]>,
        low: bool,
    },
    UdpSend {
        id: SocketId,
        peer: Option<SocketAddr>,
        data: Box<[u8]>,
    },
    UdpConnect {
        id: SocketId,
        peer: SocketAddr,
    },
    Nodelay {
        id: SocketId,
    },
    Exit,
}

/// Caller-side handle to the socket plane. Cheap to share; every method is
/// `&self` and thread-safe.
pub struct SocketServer {
    ctrl: Sender<Ctrl>,
    waker: mio::SetReadiness,
    states: Arc<SlotStates>,
    log: Logger,
}

/// Build the caller handle and the poller that will serve it. The poller
/// is handed to a dedicated thread by the runtime.
pub fn socket_pair(log: Logger) -> io::Result<(SocketServer, Poller)> {
    let (ctrl_tx, ctrl_rx) = unbounded();
    let (registration, waker) = mio::Registration::new2();
    let states = Arc::new(SlotStates::new());

    let poller = Poller::new(ctrl_rx, registration, waker.clone(), states.clone(), log.clone())?;
    let server = SocketServer {
        ctrl: ctrl_tx,
        waker,
        states,
        log,
    };

    Ok((server, poller))
}

fn resolve_addr(addr: &str) -> Result<SocketAddr, SocketError> {
    addr.to_socket_addrs()
        .map_err(|_| SocketError::BadAddress(addr.to_owned()))?
        .next()
        .ok_or_else(|| SocketError::BadAddress(addr.to_owned()))
}

fn host_port(host: &str, port: u16) -> String {
    match host {
        "" => format!("0.0.0.0:{}", port),
        host => format!("{}:{}", host, port),
    }
}

impl SocketServer {
    fn dispatch(&self, ctrl: Ctrl) {
        // The poller outlives every sender except during shutdown, where
        // dropped requests are fine.
        let _ = self.ctrl.send(ctrl);
        let _ = self.waker.set_readiness(mio::Ready::readable());
    }

    /// Probe the shared state mirror for send-style fast failures.
    fn check_writable(&self, id: SocketId) -> Result<(), SocketError> {
        let state = self.states.get(id);
        if state == SocketState::Invalid {
            return Err(SocketError::InvalidId(id));
        }
        if !state.writable() && state != SocketState::Listen && state != SocketState::PendingListen
        {
            return Err(SocketError::Closed(id));
        }
        Ok(())
    }

    /// Bind a listener. The bind happens on the calling thread so failures
    /// surface synchronously; the socket stays idle until `start`.
    pub fn listen(
        &self,
        owner: ServiceHandle,
        host: &str,
        port: u16,
        backlog: u32,
    ) -> Result<SocketId, SocketError> {
        let addr = resolve_addr(&host_port(host, port))?;
        let listener = TcpListener::bind(&addr)?;
        // Backlog is applied by the OS default under mio; kept for the API
        // contract and future tuning.
        let _ = backlog;

        let id = self.states.reserve()?;
        logging::debug!(self.log, "listener bound"; "socket" => id, "addr" => %addr);
        self.dispatch(Ctrl::Listen {
            owner,
            id,
            listener,
        });
        Ok(id)
    }

    /// Open an outbound connection. Completion (or failure) arrives as a
    /// CONNECT or ERROR event; the socket stays idle for reads until
    /// `start`.
    pub fn connect(&self, owner: ServiceHandle, addr: &str) -> Result<SocketId, SocketError> {
        let peer = resolve_addr(addr)?;
        let stream = TcpStream::connect(&peer)?;
        let id = self.states.reserve()?;
        logging::debug!(self.log, "connect in flight"; "socket" => id, "peer" => %peer);
        self.dispatch(Ctrl::Connect { owner, id, stream });
        Ok(id)
    }

    /// Wrap an already-connected stream (stdin pipelines, tests).
    pub fn bind_stream(
        &self,
        owner: ServiceHandle,
        stream: std::net::TcpStream,
    ) -> Result<SocketId, SocketError> {
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_stream(stream)?;
        let id = self.states.reserve()?;
        self.dispatch(Ctrl::Bind { owner, id, stream });
        Ok(id)
    }

    /// Arm read attention, claiming ownership of the socket. Required after
    /// `listen`, `connect` and `accept`, and resumes a paused socket.
    pub fn start(&self, owner: ServiceHandle, id: SocketId) -> Result<(), SocketError> {
        if self.states.get(id) == SocketState::Invalid {
            return Err(SocketError::InvalidId(id));
        }
        self.dispatch(Ctrl::Start { owner, id });
        Ok(())
    }

    /// Stop reading without closing. Buffered writes still drain.
    pub fn pause(&self, id: SocketId) -> Result<(), SocketError> {
        if self.states.get(id) == SocketState::Invalid {
            return Err(SocketError::InvalidId(id));
        }
        self.dispatch(Ctrl::Pause { id });
        Ok(())
    }

    /// Graceful close: pending writes drain first, then the owner gets its
    /// terminal CLOSE event.
    pub fn close(&self, id: SocketId) {
        self.dispatch(Ctrl::Close { id, force: false });
    }

    /// Forceful close: drop buffered writes.
    pub fn shutdown(&self, id: SocketId) {
        self.dispatch(Ctrl::Close { id, force: true });
    }

    pub fn send(&self, id: SocketId, data: Vec<u8>) -> Result<(), SocketError> {
        self.check_writable(id)?;
        self.dispatch(Ctrl::Send {
            id,
            data: data.into_boxed_slice(),
            low: false,
        });
        Ok(())
    }

    pub fn send_low(&self, id: SocketId, data: Vec<u8>) -> Result<(), SocketError> {
        self.check_writable(id)?;
        self.dispatch(Ctrl::Send {
            id,
            data: data.into_boxed_slice(),
            low: true,
        });
        Ok(())
    }

    pub fn nodelay(&self, id: SocketId) {
        self.dispatch(Ctrl::Nodelay { id });
    }

    /// Bind a UDP socket. Datagrams arrive as UDP events immediately; no
    /// `start` step.
    pub fn udp_socket(
        &self,
        owner: ServiceHandle,
        host: &str,
        port: u16,
    ) -> Result<SocketId, SocketError> {
        let addr = resolve_addr(&host_port(host, port))?;
        let socket = UdpSocket::bind(&addr)?;
        let id = self.states.reserve()?;
        self.dispatch(Ctrl::Udp { owner, id, socket });
        Ok(id)
    }

    /// Fix the default peer for `udp_send` without an explicit address.
    pub fn udp_connect(&self, id: SocketId, addr: &str) -> Result<(), SocketError> {
        if self.states.get(id) == SocketState::Invalid {
            return Err(SocketError::InvalidId(id));
        }
        let peer = resolve_addr(addr)?;
        self.dispatch(Ctrl::UdpConnect { id, peer });
        Ok(())
    }

    pub fn udp_send_to(
        &self,
        id: SocketId,
        addr: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), SocketError> {
        if self.states.get(id) == SocketState::Invalid {
            return Err(SocketError::InvalidId(id));
        }
        let peer = match addr {
            Some(addr) => Some(resolve_addr(addr)?),
            None => None,
        };
        self.dispatch(Ctrl::UdpSend {
            id,
            peer,
            data: data.into_boxed_slice(),
        });
        Ok(())
    }

    /// Ask the poller thread to wind down. Called once at shutdown.
    pub fn exit(&self) {
        self.dispatch(Ctrl::Exit);
    }

    #[inline]
    pub fn state(&self, id: SocketId) -> SocketState {
        self.states.get(id)
    }
}
