use super::buffer::{Flush, WriteQueue};
use super::slot::{SlotStates, SocketState};
use super::{Ctrl, SocketEvent, SocketId, SocketMessage};
use crate::handle::ServiceHandle;
use crate::message::{Message, ProtocolType};
use crate::runtime::Runtime;
use crossbeam_channel::Receiver;
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use strand::logging::{self, Logger};

const CTRL_TOKEN: Token = Token(super::slot::MAX_SOCKET);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const MIN_READ_SIZE: usize = 64;
const MAX_READ_SIZE: usize = 1 << 16;
const UDP_READ_SIZE: usize = 1 << 16;

const DEFAULT_WARNING_KB: usize = 1024;

enum Kind {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
}

impl Kind {
    fn evented(&self) -> &dyn mio::Evented {
        match self {
            Kind::Listener(listener) => listener,
            Kind::Stream(stream) => stream,
            Kind::Udp(socket) => socket,
        }
    }
}

struct Socket {
    id: SocketId,
    owner: ServiceHandle,
    kind: Kind,
    state: SocketState,
    queue: WriteQueue,
    /// Adaptive read chunk size: doubles on full reads, halves when
    /// under-used.
    read_size: usize,
    interest: Ready,
    registered: bool,
    /// `start` arrived while the connect was still in flight.
    start_pending: bool,
}

impl Socket {
    fn new(id: SocketId, owner: ServiceHandle, kind: Kind, state: SocketState, warn: usize) -> Socket {
        Socket {
            id,
            owner,
            kind,
            state,
            queue: WriteQueue::new(warn),
            read_size: MIN_READ_SIZE,
            interest: Ready::empty(),
            registered: false,
            start_pending: false,
        }
    }
}

/// The poller: sole owner of every socket and the `mio::Poll` instance.
/// Runs on its own thread; every mutation arrives over the control channel.
pub struct Poller {
    poll: Poll,
    ctrl: Receiver<Ctrl>,
    // Keeps the control-channel readiness pair alive for the poll's sake.
    _registration: mio::Registration,
    waker: mio::SetReadiness,
    states: Arc<SlotStates>,
    sockets: HashMap<usize, Socket>,
    warn_base: usize,
    kill_limit: usize,
    log: Logger,
}

impl Poller {
    pub(crate) fn new(
        ctrl: Receiver<Ctrl>,
        registration: mio::Registration,
        waker: mio::SetReadiness,
        states: Arc<SlotStates>,
        log: Logger,
    ) -> io::Result<Poller> {
        let poll = Poll::new()?;
        poll.register(&registration, CTRL_TOKEN, Ready::readable(), PollOpt::level())?;

        Ok(Poller {
            poll,
            ctrl,
            _registration: registration,
            waker,
            states,
            sockets: HashMap::new(),
            warn_base: DEFAULT_WARNING_KB * 1024,
            kill_limit: 0,
            log,
        })
    }

    /// Event loop. Returns when an Exit request arrives or the runtime
    /// shuts down.
    pub fn run(mut self, rt: Runtime) {
        self.warn_base = rt.env().get_usize("socket_warning_kb", DEFAULT_WARNING_KB) * 1024;
        self.kill_limit = rt.env().get_usize("socket_kill_kb", 0) * 1024;

        logging::debug!(self.log, "socket poller running";
                        "warning_bytes" => self.warn_base,
                        "kill_bytes" => self.kill_limit);

        let mut events = Events::with_capacity(1024);

        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "error" => %err);
                return;
            }

            for event in &events {
                match event.token() {
                    CTRL_TOKEN => (),
                    Token(slot) => self.socket_event(&rt, slot, event.readiness()),
                }
            }

            // Drain control requests; clear readiness, then catch the race
            // window with a second sweep.
            if !self.drain_ctrl(&rt) {
                return;
            }
            let _ = self.waker.set_readiness(Ready::empty());
            if !self.drain_ctrl(&rt) {
                return;
            }

            if rt.is_shutdown() {
                return;
            }
        }
    }

    fn drain_ctrl(&mut self, rt: &Runtime) -> bool {
        while let Ok(ctrl) = self.ctrl.try_recv() {
            match ctrl {
                Ctrl::Listen { owner, id, listener } => {
                    self.install(id, owner, Kind::Listener(listener), SocketState::PendingListen);
                }
                Ctrl::Connect { owner, id, stream, .. } => {
                    self.begin_connect(id, owner, stream);
                }
                Ctrl::Bind { owner, id, stream } => {
                    self.install(id, owner, Kind::Stream(stream), SocketState::PendingAccept);
                    self.start(rt, owner, id);
                }
                Ctrl::Udp { owner, id, socket } => {
                    self.install(id, owner, Kind::Udp(socket), SocketState::Connected);
                    self.set_interest(id, Ready::readable());
                }
                Ctrl::Start { owner, id } => self.start(rt, owner, id),
                Ctrl::Pause { id } => self.pause(id),
                Ctrl::Close { id, force } => self.close(rt, id, force),
                Ctrl::Send { id, data, low } => self.send(rt, id, data, low),
                Ctrl::UdpSend { id, peer, data } => self.udp_send(id, peer, data),
                Ctrl::UdpConnect { id, peer } => self.udp_connect(id, peer),
                Ctrl::Nodelay { id } => {
                    if let Some(socket) = self.lookup(id) {
                        if let Kind::Stream(stream) = &socket.kind {
                            let _ = stream.set_nodelay(true);
                        }
                    }
                }
                Ctrl::Exit => return false,
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn install(&mut self, id: SocketId, owner: ServiceHandle, kind: Kind, state: SocketState) {
        let socket = Socket::new(id, owner, kind, state, self.warn_base);
        self.states.set(id, state);
        self.sockets.insert(SlotStates::slot_of(id), socket);
    }

    fn lookup(&mut self, id: SocketId) -> Option<&mut Socket> {
        let socket = self.sockets.get_mut(&SlotStates::slot_of(id))?;
        if socket.id == id {
            Some(socket)
        } else {
            None
        }
    }

    fn set_state(&mut self, id: SocketId, state: SocketState) {
        self.states.set(id, state);
        if let Some(socket) = self.lookup(id) {
            socket.state = state;
        }
    }

    fn set_interest(&mut self, id: SocketId, interest: Ready) {
        let poll = &self.poll;
        let slot = SlotStates::slot_of(id);
        let socket = match self.sockets.get_mut(&slot) {
            Some(socket) if socket.id == id => socket,
            _ => return,
        };

        let result = if interest.is_empty() {
            match socket.registered {
                true => {
                    socket.registered = false;
                    poll.deregister(socket.kind.evented())
                }
                false => Ok(()),
            }
        } else if socket.registered {
            poll.reregister(socket.kind.evented(), Token(slot), interest, PollOpt::level())
        } else {
            socket.registered = true;
            poll.register(socket.kind.evented(), Token(slot), interest, PollOpt::level())
        };

        socket.interest = interest;

        if let Err(err) = result {
            logging::error!(self.log, "poll (de)registration failed";
                            "socket" => id, "error" => %err);
        }
    }

    fn deliver(&self, rt: &Runtime, owner: ServiceHandle, message: SocketMessage) {
        let result = rt.push_message(
            owner,
            Message {
                source: ServiceHandle::ZERO,
                session: 0,
                protocol: ProtocolType::SOCKET,
                payload: message.encode(),
            },
        );
        if result.is_err() {
            logging::debug!(self.log, "socket event dropped, owner gone"; "owner" => %owner);
        }
    }

    /// Remove the socket, delivering its single terminal event.
    fn remove(&mut self, rt: &Runtime, id: SocketId, terminal: SocketMessage) {
        self.set_interest(id, Ready::empty());
        let slot = SlotStates::slot_of(id);
        if let Some(socket) = self.sockets.remove(&slot) {
            debug_assert_eq!(socket.id, id);
            self.states.release(id);
            self.deliver(rt, socket.owner, terminal);
        }
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    fn begin_connect(&mut self, id: SocketId, owner: ServiceHandle, stream: TcpStream) {
        self.install(id, owner, Kind::Stream(stream), SocketState::Connecting);
        // Completion is reported by the writable event.
        self.set_interest(id, Ready::writable());
    }

    fn start(&mut self, rt: &Runtime, owner: ServiceHandle, id: SocketId) {
        let (state, peer) = match self.lookup(id) {
            Some(socket) => {
                socket.owner = owner;
                let peer = match &socket.kind {
                    Kind::Stream(stream) => stream
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                (socket.state, peer)
            }
            None => return,
        };

        match state {
            SocketState::PendingListen => {
                self.set_state(id, SocketState::Listen);
                self.set_interest(id, Ready::readable());
                self.notify_started(rt, id, "start");
            }
            SocketState::PendingAccept | SocketState::Paused => {
                let next = match &self.lookup(id).expect("socket present").kind {
                    Kind::Listener(_) => SocketState::Listen,
                    _ => SocketState::Connected,
                };
                self.set_state(id, next);
                let mut interest = Ready::readable();
                if !self.lookup(id).expect("socket present").queue.is_empty() {
                    interest |= Ready::writable();
                }
                self.set_interest(id, interest);
                self.notify_started(rt, id, &peer);
            }
            SocketState::Connecting => {
                if let Some(socket) = self.lookup(id) {
                    socket.start_pending = true;
                }
            }
            _ => (),
        }
    }

    fn notify_started(&mut self, rt: &Runtime, id: SocketId, info: &str) {
        let owner = match self.lookup(id) {
            Some(socket) => socket.owner,
            None => return,
        };
        let mut message = SocketMessage::event(SocketEvent::Connect, id);
        message.info = info.to_owned();
        self.deliver(rt, owner, message);
    }

    fn pause(&mut self, id: SocketId) {
        let state = match self.lookup(id) {
            Some(socket) => socket.state,
            None => return,
        };
        match state {
            SocketState::Connected | SocketState::Listen => {
                self.set_state(id, SocketState::Paused);
                let interest = match self.lookup(id).expect("socket present").queue.is_empty() {
                    true => Ready::empty(),
                    false => Ready::writable(),
                };
                self.set_interest(id, interest);
            }
            _ => (),
        }
    }

    fn close(&mut self, rt: &Runtime, id: SocketId, force: bool) {
        let has_egress = match self.lookup(id) {
            Some(socket) => !socket.queue.is_empty(),
            None => return,
        };

        if force || !has_egress {
            self.remove(rt, id, SocketMessage::event(SocketEvent::Close, id));
            return;
        }

        // Graceful: stop reading, keep draining, close when dry.
        self.set_state(id, SocketState::Closing);
        self.set_interest(id, Ready::writable());
    }

    fn send(&mut self, rt: &Runtime, id: SocketId, data: Box<[u8]>, low: bool) {
        enum Plan {
            Stream { state: SocketState, direct: bool },
            Udp,
            Skip,
        }

        let plan = match self.lookup(id) {
            Some(socket) => match socket.kind {
                Kind::Stream(_) => Plan::Stream {
                    state: socket.state,
                    direct: socket.state == SocketState::Connected && socket.queue.is_empty(),
                },
                Kind::Udp(_) => Plan::Udp,
                Kind::Listener(_) => Plan::Skip,
            },
            None => Plan::Skip,
        };

        let (state, direct) = match plan {
            Plan::Stream { state, direct } => (state, direct),
            Plan::Udp => {
                // Datagram path via the stream API: honour the default peer
                // set by udp_connect.
                self.udp_send(id, None, data);
                return;
            }
            Plan::Skip => return,
        };

        if !state.writable() && state != SocketState::Connecting {
            return;
        }

        // Fast path: socket idle, try the kernel buffer before queueing.
        let data = if direct {
            match self.direct_write(rt, id, data) {
                Some(rest) => rest,
                None => return,
            }
        } else {
            Some(data)
        };

        if let Some(data) = data {
            let socket = self.lookup(id).expect("socket present");
            match low {
                true => socket.queue.push_low(data),
                false => socket.queue.push_high(data),
            }
            let warning = socket.queue.take_warning();
            let size = socket.queue.size();
            let owner = socket.owner;

            if state != SocketState::Connecting {
                let interest = socket.interest | Ready::writable();
                self.set_interest(id, interest);
            }

            if let Some(kib) = warning {
                let mut message = SocketMessage::event(SocketEvent::Warning, id);
                message.ud = kib as i32;
                self.deliver(rt, owner, message);
            }

            if self.kill_limit > 0 && size > self.kill_limit {
                let mut message = SocketMessage::event(SocketEvent::Error, id);
                message.info = "write buffer overflow".to_owned();
                self.remove(rt, id, message);
            }
        }
    }

    /// Write straight to the kernel buffer; returns the unwritten remainder
    /// (None when everything went out or the socket died).
    fn direct_write(&mut self, rt: &Runtime, id: SocketId, data: Box<[u8]>) -> Option<Option<Box<[u8]>>> {
        let socket = self.lookup(id).expect("socket present");
        let stream = match &mut socket.kind {
            Kind::Stream(stream) => stream,
            _ => return Some(Some(data)),
        };

        let mut offset = 0;
        while offset < data.len() {
            match stream.write(&data[offset..]) {
                Ok(0) => break,
                Ok(count) => offset += count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let mut message = SocketMessage::event(SocketEvent::Error, id);
                    message.info = err.to_string();
                    self.remove(rt, id, message);
                    return None;
                }
            }
        }

        if offset == data.len() {
            Some(None)
        } else {
            Some(Some(Box::from(&data[offset..])))
        }
    }

    fn udp_send(&mut self, id: SocketId, peer: Option<SocketAddr>, data: Box<[u8]>) {
        let log = self.log.clone();
        if let Some(socket) = self.lookup(id) {
            if let Kind::Udp(udp) = &socket.kind {
                let result = match peer {
                    Some(addr) => udp.send_to(&data, &addr),
                    None => udp.send(&data),
                };
                match result {
                    Ok(_) => (),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // Datagrams are lossy by contract; drop and note it.
                        logging::warn!(log, "udp send dropped, kernel buffer full"; "socket" => id);
                    }
                    Err(err) => {
                        logging::warn!(log, "udp send failed"; "socket" => id, "error" => %err);
                    }
                }
            }
        }
    }

    fn udp_connect(&mut self, id: SocketId, peer: SocketAddr) {
        if let Some(socket) = self.lookup(id) {
            if let Kind::Udp(udp) = &socket.kind {
                let _ = udp.connect(peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Readiness handling
    // ------------------------------------------------------------------

    fn socket_event(&mut self, rt: &Runtime, slot: usize, readiness: Ready) {
        let id = match self.sockets.get(&slot) {
            Some(socket) => socket.id,
            None => return,
        };

        if readiness.is_readable() {
            self.readable(rt, id);
        }
        // The readable path may have removed the socket.
        if self.sockets.get(&slot).map(|socket| socket.id) == Some(id) && readiness.is_writable() {
            self.writable(rt, id);
        }
    }

    fn readable(&mut self, rt: &Runtime, id: SocketId) {
        enum Action {
            Accept,
            Read,
            Udp,
            Skip,
        }

        let action = match self.lookup(id) {
            Some(socket) => match (&socket.kind, socket.state) {
                (Kind::Listener(_), SocketState::Listen) => Action::Accept,
                (Kind::Stream(_), SocketState::Connected) => Action::Read,
                (Kind::Udp(_), _) => Action::Udp,
                _ => Action::Skip,
            },
            None => return,
        };

        match action {
            Action::Accept => self.accept_ready(rt, id),
            Action::Read => self.read_ready(rt, id),
            Action::Udp => self.udp_ready(rt, id),
            Action::Skip => (),
        }
    }

    fn accept_ready(&mut self, rt: &Runtime, id: SocketId) {
        loop {
            let accepted = {
                let socket = match self.lookup(id) {
                    Some(socket) => socket,
                    None => return,
                };
                let listener = match &socket.kind {
                    Kind::Listener(listener) => listener,
                    _ => return,
                };
                listener.accept()
            };

            match accepted {
                Ok((stream, addr)) => {
                    let owner = self.lookup(id).expect("listener present").owner;
                    let new_id = match self.states.reserve() {
                        Ok(new_id) => new_id,
                        Err(_) => {
                            // Table full: reject by dropping the stream.
                            logging::warn!(self.log, "accept rejected, socket table full";
                                           "listener" => id);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    self.install(new_id, owner, Kind::Stream(stream), SocketState::PendingAccept);

                    let mut message = SocketMessage::event(SocketEvent::Accept, id);
                    message.ud = new_id;
                    message.info = addr.to_string();
                    self.deliver(rt, owner, message);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let mut message = SocketMessage::event(SocketEvent::Error, id);
                    message.info = err.to_string();
                    self.remove(rt, id, message);
                    return;
                }
            }
        }
    }

    fn read_ready(&mut self, rt: &Runtime, id: SocketId) {
        let (result, owner) = {
            let socket = match self.lookup(id) {
                Some(socket) => socket,
                None => return,
            };
            let read_size = socket.read_size;
            let mut buf = vec![0u8; read_size];
            let result = match &mut socket.kind {
                Kind::Stream(stream) => stream.read(&mut buf).map(|count| {
                    buf.truncate(count);
                    buf
                }),
                _ => return,
            };
            (result, socket.owner)
        };

        match result {
            Ok(ref data) if data.is_empty() => {
                // Peer closed.
                self.remove(rt, id, SocketMessage::event(SocketEvent::Close, id));
            }
            Ok(data) => {
                let count = data.len();
                {
                    let socket = self.lookup(id).expect("socket present");
                    if count == socket.read_size {
                        socket.read_size = (socket.read_size * 2).min(MAX_READ_SIZE);
                    } else if count * 2 < socket.read_size {
                        socket.read_size = (socket.read_size / 2).max(MIN_READ_SIZE);
                    }
                }
                let mut message = SocketMessage::event(SocketEvent::Data, id);
                message.ud = count as i32;
                message.data = data.into_boxed_slice();
                self.deliver(rt, owner, message);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => {
                let mut message = SocketMessage::event(SocketEvent::Error, id);
                message.info = err.to_string();
                self.remove(rt, id, message);
            }
        }
    }

    fn udp_ready(&mut self, rt: &Runtime, id: SocketId) {
        loop {
            let (result, owner) = {
                let socket = match self.lookup(id) {
                    Some(socket) => socket,
                    None => return,
                };
                let udp = match &socket.kind {
                    Kind::Udp(udp) => udp,
                    _ => return,
                };
                let mut buf = vec![0u8; UDP_READ_SIZE];
                let result = udp.recv_from(&mut buf).map(|(count, addr)| {
                    buf.truncate(count);
                    (buf, addr)
                });
                (result, socket.owner)
            };

            match result {
                Ok((data, addr)) => {
                    let mut message = SocketMessage::event(SocketEvent::Udp, id);
                    message.ud = data.len() as i32;
                    message.data = data.into_boxed_slice();
                    message.info = addr.to_string();
                    self.deliver(rt, owner, message);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let mut message = SocketMessage::event(SocketEvent::Error, id);
                    message.info = err.to_string();
                    self.remove(rt, id, message);
                    return;
                }
            }
        }
    }

    fn writable(&mut self, rt: &Runtime, id: SocketId) {
        let state = match self.lookup(id) {
            Some(socket) => socket.state,
            None => return,
        };

        if state == SocketState::Connecting {
            self.finish_connect(rt, id);
            return;
        }

        let flush = {
            let socket = self.lookup(id).expect("socket present");
            // Split borrow: queue flushes into the stream.
            let Socket { kind, queue, .. } = socket;
            match kind {
                Kind::Stream(stream) => queue.flush(stream),
                _ => return,
            }
        };

        match flush {
            Ok(Flush::Drained(_)) => {
                if state == SocketState::Closing {
                    self.remove(rt, id, SocketMessage::event(SocketEvent::Close, id));
                    return;
                }
                let interest = self.lookup(id).expect("socket present").interest - Ready::writable();
                self.set_interest(id, interest);
            }
            Ok(Flush::Blocked(_)) => (),
            Err(err) => {
                let mut message = SocketMessage::event(SocketEvent::Error, id);
                message.info = err.to_string();
                self.remove(rt, id, message);
            }
        }
    }

    fn finish_connect(&mut self, rt: &Runtime, id: SocketId) {
        let (verdict, owner, start_pending, has_egress) = {
            let socket = self.lookup(id).expect("socket present");
            let stream = match &socket.kind {
                Kind::Stream(stream) => stream,
                _ => return,
            };
            let verdict = match stream.take_error() {
                Ok(Some(err)) => Err(err),
                Ok(None) => stream.peer_addr().map(|addr| addr.to_string()),
                Err(err) => Err(err),
            };
            (verdict, socket.owner, socket.start_pending, !socket.queue.is_empty())
        };

        match verdict {
            Ok(peer) => {
                let next = match start_pending {
                    true => SocketState::Connected,
                    false => SocketState::PendingAccept,
                };
                self.set_state(id, next);

                let mut interest = Ready::empty();
                if start_pending {
                    interest |= Ready::readable();
                }
                if has_egress {
                    interest |= Ready::writable();
                }
                self.set_interest(id, interest);

                let mut message = SocketMessage::event(SocketEvent::Connect, id);
                message.info = peer;
                self.deliver(rt, owner, message);
            }
            Err(err) => {
                let mut message = SocketMessage::event(SocketEvent::Error, id);
                message.info = err.to_string();
                self.remove(rt, id, message);
            }
        }
    }
}
