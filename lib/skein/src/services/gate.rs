use crate::error::ServiceError;
use crate::handle::ServiceHandle;
use crate::message::{Message, ProtocolType};
use crate::net::buffer::Buffer;
use crate::net::{SocketEvent, SocketId, SocketMessage};
use crate::service::{Dispatch, Service, ServiceApi, Session};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use hashbrown::HashMap;
use strand::logging;

const DEFAULT_BACKLOG: u32 = 128;
/// Frames beyond this kick the connection.
const MAX_FRAME_SIZE: usize = 0x0100_0000;

/// Parsed launch arguments: `<S|L> <watchdog|!> <[host:]port> <proto> <max>`.
struct GateArgs {
    header_size: usize,
    watchdog: Option<String>,
    host: String,
    port: u16,
    client_protocol: ProtocolType,
    max_connections: usize,
}

fn parse_args(arg: &str) -> Result<GateArgs, String> {
    let tokens: Vec<&str> = arg.split_whitespace().collect();
    if tokens.len() < 5 {
        return Err(format!("invalid gate param {:?}", arg));
    }

    let header_size = match tokens[0] {
        "S" => 2,
        "L" => 4,
        other => return Err(format!("invalid data header style {:?}", other)),
    };

    let watchdog = match tokens[1] {
        "!" => None,
        name => Some(name.to_owned()),
    };

    let (host, port) = match tokens[2].rfind(':') {
        Some(at) => (tokens[2][..at].to_owned(), &tokens[2][at + 1..]),
        None => (String::new(), tokens[2]),
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid gate address {:?}", tokens[2]))?;

    let client_protocol = match tokens[3].parse::<u8>() {
        Ok(0) => ProtocolType::CLIENT,
        Ok(tag) => ProtocolType(tag),
        Err(_) => return Err(format!("invalid gate param {:?}", arg)),
    };

    let max_connections: usize = tokens[4]
        .parse()
        .map_err(|_| "need max connection param".to_owned())?;
    if max_connections == 0 {
        return Err("need max connection param".to_owned());
    }

    Ok(GateArgs {
        header_size,
        watchdog,
        host,
        port,
        client_protocol,
        max_connections,
    })
}

enum FrameRead {
    Frame(Vec<u8>),
    Incomplete,
    Oversize,
}

/// Pull one length-prefixed frame off the reassembly buffer.
fn read_frame(buffer: &mut Buffer, header_size: usize) -> FrameRead {
    let bytes = buffer.peek();
    if bytes.len() < header_size {
        return FrameRead::Incomplete;
    }

    let size = match header_size {
        2 => BigEndian::read_u16(&bytes[..2]) as usize,
        _ => BigEndian::read_u32(&bytes[..4]) as usize,
    };

    if size >= MAX_FRAME_SIZE {
        return FrameRead::Oversize;
    }
    if bytes.len() < header_size + size {
        return FrameRead::Incomplete;
    }

    let frame = bytes[header_size..header_size + size].to_vec();
    buffer.consume(header_size + size);
    FrameRead::Frame(frame)
}

struct Connection {
    agent: ServiceHandle,
    client: ServiceHandle,
    buffer: Buffer,
    remote: String,
}

impl Connection {
    fn new(remote: String) -> Connection {
        Connection {
            agent: ServiceHandle::ZERO,
            client: ServiceHandle::ZERO,
            buffer: Buffer::new(),
            remote,
        }
    }
}

/// TCP front-end: accepts connections, reassembles big-endian
/// length-prefixed frames and forwards them to an agent, a broker or the
/// watchdog. Driven by text control commands from its creator.
pub struct GateService {
    header_size: usize,
    watchdog: ServiceHandle,
    broker: ServiceHandle,
    client_protocol: ProtocolType,
    listen_id: SocketId,
    max_connections: usize,
    connections: HashMap<SocketId, Connection>,
}

pub fn create() -> Box<dyn Service> {
    Box::new(GateService {
        header_size: 2,
        watchdog: ServiceHandle::ZERO,
        broker: ServiceHandle::ZERO,
        client_protocol: ProtocolType::CLIENT,
        listen_id: -1,
        max_connections: 0,
        connections: HashMap::new(),
    })
}

impl GateService {
    fn report(&self, api: &ServiceApi<'_>, text: String) {
        if !self.watchdog.is_zero() {
            let _ = api.send(self.watchdog, ProtocolType::TEXT, Session::None, text.into());
        }
    }

    fn ctrl(&mut self, api: &ServiceApi<'_>, line: &str) {
        let mut tokens = line.split_whitespace();
        let cmd = match tokens.next() {
            Some(cmd) => cmd,
            None => return,
        };
        let params: Vec<&str> = tokens.collect();

        match cmd {
            "kick" => {
                if let Some(id) = params.first().and_then(|p| p.parse::<SocketId>().ok()) {
                    if self.connections.contains_key(&id) {
                        api.socket().close(id);
                    }
                }
            }
            "forward" => {
                // forward socket_id :agent :client
                if params.len() < 3 {
                    logging::warn!(api.log(), "[gate] forward needs 3 params"; "line" => line);
                    return;
                }
                let id = params[0].parse::<SocketId>().ok();
                let agent = params[1].parse::<ServiceHandle>().ok();
                let client = params[2].parse::<ServiceHandle>().ok();
                match (id, agent, client) {
                    (Some(id), Some(agent), Some(client)) => {
                        if let Some(conn) = self.connections.get_mut(&id) {
                            conn.agent = agent;
                            conn.client = client;
                        }
                    }
                    _ => logging::warn!(api.log(), "[gate] bad forward command"; "line" => line),
                }
            }
            "broker" => match params.first() {
                Some(name) => match api.command("QUERY", name) {
                    Ok(Some(addr)) => self.broker = addr.parse().unwrap_or(ServiceHandle::ZERO),
                    _ => logging::warn!(api.log(), "[gate] unknown broker"; "name" => *name),
                },
                None => logging::warn!(api.log(), "[gate] broker needs a name"),
            },
            "start" => {
                if let Some(id) = params.first().and_then(|p| p.parse::<SocketId>().ok()) {
                    if self.connections.contains_key(&id) {
                        let _ = api.socket().start(api.handle(), id);
                    }
                }
            }
            "close" => {
                if self.listen_id >= 0 {
                    api.socket().close(self.listen_id);
                    self.listen_id = -1;
                }
            }
            other => {
                logging::warn!(api.log(), "[gate] unknown command"; "command" => other, "line" => line);
            }
        }
    }

    /// CLIENT-protocol egress: the last 4 bytes of the payload carry the
    /// target socket id, little-endian; the rest is the raw frame body.
    fn client_send(&mut self, api: &ServiceApi<'_>, message: Message) {
        let bytes = message.payload.as_bytes();
        if bytes.len() <= 4 {
            logging::warn!(api.log(), "[gate] invalid client message"; "source" => %message.source);
            return;
        }

        let id = LittleEndian::read_i32(&bytes[bytes.len() - 4..]);
        if !self.connections.contains_key(&id) {
            logging::warn!(api.log(), "[gate] invalid client id";
                           "socket" => id, "source" => %message.source);
            return;
        }

        let mut data = message.payload.into_bytes().into_vec();
        data.truncate(data.len() - 4);
        let framed = self.frame(data);
        let _ = api.socket().send(id, framed);
    }

    /// Prefix the body with the configured big-endian length header.
    fn frame(&self, body: Vec<u8>) -> Vec<u8> {
        let mut framed = vec![0u8; self.header_size + body.len()];
        match self.header_size {
            2 => BigEndian::write_u16(&mut framed[..2], body.len() as u16),
            _ => BigEndian::write_u32(&mut framed[..4], body.len() as u32),
        }
        framed[self.header_size..].copy_from_slice(&body);
        framed
    }

    fn forward(&mut self, api: &ServiceApi<'_>, id: SocketId, frame: Vec<u8>) {
        if !self.broker.is_zero() {
            let _ = api.send(
                self.broker,
                self.client_protocol,
                Session::Fixed(id),
                frame.into(),
            );
            return;
        }

        let conn = match self.connections.get(&id) {
            Some(conn) => conn,
            None => return,
        };

        if !conn.agent.is_zero() {
            let _ = api.redirect(conn.agent, conn.client, self.client_protocol, id, frame.into());
        } else if !self.watchdog.is_zero() {
            let mut text = format!("{} data ", id).into_bytes();
            text.extend_from_slice(&frame);
            let _ = api.send(self.watchdog, ProtocolType::TEXT, Session::None, text.into());
        }
    }

    fn socket_event(&mut self, api: &ServiceApi<'_>, event: SocketMessage) {
        match event.event {
            SocketEvent::Data => {
                if !self.connections.contains_key(&event.id) {
                    logging::warn!(api.log(), "[gate] drop unknown connection message";
                                   "socket" => event.id);
                    api.socket().close(event.id);
                    return;
                }

                let mut frames = Vec::new();
                let mut oversize = false;
                {
                    let conn = self.connections.get_mut(&event.id).expect("checked above");
                    conn.buffer.push(&event.data);
                    loop {
                        match read_frame(&mut conn.buffer, self.header_size) {
                            FrameRead::Frame(frame) => frames.push(frame),
                            FrameRead::Incomplete => break,
                            FrameRead::Oversize => {
                                conn.buffer.clear();
                                oversize = true;
                                break;
                            }
                        }
                    }
                }

                for frame in frames {
                    self.forward(api, event.id, frame);
                }
                if oversize {
                    logging::warn!(api.log(), "[gate] recv socket message > 16M"; "socket" => event.id);
                    api.socket().close(event.id);
                }
            }
            SocketEvent::Accept => {
                let new_id = event.ud;
                if self.connections.len() >= self.max_connections {
                    // Full house: reject.
                    api.socket().shutdown(new_id);
                    return;
                }
                self.connections
                    .insert(new_id, Connection::new(event.info.clone()));
                self.report(api, format!("{} open {}", new_id, event.info));
                logging::info!(api.log(), "[gate] socket open";
                               "socket" => new_id, "peer" => event.info.as_str());
                if self.watchdog.is_zero() {
                    // Nobody to arbitrate: arm reads immediately.
                    let _ = api.socket().start(api.handle(), new_id);
                }
            }
            SocketEvent::Connect => {
                if event.id != self.listen_id && !self.connections.contains_key(&event.id) {
                    logging::warn!(api.log(), "[gate] close unknown connection"; "socket" => event.id);
                    api.socket().close(event.id);
                }
            }
            SocketEvent::Close | SocketEvent::Error => {
                if event.id == self.listen_id {
                    self.listen_id = -1;
                    return;
                }
                if self.connections.remove(&event.id).is_some() {
                    self.report(api, format!("{} close", event.id));
                }
            }
            SocketEvent::Warning => {
                logging::warn!(api.log(), "[gate] send buffer backlog";
                               "socket" => event.id, "kib" => event.ud);
            }
            SocketEvent::Udp => (),
        }
    }
}

impl Service for GateService {
    fn init(&mut self, api: &ServiceApi<'_>, arg: &str) -> Result<(), ServiceError> {
        let args = parse_args(arg).map_err(ServiceError::Boot)?;

        self.header_size = args.header_size;
        self.client_protocol = args.client_protocol;
        self.max_connections = args.max_connections;

        if let Some(name) = args.watchdog {
            let addr = api
                .command("QUERY", &name)
                .ok()
                .and_then(|found| found)
                .ok_or_else(|| ServiceError::Boot(format!("invalid watchdog {:?}", name)))?;
            self.watchdog = addr
                .parse()
                .map_err(|_| ServiceError::Boot(format!("invalid watchdog {:?}", name)))?;
        }

        self.listen_id = api
            .socket()
            .listen(api.handle(), &args.host, args.port, DEFAULT_BACKLOG)
            .map_err(|err| ServiceError::Boot(format!("gate listen failed: {}", err)))?;
        api.socket()
            .start(api.handle(), self.listen_id)
            .map_err(|err| ServiceError::Boot(format!("gate start failed: {}", err)))?;

        logging::info!(api.log(), "[gate] listening";
                       "host" => args.host.as_str(), "port" => args.port,
                       "header" => self.header_size, "max" => self.max_connections);
        Ok(())
    }

    fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch {
        match message.protocol {
            ProtocolType::TEXT => {
                let line = message.payload.text().into_owned();
                self.ctrl(api, &line);
            }
            ProtocolType::SOCKET => {
                if let Some(event) = SocketMessage::decode(message.payload.as_bytes()) {
                    self.socket_event(api, event);
                }
            }
            proto if proto == self.client_protocol => self.client_send(api, message),
            _ => (),
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = parse_args("S ! 0.0.0.0:9000 0 64").unwrap();
        assert_eq!(args.header_size, 2);
        assert!(args.watchdog.is_none());
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 9000);
        assert_eq!(args.client_protocol, ProtocolType::CLIENT);
        assert_eq!(args.max_connections, 64);

        let args = parse_args("L .watchdog 9001 10 8").unwrap();
        assert_eq!(args.header_size, 4);
        assert_eq!(args.watchdog.as_deref(), Some(".watchdog"));
        assert_eq!(args.host, "");
        assert_eq!(args.client_protocol, ProtocolType::LUA);
    }

    #[test]
    fn test_parse_args_rejects_garbage() {
        assert!(parse_args("").is_err());
        assert!(parse_args("X ! 9000 0 64").is_err());
        assert!(parse_args("S ! nine-thousand 0 64").is_err());
        assert!(parse_args("S ! 9000 0 0").is_err());
        assert!(parse_args("S ! 9000 0").is_err());
    }

    #[test]
    fn test_read_frame_short_header() {
        let mut buffer = Buffer::new();
        buffer.push(&[0x00, 0x04, b'p', b'i', b'n', b'g']);
        match read_frame(&mut buffer, 2) {
            FrameRead::Frame(frame) => assert_eq!(frame, b"ping"),
            _ => panic!("expected a complete frame"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_frame_fragmented() {
        let mut buffer = Buffer::new();
        buffer.push(&[0x00]);
        assert!(matches!(read_frame(&mut buffer, 2), FrameRead::Incomplete));
        buffer.push(&[0x04, b'p', b'i']);
        assert!(matches!(read_frame(&mut buffer, 2), FrameRead::Incomplete));
        buffer.push(&[b'n', b'g', 0x00, 0x02]);
        match read_frame(&mut buffer, 2) {
            FrameRead::Frame(frame) => assert_eq!(frame, b"ping"),
            _ => panic!("expected a complete frame"),
        }
        // Trailing bytes stay queued for the next frame.
        assert_eq!(buffer.peek(), &[0x00, 0x02]);
    }

    #[test]
    fn test_read_frame_long_header_oversize() {
        let mut buffer = Buffer::new();
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, MAX_FRAME_SIZE as u32);
        buffer.push(&header);
        assert!(matches!(read_frame(&mut buffer, 4), FrameRead::Oversize));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buffer = Buffer::new();
        buffer.push(&[0x00, 0x01, b'a', 0x00, 0x02, b'b', b'c']);
        match read_frame(&mut buffer, 2) {
            FrameRead::Frame(frame) => assert_eq!(frame, b"a"),
            _ => panic!("expected first frame"),
        }
        match read_frame(&mut buffer, 2) {
            FrameRead::Frame(frame) => assert_eq!(frame, b"bc"),
            _ => panic!("expected second frame"),
        }
        assert!(matches!(read_frame(&mut buffer, 2), FrameRead::Incomplete));
    }

    #[test]
    fn test_frame_encoding() {
        let gate = GateService {
            header_size: 2,
            watchdog: ServiceHandle::ZERO,
            broker: ServiceHandle::ZERO,
            client_protocol: ProtocolType::CLIENT,
            listen_id: -1,
            max_connections: 1,
            connections: HashMap::new(),
        };
        assert_eq!(gate.frame(b"pong".to_vec()), b"\x00\x04pong".to_vec());
    }
}
