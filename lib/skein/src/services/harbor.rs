use crate::error::ServiceError;
use crate::handle::ServiceHandle;
use crate::message::{Message, ProtocolType};
use crate::runtime::split_command;
use crate::service::{Dispatch, Service, ServiceApi, Session};
use byteorder::{ByteOrder, LittleEndian};
use strand::logging;

/// Cluster stub. Owns the exported (`@`) name space and terminates remote
/// traffic: on a standalone node every wrapped message is logged, dropped,
/// and error-replied so pending sessions abort instead of hanging.
pub struct HarborService {
    node: u8,
}

pub fn create() -> Box<dyn Service> {
    Box::new(HarborService { node: 0 })
}

impl HarborService {
    fn register(&self, api: &ServiceApi<'_>, rest: &str) {
        let (name, addr) = split_command(rest);
        let handle = match addr.parse::<ServiceHandle>() {
            Ok(handle) => handle,
            Err(_) if addr.is_empty() => api.handle(),
            Err(_) => {
                logging::warn!(api.log(), "bad REGISTER address"; "name" => name, "addr" => addr);
                return;
            }
        };
        let name = name.trim_start_matches('@');
        api.runtime().register_global_name(name, handle);
    }

    fn query(&self, api: &ServiceApi<'_>, message: &Message, name: &str) {
        if message.session == 0 || message.source.is_zero() {
            return;
        }
        let name = name.trim_start_matches('@');
        let text = match api.runtime().resolve_global_name(name) {
            Some(handle) => handle.to_text(),
            None => String::new(),
        };
        let _ = api.send(
            message.source,
            ProtocolType::RESPONSE,
            Session::Fixed(message.session),
            text.into(),
        );
    }

    /// A message the runtime wrapped for another node: destination and
    /// original protocol prefix the body.
    fn remote(&self, api: &ServiceApi<'_>, message: &Message) {
        let bytes = message.payload.as_bytes();
        if bytes.len() < 5 {
            return;
        }
        let dest = ServiceHandle::from_raw(LittleEndian::read_u32(&bytes[..4]));

        logging::warn!(api.log(), "remote message dropped (standalone node)";
                       "destination" => %dest, "source" => %message.source,
                       "node" => self.node);

        if message.session != 0 && !message.source.is_zero() {
            let _ = api.redirect(
                message.source,
                ServiceHandle::ZERO,
                ProtocolType::ERROR,
                message.session,
                crate::message::Payload::Empty,
            );
        }
    }
}

impl Service for HarborService {
    fn init(&mut self, api: &ServiceApi<'_>, arg: &str) -> Result<(), ServiceError> {
        self.node = arg.trim().parse().unwrap_or(0);
        api.command("REG", ".harbor")
            .map_err(|err| ServiceError::Boot(err.to_string()))?;
        Ok(())
    }

    fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch {
        match message.protocol {
            ProtocolType::TEXT => {
                let line = message.payload.text().into_owned();
                let (command, rest) = split_command(&line);
                match command {
                    "REGISTER" => self.register(api, rest),
                    "QUERY" => self.query(api, &message, rest),
                    other => {
                        logging::warn!(api.log(), "unknown harbor command"; "command" => other);
                    }
                }
            }
            ProtocolType::HARBOR => self.remote(api, &message),
            _ => (),
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::monitor::WorkerWatch;
    use crate::runtime::{Runtime, RuntimeOptions};
    use crate::worker;
    use std::time::Duration;

    fn settle(rt: &Runtime) {
        let watch = WorkerWatch::new();
        while worker::run_turn(rt, &watch, 0, Duration::from_millis(10)) {}
    }

    #[test]
    fn test_global_name_registration() {
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        let harbor = rt.launch_with("harbor", create(), "0").unwrap();

        rt.push_message(
            harbor,
            Message {
                source: ServiceHandle::ZERO,
                session: 0,
                protocol: ProtocolType::TEXT,
                payload: Payload::from("REGISTER @world :00000042"),
            },
        )
        .unwrap();
        settle(&rt);

        assert_eq!(
            rt.resolve_global_name("world"),
            Some(ServiceHandle::from_raw(0x42))
        );
    }

    #[test]
    fn test_remote_send_bounces_session() {
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        rt.launch_with("harbor", create(), "0").unwrap();

        // A requester on this node sends to a foreign node id.
        use crate::error::ServiceError as SvcError;
        use crossbeam_channel::{unbounded, Sender};

        struct Probe {
            seen: Sender<(ProtocolType, i32)>,
        }
        impl Service for Probe {
            fn init(&mut self, _api: &ServiceApi<'_>, _arg: &str) -> Result<(), SvcError> {
                Ok(())
            }
            fn handle(&mut self, _api: &ServiceApi<'_>, message: Message) -> Dispatch {
                self.seen.send((message.protocol, message.session)).unwrap();
                Dispatch::Continue
            }
        }

        let (tx, rx) = unbounded();
        let probe = rt
            .launch_with("probe", Box::new(Probe { seen: tx }), "")
            .unwrap();
        let ctx = rt.registry().resolve(probe).unwrap();

        let remote = ServiceHandle::new(9, 0x77);
        let session = rt
            .send(
                Some(&ctx),
                remote,
                ProtocolType::LUA,
                Session::Alloc,
                Payload::from("hi"),
            )
            .unwrap();
        settle(&rt);

        let (proto, got) = rx.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::ERROR);
        assert_eq!(got, session);
    }
}
