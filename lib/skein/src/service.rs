use crate::context::ServiceContext;
use crate::env::Env;
use crate::error::{CommandError, SendError, ServiceError};
use crate::handle::ServiceHandle;
use crate::message::{Message, Payload, ProtocolType};
use crate::net::SocketServer;
use crate::runtime::Runtime;
use std::sync::Arc;
use strand::logging::Logger;

/// Session selection for an outgoing message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Session {
    /// Fire-and-forget; the message carries session 0.
    None,
    /// Reply correlation: echo a session the peer allocated.
    Fixed(i32),
    /// Runtime allocates a fresh session from the sender's counter and
    /// returns it from send.
    Alloc,
}

/// Verdict returned by a handler for one message.
#[derive(Debug, Eq, PartialEq)]
pub enum Dispatch {
    Continue,
    /// The service is done; the runtime tears it down.
    Exit,
}

/// Capability surface handed to a service while it runs. Bundles the
/// runtime and the service's own record so handlers never reach for
/// ambient globals.
pub struct ServiceApi<'a> {
    runtime: &'a Runtime,
    ctx: &'a Arc<ServiceContext>,
}

impl<'a> ServiceApi<'a> {
    pub(crate) fn new(runtime: &'a Runtime, ctx: &'a Arc<ServiceContext>) -> ServiceApi<'a> {
        ServiceApi { runtime, ctx }
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    #[inline]
    pub fn context(&self) -> &Arc<ServiceContext> {
        self.ctx
    }

    #[inline]
    pub fn handle(&self) -> ServiceHandle {
        self.ctx.handle()
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.ctx.log
    }

    #[inline]
    pub fn env(&self) -> &Env {
        self.runtime.env()
    }

    #[inline]
    pub fn socket(&self) -> &SocketServer {
        self.runtime.socket()
    }

    /// Send a message from this service.
    #[inline]
    pub fn send(
        &self,
        dest: ServiceHandle,
        protocol: ProtocolType,
        session: Session,
        payload: Payload,
    ) -> Result<i32, SendError> {
        self.runtime.send(Some(self.ctx), dest, protocol, session, payload)
    }

    /// Send addressed by name (`.local`, `@global` or `:hex`).
    #[inline]
    pub fn send_name(
        &self,
        name: &str,
        protocol: ProtocolType,
        session: Session,
        payload: Payload,
    ) -> Result<i32, SendError> {
        self.runtime.send_name(Some(self.ctx), name, protocol, session, payload)
    }

    /// Send on behalf of another source (gate-style forwarding).
    #[inline]
    pub fn redirect(
        &self,
        dest: ServiceHandle,
        source: ServiceHandle,
        protocol: ProtocolType,
        session: i32,
        payload: Payload,
    ) -> Result<(), SendError> {
        self.runtime.push_message(
            dest,
            Message {
                source,
                session,
                protocol,
                payload,
            },
        )
    }

    /// Invoke a synchronous runtime command (C12) on this worker.
    #[inline]
    pub fn command(&self, name: &str, param: &str) -> Result<Option<String>, CommandError> {
        crate::command::exec(self.runtime, self.ctx, name, param)
    }
}

/// The uniform contract every service implementation follows, native or
/// scripted. One instance handles one service; the runtime guarantees the
/// methods are never invoked concurrently.
pub trait Service: Send {
    /// One-shot initialisation. Messages delivered before this returns are
    /// queued and flow afterwards; returning an error destroys the service.
    fn init(&mut self, api: &ServiceApi<'_>, arg: &str) -> Result<(), ServiceError>;

    /// Handle a single message to completion.
    fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch;

    /// Out-of-band poke. Optional capability: the default ignores it.
    fn signal(&mut self, _api: &ServiceApi<'_>, _signal: i32) {}
}
