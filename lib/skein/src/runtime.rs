use crate::command;
use crate::context::ServiceContext;
use crate::env::Env;
use crate::error::{LaunchError, SendError};
use crate::handle::{NameScope, ServiceHandle};
use crate::mailbox::Push;
use crate::message::{Message, Payload, ProtocolType};
use crate::module::ModuleLoader;
use crate::monitor::{WorkerWatch, CHECK_INTERVAL_SECS};
use crate::net::{Poller, SocketServer};
use crate::queue::GlobalQueue;
use crate::registry::Registry;
use crate::service::{Service, ServiceApi, Session};
use crate::timer::Timer;
use crate::worker;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strand::logging::{self, Logger};
use strand::time::TickClock;

/// Knobs fixed at construction; everything else flows through the env store.
pub struct RuntimeOptions {
    /// Node id (the `harbor` config key). 0 means standalone.
    pub node: u8,
    pub workers: usize,
    pub cpath: String,
    pub profile: bool,
}

impl Default for RuntimeOptions {
    fn default() -> RuntimeOptions {
        RuntimeOptions {
            node: 0,
            workers: 4,
            cpath: String::new(),
            profile: false,
        }
    }
}

struct Inner {
    node: u8,
    profile: bool,
    worker_count: usize,
    registry: Registry,
    env: Env,
    queue: GlobalQueue,
    timer: Timer,
    clock: TickClock,
    loader: ModuleLoader,
    socket: SocketServer,
    poller: Mutex<Option<Poller>>,
    watches: Mutex<Vec<Arc<WorkerWatch>>>,
    global_names: RwLock<HashMap<String, ServiceHandle>>,
    monitor_service: AtomicU32,
    logger_service: AtomicU32,
    shutdown: AtomicBool,
    exit_code: AtomicI32,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    log: Logger,
}

/// The composed runtime. All process-wide state hangs off this value;
/// services reach it through their `ServiceApi` rather than any ambient
/// global.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions, log: Logger) -> io::Result<Runtime> {
        let (socket, poller) = crate::net::socket_pair(log.new(logging::o!("thread" => "socket")))?;

        Ok(Runtime {
            inner: Arc::new(Inner {
                node: options.node,
                profile: options.profile,
                worker_count: options.workers.max(1),
                registry: Registry::new(options.node),
                env: Env::new(),
                queue: GlobalQueue::new(),
                timer: Timer::new(),
                clock: TickClock::new(),
                loader: ModuleLoader::new(&options.cpath, log.new(logging::o!("component" => "loader"))),
                socket,
                poller: Mutex::new(Some(poller)),
                watches: Mutex::new(Vec::new()),
                global_names: RwLock::new(HashMap::new()),
                monitor_service: AtomicU32::new(0),
                logger_service: AtomicU32::new(0),
                shutdown: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
                threads: Mutex::new(Vec::new()),
                log,
            }),
        })
    }

    #[inline]
    pub fn node(&self) -> u8 {
        self.inner.node
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[inline]
    pub fn env(&self) -> &Env {
        &self.inner.env
    }

    #[inline]
    pub fn queue(&self) -> &GlobalQueue {
        &self.inner.queue
    }

    #[inline]
    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    #[inline]
    pub fn socket(&self) -> &SocketServer {
        &self.inner.socket
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    #[inline]
    pub fn profile_enabled(&self) -> bool {
        self.inner.profile
    }

    /// Current tick count (NOW command). One tick is 10 ms.
    #[inline]
    pub fn now_ticks(&self) -> u64 {
        self.inner.timer.ticks()
    }

    /// Wall-clock second the runtime started (STARTTIME command).
    #[inline]
    pub fn start_secs(&self) -> u64 {
        self.inner.clock.origin_secs()
    }

    #[inline]
    pub fn hpc_ns(&self) -> u64 {
        self.inner.clock.hpc_ns()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Message plane
    // ------------------------------------------------------------------

    /// Queue a message for `dest`, waking the service if its mailbox was
    /// idle. This is the one path every producer funnels through.
    pub fn push_message(&self, dest: ServiceHandle, message: Message) -> Result<(), SendError> {
        let ctx = match self.inner.registry.resolve(dest) {
            Some(ctx) => ctx,
            None => return Err(SendError::UnknownDestination(dest)),
        };

        match ctx.mailbox.push(message) {
            Ok(Push::Wake) => {
                self.inner.queue.push(dest);
                Ok(())
            }
            Ok(Push::Queued) => Ok(()),
            Err(_bounced) => Err(SendError::Closed(dest)),
        }
    }

    /// Send a message on behalf of `source`. Returns the session the
    /// message carries (freshly allocated for `Session::Alloc`). On an
    /// addressing failure the message is dropped and, when a session was
    /// in play, an ERROR reply is queued back to the sender so pending
    /// waits can abort.
    pub fn send(
        &self,
        source: Option<&Arc<ServiceContext>>,
        dest: ServiceHandle,
        protocol: ProtocolType,
        session: Session,
        payload: Payload,
    ) -> Result<i32, SendError> {
        let source_handle = source.map(|ctx| ctx.handle()).unwrap_or(ServiceHandle::ZERO);
        let session_val = match session {
            Session::None => 0,
            Session::Fixed(value) => value,
            Session::Alloc => match source {
                Some(ctx) => ctx.alloc_session(),
                None => 0,
            },
        };

        // Zero destination is a sink.
        if dest.is_zero() {
            return Ok(session_val);
        }

        let message = Message {
            source: source_handle,
            session: session_val,
            protocol,
            payload,
        };

        let result = if dest.is_remote(self.inner.node) {
            self.send_remote(dest, message)
        } else {
            self.push_message(dest, message)
        };

        match result {
            Ok(()) => Ok(session_val),
            Err(err) => {
                if session_val != 0 && !source_handle.is_zero() {
                    let _ = self.push_message(source_handle, Message::error_reply(session_val));
                }
                Err(err)
            }
        }
    }

    /// Send addressed by `.local` name, `@global` name or `:hex` literal.
    pub fn send_name(
        &self,
        source: Option<&Arc<ServiceContext>>,
        name: &str,
        protocol: ProtocolType,
        session: Session,
        payload: Payload,
    ) -> Result<i32, SendError> {
        let dest = match NameScope::parse(name) {
            Some(NameScope::Address(handle)) => handle,
            Some(NameScope::Local(local)) => match self.inner.registry.resolve_name(local) {
                Some(handle) => handle,
                None => return Err(SendError::UnknownName(name.to_owned())),
            },
            Some(NameScope::Global(global)) => match self.resolve_global_name(global) {
                Some(handle) => handle,
                None => return Err(SendError::UnknownName(name.to_owned())),
            },
            None => return Err(SendError::UnknownName(name.to_owned())),
        };

        self.send(source, dest, protocol, session, payload)
    }

    /// Wrap a message for another node and hand it to the cluster stub. The
    /// harbor payload prefixes the true destination and protocol so the
    /// stub can unwrap it.
    fn send_remote(&self, dest: ServiceHandle, message: Message) -> Result<(), SendError> {
        let harbor = match self.inner.registry.resolve_name("harbor") {
            Some(handle) => handle,
            None => return Err(SendError::Remote(dest)),
        };

        let body = message.payload.as_bytes();
        let mut wrapped = vec![0u8; 5 + body.len()];
        LittleEndian::write_u32(&mut wrapped[..4], dest.raw());
        wrapped[4] = message.protocol.0;
        wrapped[5..].copy_from_slice(body);

        self.push_message(
            harbor,
            Message {
                source: message.source,
                session: message.session,
                protocol: ProtocolType::HARBOR,
                payload: wrapped.into(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Global (`@`) name space, owned by the cluster stub
    // ------------------------------------------------------------------

    pub fn register_global_name(&self, name: &str, handle: ServiceHandle) {
        self.inner.global_names.write().insert(name.to_owned(), handle);
    }

    pub fn resolve_global_name(&self, name: &str) -> Option<ServiceHandle> {
        self.inner.global_names.read().get(name).copied()
    }

    // ------------------------------------------------------------------
    // Service lifecycle
    // ------------------------------------------------------------------

    /// Launch a service from a named module.
    pub fn launch(&self, module: &str, args: &str) -> Result<ServiceHandle, LaunchError> {
        let service = self.inner.loader.create(module)?;
        self.launch_with(module, service, args)
    }

    /// Launch a pre-built service instance. Messages sent to the handle
    /// while init runs are queued and flow once init succeeds.
    pub fn launch_with(
        &self,
        module: &str,
        service: Box<dyn Service>,
        args: &str,
    ) -> Result<ServiceHandle, LaunchError> {
        let log = &self.inner.log;
        let ctx = self.inner.registry.allocate(|handle| {
            let service_log = log.new(logging::o!(
                "service" => handle.to_text(),
                "module" => module.to_owned()
            ));
            ServiceContext::new(handle, module, service_log)
        })?;
        let handle = ctx.handle();

        *ctx.slot.lock() = Some(service);

        let init_result = {
            let mut guard = ctx.slot.lock();
            let api = ServiceApi::new(self, &ctx);
            guard
                .as_mut()
                .expect("service instance installed above")
                .init(&api, args)
        };

        match init_result {
            Ok(()) if !ctx.exiting() => {
                ctx.mark_init_done();
                if ctx.mailbox.finish_drain() {
                    self.inner.queue.push(handle);
                }
                logging::debug!(self.inner.log, "service launched";
                                "module" => module, "service" => %handle, "args" => args);
                Ok(handle)
            }
            Ok(()) => {
                // Exited during its own init.
                let mut guard = ctx.slot.lock();
                self.destroy(&ctx, &mut guard);
                Err(LaunchError::InitFailed {
                    module: module.to_owned(),
                    reason: "service exited during init".to_owned(),
                })
            }
            Err(err) => {
                logging::error!(self.inner.log, "service init failed";
                                "module" => module, "service" => %handle, "error" => %err);
                let mut guard = ctx.slot.lock();
                self.destroy(&ctx, &mut guard);
                Err(LaunchError::InitFailed {
                    module: module.to_owned(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Tear a service down. Caller must hold the dispatch token (the slot
    /// guard), which guarantees no other worker is executing it. Undelivered
    /// messages with a live session bounce back as ERROR replies.
    pub(crate) fn destroy(
        &self,
        ctx: &Arc<ServiceContext>,
        slot: &mut Option<Box<dyn Service>>,
    ) {
        let handle = ctx.handle();
        self.inner.registry.release(handle);

        for message in ctx.mailbox.close() {
            if message.session != 0 && !message.source.is_zero() {
                let _ = self.push_message(message.source, Message::error_reply(message.session));
            }
        }

        *slot = None;

        self.notify_monitor(format!("EXIT {}", handle));
        logging::info!(self.inner.log, "service destroyed";
                       "service" => %handle, "module" => ctx.module());

        if self.inner.registry.count() == 0 {
            self.initiate_shutdown(0);
        }
    }

    /// Ask another service to exit. Delivered as a SYSTEM message so the
    /// victim's own worker performs the teardown.
    pub fn kill(&self, target: ServiceHandle) -> Result<(), SendError> {
        self.push_message(target, Message::system(ServiceHandle::ZERO, Payload::from("EXIT")))
    }

    /// Deliver one message to a service instance. Returns true when the
    /// service asked to exit. Runs on a worker with the dispatch token held.
    pub(crate) fn deliver(
        &self,
        ctx: &Arc<ServiceContext>,
        service: &mut Box<dyn Service>,
        message: Message,
    ) -> bool {
        // Runtime-level control plane: a SYSTEM "EXIT" is the KILL carrier
        // and never reaches the service handler.
        if message.protocol == ProtocolType::SYSTEM && message.payload.as_bytes() == b"EXIT" {
            return true;
        }

        if ctx.trace() {
            logging::debug!(ctx.log, "deliver";
                            "protocol" => %message.protocol,
                            "session" => message.session,
                            "source" => %message.source,
                            "size" => message.payload.len());
        }

        ctx.count_message();

        let api = ServiceApi::new(self, ctx);
        let verdict = if self.inner.profile {
            let begin = self.inner.clock.hpc_ns();
            let verdict = service.handle(&api, message);
            ctx.add_profile_ns(self.inner.clock.hpc_ns() - begin);
            verdict
        } else {
            service.handle(&api, message)
        };

        verdict == crate::service::Dispatch::Exit
    }

    // ------------------------------------------------------------------
    // Observer services
    // ------------------------------------------------------------------

    pub fn set_monitor_service(&self, handle: ServiceHandle) {
        self.inner.monitor_service.store(handle.raw(), Ordering::Relaxed);
    }

    pub fn monitor_service(&self) -> Option<ServiceHandle> {
        match self.inner.monitor_service.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(ServiceHandle::from_raw(raw)),
        }
    }

    fn notify_monitor(&self, text: String) {
        if let Some(monitor) = self.monitor_service() {
            let _ = self.push_message(
                monitor,
                Message {
                    source: ServiceHandle::ZERO,
                    session: 0,
                    protocol: ProtocolType::TEXT,
                    payload: text.into(),
                },
            );
        }
    }

    pub(crate) fn report_overload(&self, ctx: &Arc<ServiceContext>, length: usize) {
        self.service_log(
            ctx.handle(),
            format!("May overload, message queue length = {}", length),
        );
        self.notify_monitor(format!("OVERLOAD {} {}", ctx.handle(), length));
    }

    pub(crate) fn flag_endless(&self, source: ServiceHandle, dest: ServiceHandle) {
        if let Some(ctx) = self.inner.registry.resolve(dest) {
            ctx.mark_endless();
            if ctx.should_warn_endless() {
                self.service_log(
                    dest,
                    format!(
                        "A message from [ {} ] to [ {} ] maybe in an endless loop",
                        source, dest
                    ),
                );
            }
        }
    }

    /// Route a line of service-level logging through the logger service,
    /// falling back to the root logger before one exists.
    pub fn service_log(&self, source: ServiceHandle, text: String) {
        let logger = self.inner.logger_service.load(Ordering::Relaxed);
        if logger != 0 {
            let delivered = self.push_message(
                ServiceHandle::from_raw(logger),
                Message {
                    source,
                    session: 0,
                    protocol: ProtocolType::TEXT,
                    payload: text.clone().into(),
                },
            );
            if delivered.is_ok() {
                return;
            }
        }
        logging::info!(self.inner.log, "{}", text; "source" => %source);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch the logger service and the bootstrap command, in that order.
    pub fn bootstrap(&self) -> Result<(), LaunchError> {
        let logservice = self.inner.env.get_or("logservice", "logger");
        let logger_arg = self.inner.env.get_or("logger", "");
        let logger = self.launch(&logservice, &logger_arg)?;
        self.inner.logger_service.store(logger.raw(), Ordering::Relaxed);
        self.inner.registry.register_name("logger", logger);

        let boot = self.inner.env.get_or("bootstrap", "sandbox bootstrap");
        let (module, args) = split_command(&boot);
        self.launch(module, args)?;
        Ok(())
    }

    /// Spawn the worker pool and the timer, monitor and socket threads.
    pub fn start(&self) {
        let mut threads = self.inner.threads.lock();

        if let Some(poller) = self.inner.poller.lock().take() {
            let rt = self.clone();
            threads.push(
                thread::Builder::new()
                    .name("skein-socket".to_owned())
                    .spawn(move || poller.run(rt))
                    .expect("failed to spawn socket thread"),
            );
        }

        {
            let rt = self.clone();
            threads.push(
                thread::Builder::new()
                    .name("skein-timer".to_owned())
                    .spawn(move || timer_loop(rt))
                    .expect("failed to spawn timer thread"),
            );
        }

        let watches: Vec<Arc<WorkerWatch>> = (0..self.inner.worker_count)
            .map(|_| Arc::new(WorkerWatch::new()))
            .collect();
        *self.inner.watches.lock() = watches.clone();

        {
            let rt = self.clone();
            threads.push(
                thread::Builder::new()
                    .name("skein-monitor".to_owned())
                    .spawn(move || monitor_loop(rt))
                    .expect("failed to spawn monitor thread"),
            );
        }

        for (id, watch) in watches.into_iter().enumerate() {
            let rt = self.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("skein-worker-{}", id))
                    .spawn(move || worker::worker_loop(rt, id, watch))
                    .expect("failed to spawn worker thread"),
            );
        }
    }

    /// Block until shutdown, then reap every thread. Returns the exit code.
    pub fn wait(&self) -> i32 {
        loop {
            let handle = self.inner.threads.lock().pop();
            match handle {
                Some(handle) => drop(handle.join()),
                None => break,
            }
        }
        self.inner.exit_code.load(Ordering::Acquire)
    }

    pub fn initiate_shutdown(&self, code: i32) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            self.inner.exit_code.store(code, Ordering::Release);
            logging::info!(self.inner.log, "shutdown initiated"; "code" => code);
            self.inner.socket.exit();
        }
    }

    pub(crate) fn watches(&self) -> Vec<Arc<WorkerWatch>> {
        self.inner.watches.lock().clone()
    }

    /// Execute a runtime command for a service (C12).
    pub fn exec_command(
        &self,
        ctx: &Arc<ServiceContext>,
        name: &str,
        param: &str,
    ) -> Result<Option<String>, crate::error::CommandError> {
        command::exec(self, ctx, name, param)
    }
}

fn timer_loop(rt: Runtime) {
    let mut expired = Vec::new();
    while !rt.is_shutdown() {
        let now = rt.inner.clock.elapsed_ticks();
        rt.inner.timer.update(now, &mut expired);
        for node in expired.drain(..) {
            let _ = rt.push_message(node.owner, Message::timer(node.session));
        }
        thread::sleep(Duration::from_micros(2500));
    }
}

fn monitor_loop(rt: Runtime) {
    let watches = rt.watches();
    while !rt.is_shutdown() {
        for _ in 0..CHECK_INTERVAL_SECS {
            if rt.is_shutdown() {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
        for watch in &watches {
            if let Some((source, dest)) = watch.check() {
                rt.flag_endless(source, dest);
            }
        }
    }
}

/// Split a bootstrap command line into module name and argument rest.
pub fn split_command(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.find(' ') {
        Some(at) => (&line[..at], line[at + 1..].trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::service::Dispatch;
    use crossbeam_channel::{unbounded, Receiver, Sender};

    /// Records everything it receives; replies to LUA requests by doubling
    /// the payload and echoing the session back over RESPONSE.
    struct Recorder {
        seen: Sender<(ProtocolType, i32, ServiceHandle, Vec<u8>)>,
    }

    impl Service for Recorder {
        fn init(&mut self, _api: &ServiceApi<'_>, _arg: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch {
            self.seen
                .send((
                    message.protocol,
                    message.session,
                    message.source,
                    message.payload.as_bytes().to_vec(),
                ))
                .unwrap();

            if message.protocol == ProtocolType::LUA {
                let mut doubled = message.payload.as_bytes().to_vec();
                doubled.extend_from_within(..);
                api.send(
                    message.source,
                    ProtocolType::RESPONSE,
                    Session::Fixed(message.session),
                    doubled.into(),
                )
                .unwrap();
            }

            Dispatch::Continue
        }
    }

    fn recorder() -> (Box<dyn Service>, Receiver<(ProtocolType, i32, ServiceHandle, Vec<u8>)>) {
        let (tx, rx) = unbounded();
        (Box::new(Recorder { seen: tx }), rx)
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap()
    }

    /// Drain the run queue on the calling thread until it goes quiet.
    fn settle(rt: &Runtime) {
        let watch = WorkerWatch::new();
        while worker::run_turn(rt, &watch, 0, Duration::from_millis(10)) {}
    }

    #[test]
    fn test_request_response_session_allocation() {
        let rt = runtime();
        let (svc_a, rx_a) = recorder();
        let (svc_b, rx_b) = recorder();
        let a = rt.launch_with("test", svc_a, "").unwrap();
        let b = rt.launch_with("test", svc_b, "").unwrap();

        let ctx_a = rt.registry().resolve(a).unwrap();
        let session = rt
            .send(Some(&ctx_a), b, ProtocolType::LUA, Session::Alloc, Payload::from("rq"))
            .unwrap();
        assert_eq!(session, 1, "first allocated session must be 1");

        settle(&rt);

        let (proto, got_session, source, body) = rx_b.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::LUA);
        assert_eq!(got_session, session);
        assert_eq!(source, a);
        assert_eq!(body, b"rq");

        let (proto, got_session, source, body) = rx_a.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::RESPONSE);
        assert_eq!(got_session, session);
        assert_eq!(source, b);
        assert_eq!(body, b"rqrq");
    }

    #[test]
    fn test_single_sender_ordering() {
        let rt = runtime();
        let (svc, rx) = recorder();
        let dest = rt.launch_with("test", svc, "").unwrap();

        for n in 0..50u8 {
            rt.send(None, dest, ProtocolType::TEXT, Session::None, vec![n].into())
                .unwrap();
        }
        settle(&rt);

        for n in 0..50u8 {
            let (_, _, _, body) = rx.try_recv().unwrap();
            assert_eq!(body, vec![n]);
        }
    }

    #[test]
    fn test_send_to_unknown_destination() {
        let rt = runtime();
        let (svc, rx) = recorder();
        let a = rt.launch_with("test", svc, "").unwrap();
        let ctx_a = rt.registry().resolve(a).unwrap();

        let ghost = ServiceHandle::from_raw(0x00ab_cdef);
        let err = rt
            .send(Some(&ctx_a), ghost, ProtocolType::LUA, Session::Alloc, Payload::Empty)
            .unwrap_err();
        match err {
            SendError::UnknownDestination(handle) => assert_eq!(handle, ghost),
            other => panic!("unexpected error {:?}", other),
        }

        // The failed session came back as an ERROR message.
        settle(&rt);
        let (proto, session, source, _) = rx.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::ERROR);
        assert_eq!(session, 1);
        assert!(source.is_zero());
    }

    #[test]
    fn test_kill_destroys_and_bounces_pending_sessions() {
        let rt = runtime();
        let (svc_a, rx_a) = recorder();
        let (svc_b, _rx_b) = recorder();
        let a = rt.launch_with("test", svc_a, "").unwrap();
        let b = rt.launch_with("test", svc_b, "").unwrap();
        let ctx_a = rt.registry().resolve(a).unwrap();

        // Kill lands first in b's mailbox; the sessioned request behind it
        // must be answered with an ERROR on teardown.
        rt.kill(b).unwrap();
        rt.send(Some(&ctx_a), b, ProtocolType::LUA, Session::Alloc, Payload::Empty)
            .unwrap();
        settle(&rt);

        assert!(rt.registry().resolve(b).is_none());
        let (proto, session, _, _) = rx_a.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::ERROR);
        assert_eq!(session, 1);
    }

    #[test]
    fn test_send_name_scopes() {
        let rt = runtime();
        let (svc, rx) = recorder();
        let dest = rt.launch_with("test", svc, "").unwrap();
        rt.registry().register_name("sink", dest);

        rt.send_name(None, ".sink", ProtocolType::TEXT, Session::None, Payload::from("x"))
            .unwrap();
        rt.send_name(None, &dest.to_text(), ProtocolType::TEXT, Session::None, Payload::from("y"))
            .unwrap();
        match rt.send_name(None, ".ghost", ProtocolType::TEXT, Session::None, Payload::Empty) {
            Err(SendError::UnknownName(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }

        settle(&rt);
        assert_eq!(rx.try_recv().unwrap().3, b"x".to_vec());
        assert_eq!(rx.try_recv().unwrap().3, b"y".to_vec());
    }

    #[test]
    fn test_last_service_exit_shuts_down() {
        let rt = runtime();
        let (svc, _rx) = recorder();
        let only = rt.launch_with("test", svc, "").unwrap();
        rt.kill(only).unwrap();
        settle(&rt);
        assert!(rt.is_shutdown());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("sandbox bootstrap"), ("sandbox", "bootstrap"));
        assert_eq!(split_command("logger"), ("logger", ""));
        assert_eq!(split_command("gate S .watchdog 0.0.0.0:9000 0 8"),
                   ("gate", "S .watchdog 0.0.0.0:9000 0 8"));
    }
}
