//! The scriptable service host. One `sandbox` instance embeds a Lua
//! interpreter, boots a named script through the configured loader and
//! routes every subsequent message into the script's installed handler.

mod api;

use crate::context::ServiceContext;
use crate::error::ServiceError;
use crate::message::{Message, ProtocolType};
use crate::service::{Dispatch, Service, ServiceApi, Session};
use mlua::{Function, HookTriggers, Lua, VmState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strand::logging;

const HANDLER_KEY: &str = "skein_handler";
const HOOK_INSTRUCTION_INTERVAL: u32 = 5000;

pub struct SandboxService {
    lua: Option<Lua>,
    boot_args: String,
}

pub fn create() -> Box<dyn Service> {
    Box::new(SandboxService {
        lua: None,
        boot_args: String::new(),
    })
}

impl SandboxService {
    /// Build the interpreter and run the loader script. Called on the first
    /// message turn, not in init, so a slow script boot never stalls the
    /// launching service.
    fn boot(&mut self, api: &ServiceApi<'_>) -> Result<(), String> {
        let lua = Lua::new();
        let env = api.env();
        let ctx = api.context().clone();

        let memlimit = env.get_usize("memlimit", 0);
        if memlimit > 0 {
            lua.set_memory_limit(memlimit)
                .map_err(|err| format!("cannot set memory limit: {}", err))?;
            logging::info!(api.log(), "script memory limit set"; "bytes" => memlimit);
        }

        install_trap_hook(&lua, ctx);

        api::register(&lua, api.runtime().clone(), api.context().clone())
            .map_err(|err| format!("cannot register runtime binding: {}", err))?;

        // Path variables the loader script resolves against.
        let globals = lua.globals();
        let pairs = [
            ("LUA_PATH", env.get_or("lua_path", "./lualib/?.lua;./lualib/?/init.lua")),
            ("LUA_CPATH", env.get_or("lua_cpath", "./luaclib/?.so")),
            ("LUA_SERVICE", env.get_or("luaservice", "./service/?.lua")),
            ("LUA_PRELOAD", env.get_or("preload", "")),
        ];
        for (key, value) in &pairs {
            globals
                .set(*key, value.as_str())
                .map_err(|err| format!("cannot seed {}: {}", key, err))?;
        }
        drop(globals);

        let loader_path = env.get_or("lualoader", "./lualib/loader.lua");
        let source = std::fs::read_to_string(&loader_path)
            .map_err(|err| format!("can't load {}: {}", loader_path, err))?;

        lua.load(source.as_str())
            .set_name(loader_path.as_str())
            .call::<()>(self.boot_args.as_str())
            .map_err(|err| format!("lua loader error: {}", err))?;

        self.lua = Some(lua);
        Ok(())
    }

    fn report_launcher_error(&self, api: &ServiceApi<'_>) {
        let _ = api.send_name(".launcher", ProtocolType::TEXT, Session::None, "ERROR".into());
    }

    fn dispatch(&mut self, api: &ServiceApi<'_>, message: Message) {
        let lua = self.lua.as_ref().expect("booted before dispatch");

        let handler: Function = match lua.named_registry_value(HANDLER_KEY) {
            Ok(handler) => handler,
            Err(_) => {
                logging::warn!(api.log(), "message dropped, no script handler installed";
                               "protocol" => %message.protocol);
                return;
            }
        };

        let payload = match lua.create_string(message.payload.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => {
                api.runtime()
                    .service_log(api.handle(), format!("lua payload error: {}", err));
                return;
            }
        };

        let result = handler.call::<()>((
            message.protocol.0,
            message.session,
            message.source.raw(),
            payload,
        ));

        // An uncaught script error is logged with its trace; the service
        // keeps running (spec: pending sessions are the script's problem).
        if let Err(err) = result {
            api.runtime()
                .service_log(api.handle(), format!("lua error: {}", err));
        }

        api.context()
            .signals
            .mem
            .store(lua.used_memory(), Ordering::Relaxed);
    }
}

fn install_trap_hook(lua: &Lua, ctx: Arc<ServiceContext>) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if ctx.signals.trap.swap(false, Ordering::AcqRel) {
                return Err(mlua::Error::RuntimeError("interrupted by signal 0".to_owned()));
            }
            Ok(VmState::Continue)
        },
    );
}

impl Service for SandboxService {
    fn init(&mut self, api: &ServiceApi<'_>, arg: &str) -> Result<(), ServiceError> {
        if arg.trim().is_empty() {
            return Err(ServiceError::Boot("sandbox needs a script name".to_owned()));
        }
        self.boot_args = arg.to_owned();

        // First message to self triggers the interpreter boot on a worker.
        api.send(api.handle(), ProtocolType::TEXT, Session::None, crate::message::Payload::Empty)
            .map_err(|err| ServiceError::Boot(err.to_string()))?;
        Ok(())
    }

    fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch {
        if self.lua.is_none() {
            if let Err(reason) = self.boot(api) {
                api.runtime().service_log(api.handle(), reason.clone());
                logging::error!(api.log(), "sandbox boot failed"; "reason" => reason);
                self.report_launcher_error(api);
                return Dispatch::Exit;
            }
            return Dispatch::Continue;
        }

        self.dispatch(api, message);
        Dispatch::Continue
    }

    fn signal(&mut self, api: &ServiceApi<'_>, signal: i32) {
        match signal {
            // The trap flag is raised by the SIGNAL command before we get
            // here; the instruction hook does the actual interrupt.
            0 => logging::info!(api.log(), "signal 0: script interrupt armed"),
            1 => {
                let used = self.lua.as_ref().map(Lua::used_memory).unwrap_or(0);
                api.runtime().service_log(
                    api.handle(),
                    format!("Current memory {:.3}K", used as f64 / 1024.0),
                );
            }
            other => logging::debug!(api.log(), "signal ignored"; "signal" => other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ServiceHandle;
    use crate::message::Payload;
    use crate::monitor::WorkerWatch;
    use crate::pack::{self, Value};
    use crate::runtime::{Runtime, RuntimeOptions};
    use crate::worker;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::io::Write;
    use std::time::Duration;

    fn settle(rt: &Runtime) {
        let watch = WorkerWatch::new();
        while worker::run_turn(rt, &watch, 0, Duration::from_millis(10)) {}
    }

    struct Probe {
        seen: Sender<(ProtocolType, i32, Vec<u8>)>,
    }

    impl Service for Probe {
        fn init(&mut self, _api: &ServiceApi<'_>, _arg: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        fn handle(&mut self, _api: &ServiceApi<'_>, message: Message) -> Dispatch {
            self.seen
                .send((
                    message.protocol,
                    message.session,
                    message.payload.as_bytes().to_vec(),
                ))
                .unwrap();
            Dispatch::Continue
        }
    }

    fn probe(rt: &Runtime) -> (ServiceHandle, Receiver<(ProtocolType, i32, Vec<u8>)>) {
        let (tx, rx) = unbounded();
        let handle = rt
            .launch_with("probe", Box::new(Probe { seen: tx }), "")
            .unwrap();
        (handle, rx)
    }

    fn write_loader(name: &str, body: &str) -> String {
        let dir = std::env::temp_dir().join("skein_sandbox_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_str().unwrap().to_owned()
    }

    const ECHO_LOADER: &str = r#"
local boot = ...
local core = require "skein.core"
assert(boot == "echo", "unexpected boot arg: " .. tostring(boot))
core.set_handler(function(proto, session, source, msg)
    if proto == 10 then
        core.send(source, 1, session, "pong:" .. msg)
    end
end)
"#;

    #[test]
    fn test_boot_and_echo() {
        let loader = write_loader("echo_loader.lua", ECHO_LOADER);
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        rt.env().set("lualoader", &loader);

        let sandbox = rt.launch_with("sandbox", create(), "echo").unwrap();
        settle(&rt);

        let (requester, rx) = probe(&rt);
        let ctx = rt.registry().resolve(requester).unwrap();
        let session = rt
            .send(
                Some(&ctx),
                sandbox,
                ProtocolType::LUA,
                Session::Alloc,
                Payload::from("hi"),
            )
            .unwrap();
        settle(&rt);

        let (proto, got_session, body) = rx.try_recv().unwrap();
        assert_eq!(proto, ProtocolType::RESPONSE);
        assert_eq!(got_session, session);
        assert_eq!(body, b"pong:hi".to_vec());
    }

    const PACK_LOADER: &str = r#"
local core = require "skein.core"
core.set_handler(function(proto, session, source, msg)
    if proto == 10 then
        local a, b, t = core.unpack(msg)
        assert(a == 7 and b == "in")
        assert(t[1] == 1 and t.key == "v")
        core.send(source, 1, session, core.pack(42, "out", { 3, nested = true }))
    end
end)
"#;

    #[test]
    fn test_pack_bridge_roundtrip() {
        let loader = write_loader("pack_loader.lua", PACK_LOADER);
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        rt.env().set("lualoader", &loader);

        let sandbox = rt.launch_with("sandbox", create(), "packer").unwrap();
        settle(&rt);

        let request = pack::pack(&[
            Value::Int(7),
            Value::str("in"),
            Value::Table(pack::Table {
                array: vec![Value::Int(1)],
                hash: vec![(Value::str("key"), Value::str("v"))],
            }),
        ])
        .unwrap();

        let (requester, rx) = probe(&rt);
        let ctx = rt.registry().resolve(requester).unwrap();
        rt.send(
            Some(&ctx),
            sandbox,
            ProtocolType::LUA,
            Session::Alloc,
            request.into(),
        )
        .unwrap();
        settle(&rt);

        let (_, _, body) = rx.try_recv().unwrap();
        let values = pack::unpack(&body).unwrap();
        assert_eq!(values[0], Value::Int(42));
        assert_eq!(values[1], Value::str("out"));
        match &values[2] {
            Value::Table(table) => {
                assert_eq!(table.array, vec![Value::Int(3)]);
                assert_eq!(
                    table.hash,
                    vec![(Value::str("nested"), Value::Bool(true))]
                );
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_boot_failure_exits_service() {
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        rt.env().set("lualoader", "/nonexistent/loader.lua");

        let sandbox = rt.launch_with("sandbox", create(), "ghost").unwrap();
        settle(&rt);

        // Boot ran on the first turn, failed, and the service exited.
        assert!(rt.registry().resolve(sandbox).is_none());
    }

    const ERROR_LOADER: &str = r#"
local core = require "skein.core"
core.set_handler(function(proto, session, source, msg)
    error("deliberate failure")
end)
"#;

    #[test]
    fn test_script_error_keeps_service_alive() {
        let loader = write_loader("error_loader.lua", ERROR_LOADER);
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        rt.env().set("lualoader", &loader);

        let sandbox = rt.launch_with("sandbox", create(), "crasher").unwrap();
        settle(&rt);

        rt.send(None, sandbox, ProtocolType::LUA, Session::None, Payload::from("boom"))
            .unwrap();
        settle(&rt);

        assert!(rt.registry().resolve(sandbox).is_some(), "service must survive script errors");
    }
}
