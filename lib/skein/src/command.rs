//! Synchronous service-to-runtime commands (the C12 table). Each executes
//! inline on the calling worker while the sender's handler is active, which
//! serialises it against the rest of that service's state for free.

use crate::context::ServiceContext;
use crate::error::CommandError;
use crate::handle::{NameScope, ServiceHandle};
use crate::message::Message;
use crate::registry::NameRegistration;
use crate::runtime::{split_command, Runtime};
use crate::service::ServiceApi;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub fn exec(
    rt: &Runtime,
    ctx: &Arc<ServiceContext>,
    name: &str,
    param: &str,
) -> Result<Option<String>, CommandError> {
    let param = param.trim();
    match name {
        "REG" => reg(rt, ctx, param),
        "QUERY" => query(rt, param),
        "NAME" => assign_name(rt, param),
        "EXIT" => {
            ctx.request_exit();
            Ok(None)
        }
        "KILL" => kill(rt, ctx, param),
        "LAUNCH" => launch(rt, param),
        "GETENV" => Ok(rt.env().get(param)),
        "SETENV" => setenv(rt, param),
        "STARTTIME" => Ok(Some(rt.start_secs().to_string())),
        "NOW" => Ok(Some(rt.now_ticks().to_string())),
        "STAT" => stat(ctx, param),
        "TIMEOUT" => timeout(rt, ctx, param),
        "ABORT" => {
            rt.initiate_shutdown(0);
            Ok(None)
        }
        "MONITOR" => monitor(rt, param),
        "MQLEN" => Ok(Some(ctx.mailbox.len().to_string())),
        "LOGON" => {
            ctx.set_trace(true);
            Ok(None)
        }
        "LOGOFF" => {
            ctx.set_trace(false);
            Ok(None)
        }
        "SIGNAL" => signal(rt, param),
        "ENDLESS" => {
            ctx.mark_endless();
            Ok(None)
        }
        // Reserved for service-specific debug consoles.
        "DBGCMD" => Ok(None),
        other => Err(CommandError::Unknown(other.to_owned())),
    }
}

fn resolve_target(rt: &Runtime, param: &str) -> Option<ServiceHandle> {
    match NameScope::parse(param)? {
        NameScope::Address(handle) => Some(handle),
        NameScope::Local(local) => rt.registry().resolve_name(local),
        NameScope::Global(global) => rt.resolve_global_name(global),
    }
}

fn reg(rt: &Runtime, ctx: &Arc<ServiceContext>, param: &str) -> Result<Option<String>, CommandError> {
    if param.is_empty() {
        return Ok(Some(ctx.handle().to_text()));
    }

    match NameScope::parse(param) {
        Some(NameScope::Local(local)) => match rt.registry().register_name(local, ctx.handle()) {
            NameRegistration::Registered | NameRegistration::AlreadyOwn => {
                Ok(Some(param.to_owned()))
            }
            NameRegistration::Duplicate(owner) => Err(CommandError::Failed {
                command: "REG",
                reason: format!("name {} already held by {}", param, owner),
            }),
        },
        _ => Err(CommandError::BadParam {
            command: "REG",
            param: param.to_owned(),
        }),
    }
}

fn query(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    Ok(resolve_target(rt, param).map(|handle| handle.to_text()))
}

fn assign_name(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    // "NAME .name :hhhhhhhh"
    let (name, addr) = split_command(param);
    let handle: ServiceHandle = addr.parse().map_err(|_| CommandError::BadParam {
        command: "NAME",
        param: param.to_owned(),
    })?;

    match NameScope::parse(name) {
        Some(NameScope::Local(local)) => match rt.registry().register_name(local, handle) {
            NameRegistration::Registered | NameRegistration::AlreadyOwn => Ok(Some(name.to_owned())),
            NameRegistration::Duplicate(owner) => Err(CommandError::Failed {
                command: "NAME",
                reason: format!("name {} already held by {}", name, owner),
            }),
        },
        _ => Err(CommandError::BadParam {
            command: "NAME",
            param: param.to_owned(),
        }),
    }
}

fn kill(rt: &Runtime, ctx: &Arc<ServiceContext>, param: &str) -> Result<Option<String>, CommandError> {
    let target = resolve_target(rt, param).ok_or_else(|| CommandError::Failed {
        command: "KILL",
        reason: format!("no such service {}", param),
    })?;

    if target == ctx.handle() {
        ctx.request_exit();
        return Ok(None);
    }

    rt.kill(target).map_err(|err| CommandError::Failed {
        command: "KILL",
        reason: err.to_string(),
    })?;
    Ok(None)
}

fn launch(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    let (module, args) = split_command(param);
    if module.is_empty() {
        return Err(CommandError::BadParam {
            command: "LAUNCH",
            param: param.to_owned(),
        });
    }

    rt.launch(module, args)
        .map(|handle| Some(handle.to_text()))
        .map_err(|err| CommandError::Failed {
            command: "LAUNCH",
            reason: err.to_string(),
        })
}

fn setenv(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    let (key, value) = split_command(param);
    if key.is_empty() {
        return Err(CommandError::BadParam {
            command: "SETENV",
            param: param.to_owned(),
        });
    }
    rt.env().set(key, value);
    Ok(None)
}

fn stat(ctx: &Arc<ServiceContext>, param: &str) -> Result<Option<String>, CommandError> {
    let value = match param {
        "cpu" => (ctx.profile_ns() / 1000).to_string(),
        "mqlen" => ctx.mailbox.len().to_string(),
        "message" => ctx.message_count().to_string(),
        "endless" => if ctx.take_endless() { "1" } else { "0" }.to_owned(),
        "mem" => ctx.signals.mem.load(Ordering::Relaxed).to_string(),
        // Script-internal task counts live above the runtime.
        "task" => "0".to_owned(),
        _ => {
            return Err(CommandError::BadParam {
                command: "STAT",
                param: param.to_owned(),
            });
        }
    };
    Ok(Some(value))
}

fn timeout(rt: &Runtime, ctx: &Arc<ServiceContext>, param: &str) -> Result<Option<String>, CommandError> {
    let (ticks, rest) = split_command(param);
    let ticks: i64 = ticks.parse().map_err(|_| CommandError::BadParam {
        command: "TIMEOUT",
        param: param.to_owned(),
    })?;

    let session = if rest.is_empty() {
        ctx.alloc_session()
    } else {
        rest.parse().map_err(|_| CommandError::BadParam {
            command: "TIMEOUT",
            param: param.to_owned(),
        })?
    };

    if ticks <= 0 {
        // Expired on arrival: deliver inline without touching the wheel.
        let _ = rt.push_message(ctx.handle(), Message::timer(session));
    } else {
        rt.timer().schedule(ticks as u32, ctx.handle(), session);
    }

    Ok(Some(session.to_string()))
}

fn monitor(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    if param.is_empty() {
        return Ok(rt.monitor_service().map(|handle| handle.to_text()));
    }

    let target = resolve_target(rt, param).ok_or_else(|| CommandError::Failed {
        command: "MONITOR",
        reason: format!("no such service {}", param),
    })?;
    rt.set_monitor_service(target);
    Ok(None)
}

fn signal(rt: &Runtime, param: &str) -> Result<Option<String>, CommandError> {
    let (addr, sig) = split_command(param);
    let target = resolve_target(rt, addr).ok_or_else(|| CommandError::Failed {
        command: "SIGNAL",
        reason: format!("no such service {}", addr),
    })?;
    let sig: i32 = if sig.is_empty() {
        0
    } else {
        sig.parse().map_err(|_| CommandError::BadParam {
            command: "SIGNAL",
            param: param.to_owned(),
        })?
    };

    let target_ctx = rt
        .registry()
        .resolve(target)
        .ok_or_else(|| CommandError::Failed {
            command: "SIGNAL",
            reason: format!("no such service {}", addr),
        })?;

    // Signal 0 must reach a handler stuck mid-message: raise the trap flag
    // the cooperative hook polls, then deliver synchronously if the
    // dispatch token happens to be free.
    if sig == 0 {
        target_ctx.signals.trap.store(true, Ordering::Release);
    }

    if let Some(mut guard) = target_ctx.slot.try_lock() {
        if let Some(service) = guard.as_mut() {
            let api = ServiceApi::new(rt, &target_ctx);
            service.signal(&api, sig);
        }
    }

    Ok(None)
}
