//! The narrow binding a script sees. Everything routes through the
//! captured `Runtime` handle and the service's own record; nothing ambient.

use super::HANDLER_KEY;
use crate::command;
use crate::context::ServiceContext;
use crate::handle::ServiceHandle;
use crate::message::{Payload, ProtocolType};
use crate::pack::{self, Table as PackTable, Value as PackValue};
use crate::runtime::Runtime;
use crate::service::Session;
use mlua::{Function, Lua, MultiValue, Table, Value, Variadic};
use std::sync::Arc;
use strand::logging;

const PACK_DEPTH_LIMIT: usize = 32;

pub(super) fn register(lua: &Lua, rt: Runtime, ctx: Arc<ServiceContext>) -> mlua::Result<()> {
    let core = lua.create_table()?;

    {
        let rt = rt.clone();
        let ctx = ctx.clone();
        core.set(
            "send",
            lua.create_function(
                move |_lua,
                      (dest, proto, session, payload): (
                    Value,
                    u8,
                    Option<i32>,
                    Option<mlua::String>,
                )| {
                    let session = match session {
                        None => Session::Alloc,
                        Some(0) => Session::None,
                        Some(value) => Session::Fixed(value),
                    };
                    let payload = to_payload(payload);
                    let result = match dest {
                        Value::Integer(raw) => rt.send(
                            Some(&ctx),
                            ServiceHandle::from_raw(raw as u32),
                            ProtocolType(proto),
                            session,
                            payload,
                        ),
                        Value::String(name) => {
                            let name = name.to_str()?;
                            rt.send_name(Some(&ctx), &name, ProtocolType(proto), session, payload)
                        }
                        _ => {
                            return Err(mlua::Error::RuntimeError(
                                "send: destination must be an address or name".to_owned(),
                            ));
                        }
                    };
                    result.map_err(mlua::Error::external)
                },
            )?,
        )?;
    }

    {
        let rt = rt.clone();
        core.set(
            "redirect",
            lua.create_function(
                move |_lua,
                      (dest, source, proto, session, payload): (
                    u32,
                    u32,
                    u8,
                    i32,
                    Option<mlua::String>,
                )| {
                    rt.push_message(
                        ServiceHandle::from_raw(dest),
                        crate::message::Message {
                            source: ServiceHandle::from_raw(source),
                            session,
                            protocol: ProtocolType(proto),
                            payload: to_payload(payload),
                        },
                    )
                    .map_err(mlua::Error::external)
                },
            )?,
        )?;
    }

    {
        let rt = rt.clone();
        let ctx = ctx.clone();
        core.set(
            "command",
            lua.create_function(
                move |_lua, (name, param): (mlua::String, Option<mlua::String>)| {
                    let name = name.to_str()?;
                    let param = match &param {
                        Some(param) => param.to_str()?.to_string(),
                        None => String::new(),
                    };
                    command::exec(&rt, &ctx, &name, &param).map_err(mlua::Error::external)
                },
            )?,
        )?;
    }

    {
        let ctx = ctx.clone();
        core.set(
            "gensession",
            lua.create_function(move |_lua, ()| Ok(ctx.alloc_session()))?,
        )?;
    }

    {
        let ctx = ctx.clone();
        core.set(
            "self",
            lua.create_function(move |_lua, ()| Ok(ctx.handle().raw()))?,
        )?;
    }

    {
        let rt = rt.clone();
        core.set(
            "now",
            lua.create_function(move |_lua, ()| Ok(rt.now_ticks() as i64))?,
        )?;
    }

    {
        let rt = rt.clone();
        core.set(
            "starttime",
            lua.create_function(move |_lua, ()| Ok(rt.start_secs() as i64))?,
        )?;
    }

    {
        let rt = rt.clone();
        core.set(
            "hpc",
            lua.create_function(move |_lua, ()| Ok(rt.hpc_ns() as i64))?,
        )?;
    }

    {
        let rt = rt.clone();
        let ctx = ctx.clone();
        core.set(
            "log",
            lua.create_function(move |_lua, text: mlua::String| {
                let text = String::from_utf8_lossy(&text.as_bytes()).into_owned();
                rt.service_log(ctx.handle(), text);
                Ok(())
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        core.set(
            "trace",
            lua.create_function(move |_lua, text: mlua::String| {
                logging::trace!(ctx.log, "{}", String::from_utf8_lossy(&text.as_bytes()));
                Ok(())
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        core.set(
            "exit",
            lua.create_function(move |_lua, ()| {
                ctx.request_exit();
                Ok(())
            })?,
        )?;
    }

    core.set(
        "pack",
        lua.create_function(|lua, values: Variadic<Value>| {
            let mut packed = Vec::with_capacity(values.len());
            for value in values.iter() {
                packed.push(to_pack(value, 0)?);
            }
            let bytes = pack::pack(&packed).map_err(mlua::Error::external)?;
            lua.create_string(&bytes)
        })?,
    )?;

    core.set(
        "unpack",
        lua.create_function(|lua, bytes: mlua::String| {
            let values = pack::unpack(&bytes.as_bytes()).map_err(mlua::Error::external)?;
            let mut out = Vec::with_capacity(values.len());
            for value in &values {
                out.push(to_lua(lua, value)?);
            }
            Ok(MultiValue::from_vec(out))
        })?,
    )?;

    core.set(
        "set_handler",
        lua.create_function(|lua, handler: Function| {
            lua.set_named_registry_value(HANDLER_KEY, handler)
        })?,
    )?;

    // Loaded through `require "skein.core"`.
    lua.set_named_registry_value("skein_core", core)?;
    let preload: Table = lua
        .globals()
        .get::<Table>("package")?
        .get::<Table>("preload")?;
    preload.set(
        "skein.core",
        lua.create_function(|lua, ()| lua.named_registry_value::<Table>("skein_core"))?,
    )?;

    Ok(())
}

fn to_payload(payload: Option<mlua::String>) -> Payload {
    match payload {
        Some(payload) => Payload::from(payload.as_bytes().to_vec()),
        None => Payload::Empty,
    }
}

/// Lua value → canonical serialisation domain.
fn to_pack(value: &Value, depth: usize) -> mlua::Result<PackValue> {
    if depth > PACK_DEPTH_LIMIT {
        return Err(mlua::Error::RuntimeError("pack: table too deep".to_owned()));
    }

    match value {
        Value::Nil => Ok(PackValue::Nil),
        Value::Boolean(flag) => Ok(PackValue::Bool(*flag)),
        Value::Integer(n) => Ok(PackValue::Int(*n)),
        Value::Number(n) => Ok(PackValue::Real(*n)),
        Value::String(s) => Ok(PackValue::Str(s.as_bytes().to_vec())),
        Value::Table(table) => {
            let len = table.raw_len();
            let mut packed = PackTable::default();

            for index in 1..=len {
                let item: Value = table.raw_get(index as i64)?;
                packed.array.push(to_pack(&item, depth + 1)?);
            }

            for pair in table.clone().pairs::<Value, Value>() {
                let (key, item) = pair?;
                if let Value::Integer(index) = key {
                    if index >= 1 && index as usize <= len {
                        continue;
                    }
                }
                packed
                    .hash
                    .push((to_pack(&key, depth + 1)?, to_pack(&item, depth + 1)?));
            }

            Ok(PackValue::Table(packed))
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "pack: unsupported value of type {}",
            other.type_name()
        ))),
    }
}

/// Canonical serialisation domain → Lua value.
fn to_lua(lua: &Lua, value: &PackValue) -> mlua::Result<Value> {
    match value {
        PackValue::Nil => Ok(Value::Nil),
        PackValue::Bool(flag) => Ok(Value::Boolean(*flag)),
        PackValue::Int(n) => Ok(Value::Integer(*n)),
        PackValue::Real(n) => Ok(Value::Number(*n)),
        PackValue::Str(bytes) => Ok(Value::String(lua.create_string(bytes)?)),
        PackValue::Table(table) => {
            let out = lua.create_table()?;
            for (index, item) in table.array.iter().enumerate() {
                out.raw_set((index + 1) as i64, to_lua(lua, item)?)?;
            }
            for (key, item) in &table.hash {
                out.raw_set(to_lua(lua, key)?, to_lua(lua, item)?)?;
            }
            Ok(Value::Table(out))
        }
    }
}
