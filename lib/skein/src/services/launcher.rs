use crate::error::ServiceError;
use crate::handle::ServiceHandle;
use crate::message::{Message, ProtocolType};
use crate::runtime::split_command;
use crate::service::{Dispatch, Service, ServiceApi, Session};
use indexmap::IndexMap;
use strand::logging;

/// Launch broker. Registered as `.launcher`; peers ask it to start services
/// over TEXT and get the new address (or an error) back on their session.
/// Script sandboxes report failed boots here with a bare "ERROR".
pub struct LauncherService {
    children: IndexMap<ServiceHandle, String>,
}

pub fn create() -> Box<dyn Service> {
    Box::new(LauncherService {
        children: IndexMap::new(),
    })
}

impl LauncherService {
    fn reply(&self, api: &ServiceApi<'_>, message: &Message, text: String) {
        if message.session != 0 && !message.source.is_zero() {
            let _ = api.send(
                message.source,
                ProtocolType::RESPONSE,
                Session::Fixed(message.session),
                text.into(),
            );
        }
    }

    fn launch(&mut self, api: &ServiceApi<'_>, message: &Message, command: &str) {
        let (module, args) = split_command(command);
        match api.runtime().launch(module, args) {
            Ok(handle) => {
                self.children.insert(handle, command.to_owned());
                self.reply(api, message, handle.to_text());
            }
            Err(err) => {
                logging::error!(api.log(), "launch failed"; "command" => command, "error" => %err);
                self.reply(api, message, format!("ERROR {}", err));
            }
        }
    }

    fn list(&self, api: &ServiceApi<'_>, message: &Message) {
        let listing: Vec<String> = self
            .children
            .iter()
            .map(|(handle, command)| format!("{} {}", handle, command))
            .collect();
        self.reply(api, message, listing.join("\n"));
    }
}

impl Service for LauncherService {
    fn init(&mut self, api: &ServiceApi<'_>, _arg: &str) -> Result<(), ServiceError> {
        api.command("REG", ".launcher")
            .map_err(|err| ServiceError::Boot(err.to_string()))?;
        Ok(())
    }

    fn handle(&mut self, api: &ServiceApi<'_>, message: Message) -> Dispatch {
        if message.protocol != ProtocolType::TEXT {
            return Dispatch::Continue;
        }

        let line = message.payload.text().into_owned();
        let (command, rest) = split_command(&line);
        match command {
            "LAUNCH" => self.launch(api, &message, rest),
            "LIST" => self.list(api, &message),
            // A child's bootstrap failed after launch returned.
            "ERROR" => {
                logging::warn!(api.log(), "child reported boot failure"; "source" => %message.source);
                self.children.shift_remove(&message.source);
            }
            "REMOVE" => {
                self.children.shift_remove(&message.source);
            }
            other => {
                logging::warn!(api.log(), "unknown launcher command"; "command" => other);
            }
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
    fn test_launch_via_text_command() {
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        let launcher = rt.launch_with("launcher", create(), "").unwrap();

        // The launcher registered itself.
        assert_eq!(rt.registry().resolve_name("launcher"), Some(launcher));

        rt.push_message(
            launcher,
            Message {
                source: ServiceHandle::ZERO,
                session: 0,
                protocol: ProtocolType::TEXT,
                payload: Payload::from("LAUNCH harbor 0"),
            },
        )
        .unwrap();
        settle(&rt);

        // A harbor instance is now registered under its boot name.
        assert!(rt.registry().resolve_name("harbor").is_some());
    }
}
