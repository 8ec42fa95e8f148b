use crate::error::ServiceError;
use crate::message::{Message, ProtocolType};
use crate::service::{Dispatch, Service, ServiceApi};
use std::path::PathBuf;
use strand::logging::{self, Level, Logger};

/// The first service started. TEXT messages become `[:hhhhhhhh] body`
/// records on the configured sink; a SYSTEM message reopens the file so
/// external log rotation works.
pub struct LoggerService {
    path: Option<PathBuf>,
    level: Level,
    sink: Option<Logger>,
}

pub fn create() -> Box<dyn Service> {
    Box::new(LoggerService {
        path: None,
        level: Level::Info,
        sink: None,
    })
}

impl LoggerService {
    fn open_sink(&self) -> Result<Logger, ServiceError> {
        match &self.path {
            Some(path) => logging::file(path, self.level)
                .map_err(|err| ServiceError::Boot(format!("cannot open log {:?}: {}", path, err))),
            None => Ok(logging::terminal(self.level)),
        }
    }

    fn sink(&self) -> &Logger {
        self.sink.as_ref().expect("sink opened during init")
    }
}

impl Service for LoggerService {
    fn init(&mut self, api: &ServiceApi<'_>, arg: &str) -> Result<(), ServiceError> {
        let arg = arg.trim();
        if !arg.is_empty() {
            self.path = Some(PathBuf::from(arg));
        }
        if api.env().get_or("logger_level", "info") == "debug" {
            self.level = Level::Debug;
        }

        self.sink = Some(self.open_sink()?);
        Ok(())
    }

    fn handle(&mut self, _api: &ServiceApi<'_>, message: Message) -> Dispatch {
        match message.protocol {
            ProtocolType::TEXT => {
                logging::info!(self.sink(), "[{}] {}", message.source, message.payload.text());
            }
            ProtocolType::SYSTEM => {
                // External rotation moved the file; re-open our end.
                match self.open_sink() {
                    Ok(sink) => self.sink = Some(sink),
                    Err(err) => logging::error!(self.sink(), "log reopen failed"; "error" => %err),
                }
            }
            _ => (),
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ServiceHandle;
    use crate::message::Payload;
    use crate::runtime::{Runtime, RuntimeOptions};

    #[test]
    fn test_file_sink_receives_text() {
        let dir = std::env::temp_dir().join("skein_logger_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.log");
        let _ = std::fs::remove_file(&path);

        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        let handle = rt
            .launch_with("logger", create(), path.to_str().unwrap())
            .unwrap();
        let ctx = rt.registry().resolve(handle).unwrap();

        let mut guard = ctx.slot.lock();
        let service = guard.as_mut().unwrap();
        let api = crate::service::ServiceApi::new(&rt, &ctx);
        service.handle(
            &api,
            Message {
                source: ServiceHandle::from_raw(0xab),
                session: 0,
                protocol: ProtocolType::TEXT,
                payload: Payload::from("hello log"),
            },
        );
        // Reopen keeps working against the same path.
        service.handle(
            &api,
            Message {
                source: ServiceHandle::ZERO,
                session: 0,
                protocol: ProtocolType::SYSTEM,
                payload: Payload::Empty,
            },
        );
        drop(guard);
        // Tear everything down so the async drain flushes to disk.
        drop(ctx);
        drop(rt);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(":000000ab"), "got {:?}", written);
        assert!(written.contains("hello log"));
    }

    #[test]
    fn test_bad_path_fails_init() {
        let rt = Runtime::new(RuntimeOptions::default(), logging::discard()).unwrap();
        let result = rt.launch_with("logger", create(), "/nonexistent-dir/sub/node.log");
        assert!(result.is_err());
    }
}
