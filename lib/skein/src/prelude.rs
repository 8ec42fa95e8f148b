pub use crate::error::{CommandError, LaunchError, SendError, ServiceError, SocketError};
pub use crate::handle::{NameScope, ServiceHandle};
pub use crate::message::{Message, Payload, ProtocolType};
pub use crate::net::{SocketEvent, SocketId, SocketMessage, SocketServer};
pub use crate::runtime::{Runtime, RuntimeOptions};
pub use crate::service::{Dispatch, Service, ServiceApi, Session};
