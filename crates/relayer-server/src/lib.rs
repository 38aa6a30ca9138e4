pub mod connection;
pub mod rooms;
pub mod router;
pub mod server;

pub use connection::{Connection, ConnectionRegistry, HeartbeatConfig};
pub use rooms::{JoinOutcome, RoomDirectory};
pub use router::RelayState;
pub use server::{start, AppState, RelayConfig, ServerHandle};
