pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::{ErrorClass, RelayError};
pub use ids::{ConnectionId, RoomId};
pub use protocol::{ClientEnvelope, Decoded, RawEnvelope, ServerEnvelope};
