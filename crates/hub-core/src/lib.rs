pub mod codec;
pub mod protocol;
pub mod state;

pub use codec::{decode_frame, encode_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use protocol::{id, Envelope, HubId, Identity, Message, MessageKind, ModuleId};
pub use state::{HubData, MemoryStateTracker, StateTracker};
