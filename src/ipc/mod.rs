pub mod bridge;
pub mod frame;
pub mod pending;
pub mod worker;

pub use bridge::{Bridge, BridgeEvent, BridgeStats};
pub use frame::{Frame, RequestTicket, WorkerReply, WorkerRoute};
pub use pending::PendingTable;
pub use worker::{WorkerConnection, WorkerSet, WorkerState};
