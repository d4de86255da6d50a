//! Realtime room authorization for the Fluxbase backend.
//!
//! Policy outcomes are recomputed per schema for every realtime connection,
//! hashed into stable [`RoomId`]s, and held in a reference-counted table
//! owned by a single authority process. Workers reach the table over a
//! correlated request/response RPC on the event bus. Broadcast events are
//! filtered per room against the current full entity; an entity that no
//! longer matches is retracted with a `delete` verb, never left stale.

pub mod authority;
pub mod broadcast;
pub mod compute;
pub mod room;
pub mod rpc;
pub mod session;
pub mod table;

pub use authority::{RoomAuthority, RoomServiceClient};
pub use broadcast::{ChangeEvent, fan_out, spawn_broadcast_listener};
pub use compute::RoomComputer;
pub use room::{Room, RoomGrant, RoomId};
pub use rpc::{RpcClient, RpcError};
pub use session::{RealtimeTransport, SessionReconciler};
pub use table::RoomTable;
