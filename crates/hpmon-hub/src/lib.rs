//! # hpmon-hub
//!
//! Server-side subscription bookkeeping for hpmon.
//!
//! - **Room** - the connections interested in one metric or one dashboard
//! - **Hub** - room membership per connection, and metric/dashboard fan-out
//!
//! ```text
//! ┌─────────────┐  join/leave  ┌─────────────┐  publish  ┌──────────────────┐
//! │  Connection │─────────────▶│     Hub     │──────────▶│ Room (temp_flow) │
//! └─────────────┘              └─────────────┘           │ Room (dashboard_)│
//!                                     ▲                  └──────────────────┘
//!                     broadcast_metrics / broadcast_dashboard
//! ```

pub mod hub;
pub mod room;

pub use hub::{Hub, HubConfig, HubError, HubStats, Joined, Left, RoomReceiver};
pub use room::{validate_metric_name, Room, RoomKey, MAX_METRIC_NAME_LENGTH};
