//! # hpmon-protocol
//!
//! Wire protocol definitions for hpmon realtime metric updates.
//!
//! Every frame on the wire is a named event with an optional payload:
//!
//! ```text
//! {"event": "metric_update", "data": {"metric": "temp_outside", "value": 4.5}}
//! ```
//!
//! ## Frame Types
//!
//! - [`ClientFrame`] - `subscribe`, `unsubscribe`, `ping`
//! - [`ServerFrame`] - `connected`, `metric_update`, `dashboard_update`,
//!   `subscribed`, `unsubscribed`, `pong`
//!
//! Frames travel either as JSON text or as length-prefixed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use hpmon_protocol::{ClientFrame, Encoding, FrameCodec, ServerFrame};
//!
//! let codec = FrameCodec::new(Encoding::Json);
//! let frame = ClientFrame::subscribe(["temp_outside", "temp_flow"], Some("dash1"));
//!
//! let wire = codec.encode(&frame).unwrap();
//! let decoded: ClientFrame = codec.decode(&wire).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode_json, encode_json, Encoding, FrameCodec, ProtocolError, WireMessage};
pub use frames::{
    ClientFrame, Connected, Envelope, MetricSample, MetricUpdate, Pong, ServerFrame, Subscription,
};
pub use version::{Version, PROTOCOL_VERSION};
