//! Worker node: downloads magnet-addressed torrents, slices their video
//! into HLS segments, and serves the results to browsers over WebRTC data
//! channels. Control traffic flows through a single reconnecting WebSocket
//! to the gateway.

pub mod download;
pub mod ice;
pub mod link;
pub mod peer;
pub mod transcode;
pub mod worker;
