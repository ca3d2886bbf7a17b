//! video-mirror - broadcast a capture device to WebRTC viewers
//!
//! A single capture/encode pipeline produces H.264 samples which are fanned
//! out to every connected browser over its own peer connection.

pub mod config;
pub mod error;
pub mod state;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
