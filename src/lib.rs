//! Core library for discofy: move a Discogs collection folder into a Spotify playlist
pub mod api;
pub mod auth;
pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod matcher;
pub mod models;
pub mod reconciler;
pub mod report;
pub mod session;
pub mod util;

pub use error::{Result, TransferError};
pub use session::TransferSession;
