pub mod api;
pub mod sticker_core;

pub use crate::api::router;
pub use crate::sticker_core::{Engine, ServerConfig};
