//! Client-side components: the wire connection (Component I), the playback
//! controller (Component J), and the renderer seam it drives.

pub mod connection;
pub mod controller;
pub mod renderer;

pub use connection::ClientConnection;
pub use controller::{ClientIdentity, Controller};
pub use renderer::{NullRenderer, Renderer};
