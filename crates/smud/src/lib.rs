//! Source-measure unit server: arbitrates one instrument between many clients.

pub mod dispatch;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod instrument;
pub mod monitor;
pub mod reading;
pub mod server;
pub mod stats;
pub mod sweep;

pub use error::CommandError;
pub use guard::InstrumentGuard;
pub use instrument::Instrument;
pub use server::{ServeOptions, serve};
