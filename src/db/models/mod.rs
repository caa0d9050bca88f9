//! Database models split into separate files, re-exported at the
//! `crate::db::models` namespace.

pub mod batch;
pub mod delivery_log;
pub mod notification;
pub mod pending_delta;
pub mod preferences;
pub mod queue_message;

pub use self::batch::*;
pub use self::delivery_log::*;
pub use self::notification::*;
pub use self::pending_delta::*;
pub use self::preferences::*;
pub use self::queue_message::*;
