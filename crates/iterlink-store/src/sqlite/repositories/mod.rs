//! Stateless repositories. Every method takes `&Connection`.

pub mod event;
pub mod session;
pub mod sync_meta;

pub use event::EventRepo;
pub use session::{SessionRepo, SessionRow};
pub use sync_meta::{SyncMeta, SyncMetaRepo};
