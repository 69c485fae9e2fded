//! Domain models for mail entities

mod account;
mod draft;
mod message;
mod send_status;
mod sync_state;
mod thread;

pub use account::Account;
pub use draft::{Attachment, Draft, OutgoingEmail};
pub use message::{EmailAddress, Message, MessageBuilder, MessageId};
pub use send_status::{BounceKind, DeliveryState, SendStatus};
pub use sync_state::{SyncState, SyncStatus};
pub use thread::{Thread, ThreadId};

/// Label IDs the mailbox provider uses for common states
pub mod labels {
    pub const INBOX: &str = "INBOX";
    pub const SENT: &str = "SENT";
    pub const UNREAD: &str = "UNREAD";
    pub const STARRED: &str = "STARRED";
    pub const TRASH: &str = "TRASH";
}
