//! Notification decisions for the Driftwood engine.
//!
//! The dispatcher turns queue and channel events into notifications,
//! filters them against the user's preferences, and hands the survivors
//! to a renderer supplied by the host.

pub mod dispatcher;
pub mod preferences;
pub mod renderer;

pub use dispatcher::{
    Decision, Notification, NotificationDispatcher, SuppressReason, CATEGORY_CONNECTION_DEGRADED,
    CATEGORY_SYNC_COMPLETED, CATEGORY_SYNC_FAILED,
};
pub use preferences::{PreferenceStore, Preferences, QuietHours};
pub use renderer::{LogRenderer, NotificationRenderer, RecordingRenderer, RenderedNotification};
