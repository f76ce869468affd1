/// Events beyond this many unread ones are dropped.
pub const MAX_EVENTS: usize = 256;
