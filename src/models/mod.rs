pub mod audit;
pub mod conversation;
pub mod message;
pub mod presence;

pub use audit::{
    AttachmentDigest, AuditEntry, AuditEvent, AuditEventType, AuditPayload, DisputeReport,
    ReportRange,
};
pub use conversation::{Conversation, ConversationId, ConversationKind, LastMessage, Tier};
pub use message::{
    Attachment, Message, MessageType, MessageView, NewMessage, Reaction, ReplyContext, SyncStatus,
};
pub use presence::{PresenceRecord, PresenceStatus, TypingState};
