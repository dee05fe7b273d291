use crate::DomainResult;
use crate::ports::BoxFuture;
use crate::rooms::{Room, RoomMember, RoomMessage};

/// Committed room state. Reads here never see uncommitted transaction writes.
pub trait RoomDirectory: Send + Sync {
    fn get_room(&self, room_id: &str) -> BoxFuture<'_, DomainResult<Option<Room>>>;

    fn get_member(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RoomMember>>>;

    /// Rooms where the user is a current (not departed) member.
    fn list_active_rooms(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>>;

    /// Messages with `created_at_ms > since_ms` in the given rooms, oldest first.
    fn list_messages_since(
        &self,
        room_ids: &[String],
        since_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<RoomMessage>>>;
}
