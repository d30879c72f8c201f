use tracing::debug;

use crate::target::Target;
use crate::transport::Transport;

/// Reports whether `user_id` is still inside every target chat.
///
/// A failed lookup counts as "not joined" so an unreachable chat can never
/// unlock a file.
pub fn all_joined(transport: &dyn Transport, targets: &[Target], user_id: i64) -> bool {
    for target in targets {
        match transport.member_status(&target.check_handle, user_id) {
            Ok(status) if status.has_departed() => {
                debug!(user_id, chat = %target, ?status, "user not in target");
                return false;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(user_id, chat = %target, error = %err, "membership check failed");
                return false;
            }
        }
    }
    true
}
