use sha2::{Digest, Sha256};

/// Emoji a new member may be asked to react with.
pub const REACTIONS: [&str; 7] = ["🎉", "🤣", "😃", "😋", "🥳", "🤔", "😅"];

/// The emoji `user_id` must react with to confirm their join.
///
/// Derived from a digest of the id so it is stable across restarts.
pub fn reaction_for(user_id: &str) -> &'static str {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(head);
    REACTIONS[(n % REACTIONS.len() as u64) as usize]
}
