//! Chat history shaping.

use tracing::warn;

use super::task::ChatHistoryItem;

const SENDER_USER: i64 = 0;

/// Fold raw chat history into `[user, assistant]` turns.
///
/// Consecutive messages from the same sender are joined with `\n`.  A user
/// run followed by an assistant run forms one turn; a trailing user run is
/// kept with an empty reply.  An assistant run with no preceding user run is
/// paired with an empty user message.
pub fn format_history(history: &[ChatHistoryItem]) -> Vec<(String, String)> {
    // Merge runs of the same sender first.
    let mut runs: Vec<(bool, String)> = Vec::new();
    for item in history {
        let is_user = item.sender == SENDER_USER;
        match runs.last_mut() {
            Some((last_is_user, text)) if *last_is_user == is_user => {
                text.push('\n');
                text.push_str(&item.content);
            }
            _ => runs.push((is_user, item.content.clone())),
        }
    }

    let mut turns = Vec::new();
    let mut pending_user: Option<String> = None;
    for (is_user, text) in runs {
        if is_user {
            pending_user = Some(text);
        } else {
            turns.push((pending_user.take().unwrap_or_default(), text));
        }
    }
    if let Some(user) = pending_user {
        warn!("chat history ends with an unanswered user message");
        turns.push((user, String::new()));
    }
    turns
}
