//! Ordered-list diffing used to reconcile plugin-reported entries against
//! stored ones.

/// Return the keys of stored entries absent from the reported list. Both
/// inputs must be strictly ascending by the extracted key; a violation is a
/// caller bug, not a recoverable condition. Single O(n+m) forward pass.
pub fn stale_stored<T, K, F>(stored: &[T], reported: &[T], key: F) -> Vec<K>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut stale = Vec::new();
    let mut reported_iter = reported.iter().map(&key).peekable();

    for stored_key in stored.iter().map(&key) {
        loop {
            match reported_iter.peek() {
                Some(reported_key) if *reported_key < stored_key => {
                    // New entry on the portal side; nothing stored to touch.
                    reported_iter.next();
                }
                Some(reported_key) if *reported_key == stored_key => {
                    reported_iter.next();
                    break;
                }
                _ => {
                    // Reported list skipped past this key (or ran out): the
                    // stored entry no longer exists.
                    stale.push(stored_key);
                    break;
                }
            }
        }
    }
    stale
}
