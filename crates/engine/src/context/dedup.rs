//! Conversation-level file deduplication.
//!
//! A path is sent to the model once, at the turn that first attached it.
//! Later turns that attach the same unchanged file add nothing. If the
//! modification time recorded for a later attachment differs from the one
//! seen at first attachment, the file changed on disk and the later turn
//! becomes its new first sighting.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use threadgate_core::thread::{FileReference, Turn};
use tracing::debug;

/// Reduce the files attached across `turns` (oldest first) to the
/// references that must actually be in context.
///
/// Each returned path appears once. References are ordered by the turn
/// that introduced them, then by position within that turn.
pub fn reduce(turns: &[Turn]) -> Vec<FileReference> {
    // path -> (mtime at introduction, turn index, position in turn)
    let mut seen: HashMap<&PathBuf, (Option<DateTime<Utc>>, usize, usize)> = HashMap::new();

    for (turn_index, turn) in turns.iter().enumerate() {
        for (position, file) in turn.files.iter().enumerate() {
            match seen.get_mut(&file.path) {
                None => {
                    seen.insert(&file.path, (file.modified_at, turn_index, position));
                }
                Some(entry) if entry.0 != file.modified_at => {
                    debug!(
                        path = %file.path.display(),
                        previous_turn = entry.1,
                        turn = turn_index,
                        "File changed on disk, re-sending"
                    );
                    *entry = (file.modified_at, turn_index, position);
                }
                Some(_) => {}
            }
        }
    }

    let mut refs: Vec<_> = seen
        .into_iter()
        .map(|(path, (_, turn_index, position))| (turn_index, position, path.clone()))
        .collect();
    refs.sort();

    refs.into_iter()
        .map(|(first_seen_turn_index, _, path)| FileReference {
            path,
            first_seen_turn_index,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use threadgate_core::thread::AttachedFile;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn turn(files: &[(&str, Option<DateTime<Utc>>)]) -> Turn {
        Turn::user("review", "look").with_files(
            files
                .iter()
                .map(|(p, m)| AttachedFile::new(*p).with_modified_at(*m))
                .collect(),
        )
    }

    #[test]
    fn unchanged_file_is_sent_once_at_first_sighting() {
        let turns = vec![
            turn(&[("/a.py", at(100))]),
            turn(&[]),
            turn(&[("/a.py", at(100))]),
            turn(&[]),
            turn(&[("/a.py", at(100))]),
        ];

        let refs = reduce(&turns);
        assert_eq!(
            refs,
            vec![FileReference {
                path: PathBuf::from("/a.py"),
                first_seen_turn_index: 0,
            }]
        );
    }

    #[test]
    fn modified_file_is_reintroduced() {
        let turns = vec![
            turn(&[("/a.py", at(100))]),
            turn(&[]),
            turn(&[("/a.py", at(100))]),
            turn(&[]),
            turn(&[("/a.py", at(250))]),
        ];

        let refs = reduce(&turns);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].first_seen_turn_index, 4);
    }

    #[test]
    fn file_that_became_unstatable_counts_as_changed() {
        let turns = vec![turn(&[("/gone.rs", at(5))]), turn(&[("/gone.rs", None)])];
        assert_eq!(reduce(&turns)[0].first_seen_turn_index, 1);
    }

    #[test]
    fn order_follows_introduction() {
        let turns = vec![
            turn(&[("/z.rs", at(1)), ("/b.rs", at(1))]),
            turn(&[("/a.rs", at(1)), ("/z.rs", at(1))]),
            turn(&[("/b.rs", at(1)), ("/b.rs", at(1))]),
        ];

        let paths: Vec<_> = reduce(&turns)
            .into_iter()
            .map(|r| (r.path, r.first_seen_turn_index))
            .collect();
        assert_eq!(
            paths,
            vec![
                (PathBuf::from("/z.rs"), 0),
                (PathBuf::from("/b.rs"), 0),
                (PathBuf::from("/a.rs"), 1),
            ]
        );
    }

    #[test]
    fn no_files_no_references() {
        assert!(reduce(&[]).is_empty());
        assert!(reduce(&[turn(&[])]).is_empty());
    }
}
