use atw_core::ports::{NotificationPort, TerminalPort};
use atw_core::thread_contracts::Comment;
use atw_storage::{StorageError, WorkbenchStore};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One delivery target: a live thread and the comments headed for its
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDestination {
    pub thread_id: String,
    pub thread_name: String,
    pub terminal_id: String,
    pub comments: Vec<Comment>,
}

/// Pure resolution result: who gets what, and which files could not be
/// resolved to any live thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    pub destinations: Vec<RoutingDestination>,
    pub unroutable_files: Vec<String>,
}

impl RoutingPlan {
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty() && self.unroutable_files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub submitted_ids: Vec<String>,
    pub delivered_threads: Vec<String>,
    pub skipped_files: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommentRouter;

impl CommentRouter {
    /// Resolves every unsubmitted comment to a live thread without touching
    /// any terminal. Ownership map first, focused thread as fallback; an
    /// owner entry pointing at a deleted thread counts as no owner.
    pub fn plan(
        &self,
        store: &WorkbenchStore,
        focused_thread: Option<&str>,
    ) -> Result<RoutingPlan, RoutingError> {
        let comments = store.active_comments()?;

        let mut by_file: BTreeMap<String, Vec<Comment>> = BTreeMap::new();
        for comment in comments {
            by_file.entry(comment.file.clone()).or_default().push(comment);
        }

        let focused = match focused_thread {
            Some(thread_id) => store.thread_by_id(thread_id)?,
            None => None,
        };

        let mut destinations: BTreeMap<String, RoutingDestination> = BTreeMap::new();
        let mut unroutable_files = Vec::new();
        for (file, comments) in by_file {
            let owner = match store.owner_for_file(&file)? {
                Some(thread_id) => store.thread_by_id(&thread_id)?,
                None => None,
            };
            let target = match owner.as_ref().or(focused.as_ref()) {
                Some(thread) => thread,
                None => {
                    debug!(event = "comment_unroutable", file = %file);
                    unroutable_files.push(file);
                    continue;
                }
            };

            destinations
                .entry(target.thread_id.clone())
                .or_insert_with(|| RoutingDestination {
                    thread_id: target.thread_id.clone(),
                    thread_name: target.name.clone(),
                    terminal_id: target.terminal_id.clone(),
                    comments: Vec::new(),
                })
                .comments
                .extend(comments);
        }

        Ok(RoutingPlan {
            destinations: destinations.into_values().collect(),
            unroutable_files,
        })
    }

    /// Delivers every routable comment and marks it submitted. Delivery is
    /// best-effort per destination: a failed send leaves that destination's
    /// comments unsubmitted for the next attempt. Returns `None` when there
    /// was nothing to deliver.
    pub fn execute_with_routing(
        &self,
        store: &WorkbenchStore,
        terminal: &mut dyn TerminalPort,
        notifier: &mut dyn NotificationPort,
        focused_thread: Option<&str>,
    ) -> Result<Option<RoutingOutcome>, RoutingError> {
        let plan = self.plan(store, focused_thread)?;
        if plan.is_empty() {
            return Ok(None);
        }

        if plan.destinations.is_empty() {
            notifier.show_warning(&format!(
                "No thread owns {} and no thread is focused; comments were not delivered",
                join_files(&plan.unroutable_files)
            ));
            return Ok(None);
        }

        let mut submitted_ids = Vec::new();
        let mut delivered_threads = Vec::new();
        for destination in &plan.destinations {
            let message = format_batch(&destination.comments);
            match terminal.send_text(&destination.terminal_id, &message) {
                Ok(()) => {
                    let ids: Vec<String> = destination
                        .comments
                        .iter()
                        .map(|comment| comment.comment_id.clone())
                        .collect();
                    store.mark_comments_submitted(&ids)?;
                    submitted_ids.extend(ids);
                    delivered_threads.push(destination.thread_name.clone());
                }
                Err(err) => warn!(
                    event = "comment_delivery_failed",
                    thread_id = %destination.thread_id,
                    terminal_id = %destination.terminal_id,
                    error = %err
                ),
            }
        }

        if !plan.unroutable_files.is_empty() {
            notifier.show_warning(&format!(
                "No owner for {}; those comments were kept",
                join_files(&plan.unroutable_files)
            ));
        }
        if !delivered_threads.is_empty() {
            notifier.show_info(&format!(
                "Sent {} comment(s) to {}",
                submitted_ids.len(),
                delivered_threads.join(", ")
            ));
        }

        Ok(Some(RoutingOutcome {
            submitted_ids,
            delivered_threads,
            skipped_files: plan.unroutable_files,
        }))
    }
}

/// All comments for one destination become a single terminal message so the
/// agent sees them as one instruction.
fn format_batch(comments: &[Comment]) -> String {
    let mut message = format!("Review comments ({}):\n", comments.len());
    for comment in comments {
        message.push_str(&format!("- {}: {}\n", comment.location_label(), comment.text));
    }
    message
}

fn join_files(files: &[String]) -> String {
    files.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use atw_core::ports::PortError;
    use atw_core::thread_contracts::ThreadState;
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::Path;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 14, min, 0)
            .single()
            .expect("valid timestamp")
    }

    fn thread(n: u32) -> ThreadState {
        ThreadState::new(
            format!("thread-{n}"),
            format!("feature-{n}"),
            format!("term-{n}"),
            "/work/repo",
            None,
            ts(0),
        )
        .expect("valid thread")
    }

    fn comment(id: &str, file: &str, min: u32) -> Comment {
        Comment {
            comment_id: id.to_string(),
            file: file.to_string(),
            line: 10,
            end_line: None,
            text: format!("note {id}"),
            thread_id: None,
            is_submitted: false,
            created_at: ts(min),
        }
    }

    #[derive(Default)]
    struct RecordingTerminal {
        sent: Vec<(String, String)>,
        fail_for: Option<String>,
    }

    impl TerminalPort for RecordingTerminal {
        fn create_terminal(&mut self, _name: &str, _cwd: &Path) -> Result<String, PortError> {
            Err(PortError::new("not used in routing tests"))
        }

        fn send_text(&mut self, terminal_id: &str, text: &str) -> Result<(), PortError> {
            if self.fail_for.as_deref() == Some(terminal_id) {
                return Err(PortError::new("terminal closed"));
            }
            self.sent.push((terminal_id.to_string(), text.to_string()));
            Ok(())
        }

        fn close_terminal(&mut self, _terminal_id: &str) -> Result<(), PortError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        infos: Vec<String>,
        warnings: Vec<String>,
    }

    impl NotificationPort for RecordingNotifier {
        fn show_info(&mut self, message: &str) {
            self.infos.push(message.to_string());
        }

        fn show_warning(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }
    }

    #[test]
    fn owned_file_routes_to_its_owner_and_marks_submitted() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route")
            .expect("something delivered");

        assert_eq!(outcome.submitted_ids, vec!["c-1".to_string()]);
        assert_eq!(outcome.delivered_threads, vec!["feature-1".to_string()]);
        assert_eq!(terminal.sent.len(), 1);
        assert_eq!(terminal.sent[0].0, "term-1");
        assert!(terminal.sent[0].1.contains("src/a.rs:10: note c-1"));
        assert!(store.active_comments().expect("list").is_empty());
        assert_eq!(notifier.infos.len(), 1);
        assert!(notifier.warnings.is_empty());
    }

    #[test]
    fn files_with_distinct_owners_get_one_message_each() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store.save_thread(&thread(2)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store
            .upsert_file_owner("src/b.rs", "thread-2", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/b.rs", 2)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route")
            .expect("something delivered");

        assert_eq!(terminal.sent.len(), 2);
        let to_one = terminal.sent.iter().find(|(id, _)| id == "term-1").expect("term-1 message");
        let to_two = terminal.sent.iter().find(|(id, _)| id == "term-2").expect("term-2 message");
        assert!(to_one.1.contains("note c-1") && !to_one.1.contains("note c-2"));
        assert!(to_two.1.contains("note c-2") && !to_two.1.contains("note c-1"));
        assert_eq!(outcome.submitted_ids.len(), 2);
        assert!(store.active_comments().expect("list").is_empty());
    }

    #[test]
    fn unowned_file_falls_back_to_the_focused_thread() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store.insert_comment(&comment("c-1", "src/new.rs", 1)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, Some("thread-1"))
            .expect("route")
            .expect("something delivered");

        assert_eq!(outcome.delivered_threads, vec!["feature-1".to_string()]);
        assert_eq!(terminal.sent[0].0, "term-1");
    }

    #[test]
    fn no_owner_and_no_focus_keeps_comments_and_warns_once() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/b.rs", 2)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route");

        assert!(outcome.is_none());
        assert!(terminal.sent.is_empty());
        assert_eq!(notifier.warnings.len(), 1);
        assert!(notifier.warnings[0].contains("src/a.rs, src/b.rs"));
        assert_eq!(store.active_comments().expect("list").len(), 2);
    }

    #[test]
    fn comments_for_one_destination_arrive_as_a_single_batch() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store
            .upsert_file_owner("src/b.rs", "thread-1", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/a.rs", 2)).expect("insert");
        store.insert_comment(&comment("c-3", "src/b.rs", 3)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route")
            .expect("something delivered");

        assert_eq!(terminal.sent.len(), 1);
        let (terminal_id, message) = &terminal.sent[0];
        assert_eq!(terminal_id, "term-1");
        assert!(message.starts_with("Review comments (3):"));
        assert!(message.contains("note c-1"));
        assert!(message.contains("note c-2"));
        assert!(message.contains("note c-3"));
        assert_eq!(outcome.submitted_ids.len(), 3);
    }

    #[test]
    fn mixed_batch_delivers_routable_comments_and_warns_about_the_rest() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/orphan.rs", 2)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route")
            .expect("something delivered");

        assert_eq!(outcome.submitted_ids, vec!["c-1".to_string()]);
        assert_eq!(outcome.skipped_files, vec!["src/orphan.rs".to_string()]);
        assert_eq!(notifier.warnings.len(), 1);
        assert!(notifier.warnings[0].contains("src/orphan.rs"));
        let active = store.active_comments().expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].comment_id, "c-2");
    }

    #[test]
    fn owner_entry_for_a_deleted_thread_counts_as_unowned() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(2)).expect("save");
        // src/a.rs is owned by a thread that no longer exists.
        store
            .upsert_file_owner("src/a.rs", "thread-gone", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");

        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, Some("thread-2"))
            .expect("route")
            .expect("something delivered");

        assert_eq!(outcome.delivered_threads, vec!["feature-2".to_string()]);
        assert_eq!(terminal.sent[0].0, "term-2");
    }

    #[test]
    fn failed_send_leaves_that_destinations_comments_unsubmitted() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store.save_thread(&thread(2)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store
            .upsert_file_owner("src/b.rs", "thread-2", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/b.rs", 2)).expect("insert");

        let mut terminal = RecordingTerminal {
            fail_for: Some("term-1".to_string()),
            ..RecordingTerminal::default()
        };
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route")
            .expect("something delivered");

        assert_eq!(outcome.submitted_ids, vec!["c-2".to_string()]);
        assert_eq!(outcome.delivered_threads, vec!["feature-2".to_string()]);
        let active = store.active_comments().expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].comment_id, "c-1");
    }

    #[test]
    fn plan_resolves_without_side_effects() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        store.save_thread(&thread(1)).expect("save");
        store
            .upsert_file_owner("src/a.rs", "thread-1", ts(0))
            .expect("own");
        store.insert_comment(&comment("c-1", "src/a.rs", 1)).expect("insert");
        store.insert_comment(&comment("c-2", "src/orphan.rs", 2)).expect("insert");

        let plan = CommentRouter.plan(&store, None).expect("plan");
        assert_eq!(plan.destinations.len(), 1);
        assert_eq!(plan.destinations[0].thread_id, "thread-1");
        assert_eq!(plan.unroutable_files, vec!["src/orphan.rs".to_string()]);
        assert_eq!(store.active_comments().expect("list").len(), 2);
    }

    #[test]
    fn nothing_pending_means_nothing_happens() {
        let store = WorkbenchStore::open_in_memory().expect("open store");
        let mut terminal = RecordingTerminal::default();
        let mut notifier = RecordingNotifier::default();
        let outcome = CommentRouter
            .execute_with_routing(&store, &mut terminal, &mut notifier, None)
            .expect("route");

        assert!(outcome.is_none());
        assert!(terminal.sent.is_empty());
        assert!(notifier.infos.is_empty());
        assert!(notifier.warnings.is_empty());
    }
}
