//! Plain-text rendering of a resume bundle, for tools to prepend to their
//! prompt.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use crate::continuation::ResumeBundle;

/// Render `bundle` as a conversation-history block.
///
/// Each file is listed under the turn that introduced it. Omitted files
/// and dropped turns are called out by name so the model (and the user)
/// can tell what is missing.
pub fn render_history(bundle: &ResumeBundle) -> String {
    let mut out = String::new();
    let shown = bundle.ordered_turns.len();

    let _ = writeln!(
        out,
        "=== CONVERSATION HISTORY (continuation {}) ===",
        bundle.continuation_id
    );
    let _ = writeln!(out, "Thread started by: {}", bundle.origin_tool);
    if bundle.omitted_turns > 0 {
        let _ = writeln!(
            out,
            "Turns: {shown} of {} shown ({} omitted — budget exceeded)",
            bundle.total_turns, bundle.omitted_turns
        );
    } else {
        let _ = writeln!(out, "Turns: {shown}");
    }

    if bundle.over_ceiling {
        let _ = writeln!(
            out,
            "Token ceiling exceeded: ~{} tokens used of {}",
            bundle.tokens_used, bundle.token_ceiling
        );
    }

    if !bundle.included_files.is_empty() {
        out.push_str("\nFiles already in context:\n");
        for file in &bundle.included_files {
            let _ = writeln!(out, "  - {}", file.path.display());
        }
    }

    if !bundle.omitted_files.is_empty() {
        let _ = writeln!(
            out,
            "\n{} file(s) omitted — budget exceeded:",
            bundle.omitted_files.len()
        );
        for file in &bundle.omitted_files {
            let _ = writeln!(out, "  - {} (~{} tokens)", file.path.display(), file.tokens);
        }
    }

    if !bundle.warnings.is_empty() {
        out.push_str("\nUnreadable files:\n");
        for warning in &bundle.warnings {
            let _ = writeln!(out, "  - {} ({})", warning.path.display(), warning.reason);
        }
    }

    let mut introduced: BTreeMap<usize, Vec<&PathBuf>> = BTreeMap::new();
    for file in &bundle.included_files {
        introduced
            .entry(file.first_seen_turn_index)
            .or_default()
            .push(&file.path);
    }

    for bundled in &bundle.ordered_turns {
        let turn = &bundled.turn;
        let _ = writeln!(
            out,
            "\n--- Turn {} ({}, via {}) ---",
            bundled.index + 1,
            turn.role,
            turn.tool_name
        );
        if let Some(paths) = introduced.get(&bundled.index) {
            let list: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            let _ = writeln!(out, "Files: {}", list.join(", "));
        }
        let _ = writeln!(out, "{}", turn.text);
    }

    out.push_str("\n=== END CONVERSATION HISTORY ===\n");
    out
}
