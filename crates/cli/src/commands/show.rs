//! `threadgate show` — Print one stored thread.

use threadgate_config::AppConfig;
use threadgate_core::thread::{ContinuationId, Thread};
use threadgate_engine::{ReconstructionRequest, render_history};

use super::open_engine;

pub async fn run(id: &str, json: bool, history: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let engine = open_engine(&config).await?;
    let id = ContinuationId::from(id);

    if history {
        let bundle = engine
            .reconstruct(&ReconstructionRequest {
                continuation_id: id,
                token_ceiling: None,
                include_parents: true,
            })
            .await?;
        print!("{}", render_history(&bundle));
        return Ok(());
    }

    let thread = engine.store().read(&id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&thread)?);
    } else {
        print!("{}", summarize(&thread));
    }
    Ok(())
}

fn summarize(thread: &Thread) -> String {
    let mut out = format!(
        "Thread {}\n  Tool:           {}\n  TTL class:      {:?}\n  Created:        {}\n  Last activity:  {}\n  Turns:          {}\n",
        thread.continuation_id,
        thread.tool_name,
        thread.ttl_class,
        thread.created_at.to_rfc3339(),
        thread.last_activity_at.to_rfc3339(),
        thread.turn_count(),
    );
    if let Some(parent) = &thread.parent_id {
        out.push_str(&format!("  Parent:         {parent}\n"));
    }

    for (i, turn) in thread.turns.iter().enumerate() {
        let preview: String = turn.text.chars().take(72).collect();
        let ellipsis = if turn.text.chars().count() > 72 { "…" } else { "" };
        out.push_str(&format!(
            "\n  [{}] {} via {} ({} file(s))\n      {preview}{ellipsis}\n",
            i + 1,
            turn.role,
            turn.tool_name,
            turn.files.len()
        ));
    }
    out
}
