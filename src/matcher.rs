use anyhow::Result;
use sqlx::AnyPool;

use crate::db::{self, AutomationRecord, DbKind};

pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Picks the first automation whose trigger occurs in `text`.
///
/// `automations` must already be ordered by priority descending, then
/// creation time ascending, which is how [`db::list_active_automations`]
/// returns them. Blank triggers never match.
pub fn select_automation<'a>(automations: &'a [AutomationRecord], text: &str) -> Option<&'a AutomationRecord> {
    let haystack = normalize_text(text);
    automations.iter().find(|automation| {
        let trigger = normalize_text(&automation.trigger);
        !trigger.is_empty() && haystack.contains(&trigger)
    })
}

pub async fn match_automation(pool: &AnyPool, kind: DbKind, bot_id: &str, text: &str) -> Result<Option<AutomationRecord>> {
    let automations = db::list_active_automations(pool, kind, bot_id).await?;
    let matched = select_automation(&automations, text).cloned();
    if let Some(automation) = matched.as_ref() {
        tracing::debug!(bot_id, automation_id = %automation.id, priority = automation.priority, "automation matched");
    }
    Ok(matched)
}
