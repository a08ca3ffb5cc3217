use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::{error, info};

use crate::bot::handlers::command::purchasable_profiles;
use crate::bot::keyboards::quantity_keyboard;
use crate::services::link_resolver;
use crate::state::AppState;

pub async fn callback_handler(
    bot: Bot,
    q: CallbackQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let callback_id = q.id.clone();
    let chat_id = ChatId(q.from.id.0 as i64);
    let Some(data) = q.data else {
        let _ = bot.answer_callback_query(callback_id).await;
        return Ok(());
    };

    let is_admin = chat_id.0 == state.admin_chat_id;
    let allowed = is_admin || state.allowlist.is_allowed(chat_id.0).await.unwrap_or(false);
    if !allowed {
        let _ = bot
            .answer_callback_query(callback_id)
            .text("Access is not enabled")
            .show_alert(true)
            .await;
        return Ok(());
    }

    if let Some(raw_id) = data.strip_prefix("profile:") {
        let Ok(profile_id) = raw_id.parse::<i64>() else {
            let _ = bot.answer_callback_query(callback_id).text("Invalid profile").show_alert(true).await;
            return Ok(());
        };
        if !can_buy(&state, chat_id.0, profile_id, is_admin).await {
            let _ = bot
                .answer_callback_query(callback_id)
                .text("This profile is not available")
                .show_alert(true)
                .await;
            return Ok(());
        }
        let profile = match state.profiles.get_by_id(profile_id).await {
            Ok(Some(p)) if p.active => p,
            _ => {
                let _ = bot
                    .answer_callback_query(callback_id)
                    .text("This profile is not available")
                    .show_alert(true)
                    .await;
                return Ok(());
            }
        };

        let _ = bot.answer_callback_query(callback_id).await;
        let _ = bot
            .send_message(
                chat_id,
                format!("Profile `{}` selected. How many configs?", profile.name),
            )
            .reply_markup(quantity_keyboard(profile.id))
            .await;
        return Ok(());
    }

    if let Some(rest) = data.strip_prefix("qty:") {
        let parsed = rest
            .split_once(':')
            .and_then(|(id, qty)| Some((id.parse::<i64>().ok()?, qty.parse::<i64>().ok()?)));
        let Some((profile_id, quantity)) = parsed else {
            let _ = bot.answer_callback_query(callback_id).text("Invalid request").show_alert(true).await;
            return Ok(());
        };
        if !can_buy(&state, chat_id.0, profile_id, is_admin).await {
            let _ = bot
                .answer_callback_query(callback_id)
                .text("This profile is not available")
                .show_alert(true)
                .await;
            return Ok(());
        }

        let _ = bot.answer_callback_query(callback_id).text("Building...").await;
        let _ = bot
            .send_message(chat_id, format!("Creating {} configs, hold on...", quantity))
            .await;

        match state.allocator.allocate_and_create(profile_id, quantity, chat_id.0).await {
            Ok(result) => {
                info!(
                    "Delivered {} configs of `{}` to chat {}",
                    result.quantity, result.profile_name, chat_id.0
                );
                let _ = bot
                    .send_message(
                        chat_id,
                        format!(
                            "Created {} configs from profile `{}`.",
                            result.quantity, result.profile_name
                        ),
                    )
                    .await;
                let chunks = link_resolver::chunk_links(&result.links, 20);
                let total = chunks.len();
                for (idx, chunk) in chunks.iter().enumerate() {
                    let _ = bot
                        .send_message(chat_id, format!("Part {}/{}:\n{}", idx + 1, total, chunk))
                        .await;
                }
            }
            Err(e) => {
                error!("Allocation for chat {} failed: {}", chat_id.0, e);
                let _ = bot
                    .send_message(chat_id, format!("Could not create the configs: {}", e))
                    .await;
            }
        }
        return Ok(());
    }

    let _ = bot.answer_callback_query(callback_id).await;
    Ok(())
}

async fn can_buy(state: &AppState, chat_id: i64, profile_id: i64, is_admin: bool) -> bool {
    match purchasable_profiles(state, chat_id, is_admin).await {
        Ok(profiles) => profiles.iter().any(|p| p.id == profile_id),
        Err(e) => {
            error!("Profile access check failed for {}: {}", chat_id, e);
            false
        }
    }
}
