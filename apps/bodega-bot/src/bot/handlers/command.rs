use anyhow::Result as AnyhowResult;
use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing::error;

use bodega_db::models::profile::Profile;
use bodega_db::repositories::issued_repo::IssuedConfigRepository;

use crate::bot::keyboards::profiles_keyboard;
use crate::state::AppState;

const USER_HELP: &str = "Commands:\n\
/start - show the profiles you can buy\n\
/help - this message";

const ADMIN_HELP: &str = "Admin commands:\n\
/addpanel name|url|username|password\n\
/panels - list panels\n\
/testpanel name - connectivity check\n\
/togglepanel name\n\
/newprofile name|panel|prefix|suffix|gb|days|port:max,port:max (suffix `_` means empty)\n\
/profiles - list profiles\n\
/toggleprofile name\n\
/addport profile|port:max\n\
/setcap profile|port:max\n\
/capacity name - capacity report\n\
/issued name - recently issued configs\n\
/adduser chat_id [note]\n\
/removeuser chat_id\n\
/users - list allowed users\n\
/access chat_id|profileA,profileB - restrict purchasable profiles (`all` clears)";

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let chat_id = msg.chat.id;
    let Some(text) = msg.text() else { return Ok(()) };
    let text = text.trim();
    if !text.starts_with('/') {
        return Ok(());
    }

    let (command, args) = match text.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (text, ""),
    };
    let command = command.split('@').next().unwrap_or(command);
    let is_admin = chat_id.0 == state.admin_chat_id;

    let outcome: AnyhowResult<()> = match command {
        "/start" => start(&bot, chat_id, &state, is_admin).await,
        "/help" => {
            let help = if is_admin {
                format!("{}\n\n{}", USER_HELP, ADMIN_HELP)
            } else {
                USER_HELP.to_string()
            };
            bot.send_message(chat_id, help).await.map(|_| ()).map_err(Into::into)
        }
        _ if !is_admin => Ok(()),
        "/addpanel" => add_panel(&bot, chat_id, &state, args).await,
        "/panels" => list_panels(&bot, chat_id, &state).await,
        "/testpanel" => test_panel(&bot, chat_id, &state, args).await,
        "/togglepanel" => toggle_panel(&bot, chat_id, &state, args).await,
        "/newprofile" => new_profile(&bot, chat_id, &state, args).await,
        "/profiles" => list_profiles(&bot, chat_id, &state).await,
        "/toggleprofile" => toggle_profile(&bot, chat_id, &state, args).await,
        "/addport" => add_port(&bot, chat_id, &state, args).await,
        "/setcap" => set_capacity(&bot, chat_id, &state, args).await,
        "/capacity" => capacity_report(&bot, chat_id, &state, args).await,
        "/issued" => list_issued(&bot, chat_id, &state, args).await,
        "/adduser" => add_user(&bot, chat_id, &state, args).await,
        "/removeuser" => remove_user(&bot, chat_id, &state, args).await,
        "/users" => list_users(&bot, chat_id, &state).await,
        "/access" => set_access(&bot, chat_id, &state, args).await,
        _ => Ok(()),
    };

    if let Err(e) = outcome {
        error!("Command {} from {} failed: {}", command, chat_id, e);
        let _ = bot.send_message(chat_id, format!("Failed: {}", e)).await;
    }
    Ok(())
}

/// Profiles the chat may buy: the full active list, narrowed by per-user
/// access rows when any exist. Admin sees everything.
pub async fn purchasable_profiles(
    state: &AppState,
    chat_id: i64,
    is_admin: bool,
) -> AnyhowResult<Vec<Profile>> {
    let profiles = state.profiles.list(true).await?;
    if is_admin {
        return Ok(profiles);
    }
    let allowed_ids = state.allowlist.allowed_profile_ids(chat_id).await?;
    if allowed_ids.is_empty() {
        return Ok(profiles);
    }
    Ok(profiles.into_iter().filter(|p| allowed_ids.contains(&p.id)).collect())
}

async fn start(bot: &Bot, chat_id: ChatId, state: &AppState, is_admin: bool) -> AnyhowResult<()> {
    if !is_admin && !state.allowlist.is_allowed(chat_id.0).await? {
        bot.send_message(
            chat_id,
            format!(
                "Access is not enabled for this chat. Send your chat id to the admin:\n{}",
                chat_id.0
            ),
        )
        .await?;
        return Ok(());
    }

    let profiles = purchasable_profiles(state, chat_id.0, is_admin).await?;
    if profiles.is_empty() {
        let text = if is_admin {
            "Nothing is on sale yet. Create an inbound on the panel first, then use /newprofile."
        } else {
            "Nothing is on sale yet."
        };
        bot.send_message(chat_id, text).await?;
        return Ok(());
    }

    let menu: Vec<(i64, String)> = profiles.iter().map(|p| (p.id, p.name.clone())).collect();
    bot.send_message(chat_id, "Which profile do you want?")
        .reply_markup(profiles_keyboard(&menu))
        .await?;
    Ok(())
}

async fn add_panel(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let parts: Vec<&str> = args.split('|').map(str::trim).collect();
    let [name, base_url, username, password] = parts.as_slice() else {
        bot.send_message(chat_id, "Format: /addpanel name|url|username|password").await?;
        return Ok(());
    };
    if name.is_empty() || base_url.is_empty() || username.is_empty() || password.is_empty() {
        bot.send_message(chat_id, "All four fields are required.").await?;
        return Ok(());
    }

    let password_enc = state.crypto.encrypt(password)?;
    state.panels.upsert(name, base_url, username, &password_enc).await?;
    bot.send_message(chat_id, format!("Panel `{}` registered.", name)).await?;
    Ok(())
}

async fn list_panels(bot: &Bot, chat_id: ChatId, state: &AppState) -> AnyhowResult<()> {
    let panels = state.panels.list(false).await?;
    if panels.is_empty() {
        bot.send_message(chat_id, "No panels registered.").await?;
        return Ok(());
    }
    let lines: Vec<String> = panels
        .iter()
        .map(|p| {
            format!(
                "{} - {} ({})",
                p.name,
                p.base_url,
                if p.active { "active" } else { "disabled" }
            )
        })
        .collect();
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn test_panel(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let name = args.trim();
    let Some(panel) = state.panels.get_by_name(name).await? else {
        bot.send_message(chat_id, "Panel not found.").await?;
        return Ok(());
    };
    let inbound_count = state.allocator.test_panel(&panel).await?;
    bot.send_message(
        chat_id,
        format!("Panel `{}` is reachable, {} inbounds visible.", panel.name, inbound_count),
    )
    .await?;
    Ok(())
}

async fn toggle_panel(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some(panel) = state.panels.get_by_name(args.trim()).await? else {
        bot.send_message(chat_id, "Panel not found.").await?;
        return Ok(());
    };
    state.panels.set_active(panel.id, !panel.active).await?;
    bot.send_message(
        chat_id,
        format!(
            "Panel `{}` is now {}.",
            panel.name,
            if panel.active { "disabled" } else { "active" }
        ),
    )
    .await?;
    Ok(())
}

async fn new_profile(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let parts: Vec<&str> = args.split('|').map(str::trim).collect();
    let (name, panel_name, prefix, suffix, gb_raw, days_raw, ports_raw) = match parts.as_slice() {
        [name, panel, prefix, suffix, gb, days, ports] => {
            (*name, *panel, *prefix, *suffix, *gb, *days, *ports)
        }
        [name, panel, prefix, gb, days, ports] => (*name, *panel, *prefix, "", *gb, *days, *ports),
        _ => {
            bot.send_message(
                chat_id,
                "Format: /newprofile name|panel|prefix|suffix|gb|days|port:max,port:max\n\
                 (suffix may be omitted; `_` also means empty)",
            )
            .await?;
            return Ok(());
        }
    };

    if name.is_empty() || panel_name.is_empty() || prefix.is_empty() {
        bot.send_message(chat_id, "name, panel and prefix are required.").await?;
        return Ok(());
    }
    let suffix = if suffix == "_" { "" } else { suffix };

    let (Ok(traffic_gb), Ok(expiry_days)) = (gb_raw.parse::<i64>(), days_raw.parse::<i64>()) else {
        bot.send_message(chat_id, "gb and days must be integers.").await?;
        return Ok(());
    };
    if traffic_gb < 0 || expiry_days < 0 {
        bot.send_message(chat_id, "gb and days must not be negative.").await?;
        return Ok(());
    }

    let Some(requested_ports) = parse_port_entries(ports_raw) else {
        bot.send_message(
            chat_id,
            "Ports must be unique `port:max` pairs with max > 0, e.g. 1044:1000,1025:500",
        )
        .await?;
        return Ok(());
    };

    let Some(panel) = state.panels.get_by_name(panel_name).await? else {
        bot.send_message(chat_id, "Panel not found.").await?;
        return Ok(());
    };

    // Every requested port must resolve to exactly one live inbound before
    // anything is written.
    let bindings = state.allocator.resolve_port_bindings(&panel, &requested_ports).await?;

    let profile_id = state
        .profiles
        .create(panel.id, name, prefix, suffix, traffic_gb, expiry_days, &bindings)
        .await?;
    bot.send_message(chat_id, format!("Profile `{}` created with id {}.", name, profile_id))
        .await?;
    Ok(())
}

fn parse_port_entries(raw: &str) -> Option<Vec<(i64, i64)>> {
    let mut seen = std::collections::HashSet::new();
    let mut requested = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (port_raw, max_raw) = entry.split_once(':')?;
        let port: i64 = port_raw.trim().parse().ok()?;
        let max: i64 = max_raw.trim().parse().ok()?;
        if max <= 0 || !seen.insert(port) {
            return None;
        }
        requested.push((port, max));
    }
    if requested.is_empty() { None } else { Some(requested) }
}

async fn list_profiles(bot: &Bot, chat_id: ChatId, state: &AppState) -> AnyhowResult<()> {
    let profiles = state.profiles.list(false).await?;
    if profiles.is_empty() {
        bot.send_message(chat_id, "No profiles yet.").await?;
        return Ok(());
    }
    let mut lines = Vec::with_capacity(profiles.len());
    for profile in &profiles {
        let ports = state.profiles.list_ports(profile.id).await?;
        let ports_text: Vec<String> = ports
            .iter()
            .map(|p| format!("{}:{}", p.port, p.max_active_clients))
            .collect();
        lines.push(format!(
            "{} - prefix `{}` {}GB/{}d [{}] ports {}",
            profile.name,
            profile.prefix,
            profile.traffic_gb,
            profile.expiry_days,
            if profile.active { "active" } else { "disabled" },
            ports_text.join(","),
        ));
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn toggle_profile(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some(profile) = state.profiles.get_by_name(args.trim()).await? else {
        bot.send_message(chat_id, "Profile not found.").await?;
        return Ok(());
    };
    state.profiles.set_active(profile.id, !profile.active).await?;
    bot.send_message(
        chat_id,
        format!(
            "Profile `{}` is now {}.",
            profile.name,
            if profile.active { "disabled" } else { "active" }
        ),
    )
    .await?;
    Ok(())
}

fn parse_profile_and_port(args: &str) -> Option<(String, i64, i64)> {
    let (profile, entry) = args.split_once('|')?;
    let (port_raw, max_raw) = entry.split_once(':')?;
    let port = port_raw.trim().parse().ok()?;
    let max = max_raw.trim().parse().ok().filter(|m| *m > 0)?;
    Some((profile.trim().to_string(), port, max))
}

async fn add_port(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some((profile_name, port, max)) = parse_profile_and_port(args) else {
        bot.send_message(chat_id, "Format: /addport profile|port:max").await?;
        return Ok(());
    };
    let Some(profile) = state.profiles.get_by_name(&profile_name).await? else {
        bot.send_message(chat_id, "Profile not found.").await?;
        return Ok(());
    };
    let Some(panel) = state.panels.get_by_id(profile.panel_id).await? else {
        bot.send_message(chat_id, "Panel not found for profile.").await?;
        return Ok(());
    };

    let bindings = state.allocator.resolve_port_bindings(&panel, &[(port, max)]).await?;
    let (inbound_id, port, max) = bindings[0];
    state.profiles.add_port(profile.id, inbound_id, port, max).await?;
    bot.send_message(
        chat_id,
        format!("Port {} (max {}) added to profile `{}`.", port, max, profile.name),
    )
    .await?;
    Ok(())
}

async fn set_capacity(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some((profile_name, port, max)) = parse_profile_and_port(args) else {
        bot.send_message(chat_id, "Format: /setcap profile|port:max").await?;
        return Ok(());
    };
    let Some(profile) = state.profiles.get_by_name(&profile_name).await? else {
        bot.send_message(chat_id, "Profile not found.").await?;
        return Ok(());
    };
    if state.profiles.update_port_capacity(profile.id, port, max).await? {
        bot.send_message(chat_id, format!("Port {} capacity set to {}.", port, max)).await?;
    } else {
        bot.send_message(chat_id, "That profile has no binding for that port.").await?;
    }
    Ok(())
}

async fn capacity_report(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some(profile) = state.profiles.get_by_name(args.trim()).await? else {
        bot.send_message(chat_id, "Profile not found.").await?;
        return Ok(());
    };

    let report = state.allocator.get_capacity_report(profile.id).await?;
    let mut lines = vec![
        format!("Profile `{}`", report.profile_name),
        format!("Used {} / {} (free {})", report.used, report.total_capacity, report.free),
        format!("Issued records: {}", report.issued_total),
    ];
    for port in &report.ports {
        lines.push(format!(
            " - port {} (inbound {}): {}/{}, free {}",
            port.port, port.inbound_id, port.used, port.max, port.free
        ));
    }
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn list_issued(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some(profile) = state.profiles.get_by_name(args.trim()).await? else {
        bot.send_message(chat_id, "Profile not found.").await?;
        return Ok(());
    };

    let records = IssuedConfigRepository::list_recent(&state.pool, profile.id, 20).await?;
    if records.is_empty() {
        bot.send_message(chat_id, "Nothing issued for this profile yet.").await?;
        return Ok(());
    }
    let lines: Vec<String> = records
        .iter()
        .map(|r| format!("{} -> chat {} (inbound {})", r.config_name, r.chat_id, r.inbound_id))
        .collect();
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn add_user(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let (id_raw, note) = match args.split_once(char::is_whitespace) {
        Some((id, note)) => (id, note.trim()),
        None => (args, ""),
    };
    let Ok(user_chat_id) = id_raw.trim().parse::<i64>() else {
        bot.send_message(chat_id, "Format: /adduser chat_id [note]").await?;
        return Ok(());
    };
    state.allowlist.add(user_chat_id, note).await?;
    bot.send_message(chat_id, format!("User {} is now allowed.", user_chat_id)).await?;
    Ok(())
}

async fn remove_user(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Ok(user_chat_id) = args.trim().parse::<i64>() else {
        bot.send_message(chat_id, "Format: /removeuser chat_id").await?;
        return Ok(());
    };
    if state.allowlist.remove(user_chat_id).await? {
        bot.send_message(chat_id, format!("User {} removed.", user_chat_id)).await?;
    } else {
        bot.send_message(chat_id, "That chat id is not in the allowlist.").await?;
    }
    Ok(())
}

async fn list_users(bot: &Bot, chat_id: ChatId, state: &AppState) -> AnyhowResult<()> {
    let users = state.allowlist.list().await?;
    if users.is_empty() {
        bot.send_message(chat_id, "Allowlist is empty.").await?;
        return Ok(());
    }
    let lines: Vec<String> = users
        .iter()
        .map(|u| {
            if u.note.is_empty() {
                u.chat_id.to_string()
            } else {
                format!("{} - {}", u.chat_id, u.note)
            }
        })
        .collect();
    bot.send_message(chat_id, lines.join("\n")).await?;
    Ok(())
}

async fn set_access(bot: &Bot, chat_id: ChatId, state: &AppState, args: &str) -> AnyhowResult<()> {
    let Some((id_raw, profiles_raw)) = args.split_once('|') else {
        bot.send_message(chat_id, "Format: /access chat_id|profileA,profileB (or `all`)").await?;
        return Ok(());
    };
    let Ok(user_chat_id) = id_raw.trim().parse::<i64>() else {
        bot.send_message(chat_id, "chat_id must be an integer.").await?;
        return Ok(());
    };
    if state.allowlist.get(user_chat_id).await?.is_none() {
        bot.send_message(chat_id, "That chat id is not allowed yet; /adduser it first.").await?;
        return Ok(());
    }

    if profiles_raw.trim().eq_ignore_ascii_case("all") {
        state.allowlist.set_profile_access(user_chat_id, &[]).await?;
        bot.send_message(
            chat_id,
            format!("User {} can now buy every active profile.", user_chat_id),
        )
        .await?;
        return Ok(());
    }

    let requested: Vec<&str> =
        profiles_raw.split(',').map(str::trim).filter(|n| !n.is_empty()).collect();
    if requested.is_empty() {
        bot.send_message(chat_id, "Give at least one profile name, or `all`.").await?;
        return Ok(());
    }

    let mut profile_ids = Vec::with_capacity(requested.len());
    let mut missing = Vec::new();
    for name in &requested {
        match state.profiles.get_by_name(name).await? {
            Some(profile) => profile_ids.push(profile.id),
            None => missing.push(*name),
        }
    }
    if !missing.is_empty() {
        bot.send_message(chat_id, format!("Profiles not found: {}", missing.join(", "))).await?;
        return Ok(());
    }

    state.allowlist.set_profile_access(user_chat_id, &profile_ids).await?;
    bot.send_message(
        chat_id,
        format!("User {} restricted to: {}", user_chat_id, requested.join(", ")),
    )
    .await?;
    Ok(())
}
