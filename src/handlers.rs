use crate::db::Pool;
use crate::telegram::{self, LinkCommand, LinkOutcome};
use anyhow::Result;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

const USAGE: &str = "Send /link <code> with the code shown in the portal to receive notifications here.";

/// Reply text for a parsed command sent from `chat_id`.
pub async fn reply_for(
    pool: &Pool,
    chat_id: i64,
    username: Option<&str>,
    command: LinkCommand,
) -> Result<String> {
    let code = match command {
        LinkCommand::Start(None) | LinkCommand::Link(None) => return Ok(USAGE.to_string()),
        LinkCommand::Start(Some(code)) | LinkCommand::Link(Some(code)) => code,
        LinkCommand::Unlink => {
            let removed = telegram::unlink_chat(pool, chat_id).await?;
            return Ok(if removed > 0 {
                "This chat will no longer receive notifications.".to_string()
            } else {
                "This chat was not linked.".to_string()
            });
        }
        LinkCommand::Status => {
            let users = crate::db::users_for_chat(pool, chat_id).await?;
            return Ok(if users.is_empty() {
                format!("Not linked. {}", USAGE)
            } else {
                format!("Linked to {} portal account(s).", users.len())
            });
        }
    };

    let text = match telegram::redeem_link_code(pool, &code, chat_id, username).await? {
        LinkOutcome::Linked { .. } => "Linked! Sync notifications will be sent to this chat.",
        LinkOutcome::Expired => "This code has expired. Generate a new one in the portal.",
        LinkOutcome::AlreadyUsed => "This code was already used.",
        LinkOutcome::Unknown => "Unknown code. Check it and try again.",
    };
    Ok(text.to_string())
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, pool: &Pool, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(command) = telegram::parse_command(text) else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let username = msg.from().and_then(|u| u.username.as_deref());
    info!(chat_id, ?command, "bot command");

    let reply = reply_for(pool, chat_id, username, command).await?;
    if let Err(err) = bot.send_message(msg.chat.id, reply).await {
        warn!(?err, chat_id, "failed to reply");
    }
    Ok(())
}
