//! Thin wrapper over `teloxide::Bot` covering the handful of Bot API
//! operations the controller needs, with the markdown-then-plain retry and
//! 4096-byte message cap applied at this boundary so every caller gets them
//! for free.

use teloxide::payloads::{
    AnswerCallbackQuerySetters, EditForumTopicSetters, EditMessageTextSetters, GetUpdatesSetters,
    SendChatActionSetters, SendMessageSetters,
};
use teloxide::requests::Requester;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ThreadId,
    UpdateKind,
};
use teloxide::Bot;

const TELEGRAM_MESSAGE_CAP: usize = 4096;
const TRUNCATION_MARKER: &str = "\n\n… (truncated)";

fn chat_is_forum(chat: &teloxide::types::Chat) -> bool {
    match &chat.kind {
        teloxide::types::ChatKind::Public(public) => {
            matches!(
                &public.kind,
                teloxide::types::PublicChatKind::Supergroup(supergroup) if supergroup.is_forum
            )
        }
        teloxide::types::ChatKind::Private(_) => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelegramClientError {
    #[error("telegram API error: {0}")]
    Api(#[from] teloxide::RequestError),
}

/// A single button: label plus the already-encoded `callback_data`.
#[derive(Debug, Clone)]
pub struct KeyboardButton {
    pub text: String,
    pub callback_data: String,
}

pub type Keyboard = Vec<Vec<KeyboardButton>>;

fn build_markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.text.clone(), b.callback_data.clone()))
            .collect::<Vec<_>>()
    }))
}

/// Truncates `text` to fit Telegram's message cap, appending a marker when
/// truncation actually occurred.
pub fn truncate_for_telegram(text: &str) -> String {
    if text.len() <= TELEGRAM_MESSAGE_CAP {
        return text.to_string();
    }
    let budget = TELEGRAM_MESSAGE_CAP - TRUNCATION_MARKER.len();
    let mut cut = budget.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}

/// An incoming message or callback query, decoded from raw Telegram updates
/// into only the fields the controller depends on (spec §6.1).
#[derive(Debug, Clone)]
pub enum ControllerUpdate {
    Message {
        chat_id: i64,
        topic_id: Option<i32>,
        is_forum: bool,
        text: String,
        from_user_id: Option<i64>,
        username: Option<String>,
    },
    CallbackQuery {
        callback_id: String,
        data: String,
        chat_id: i64,
        topic_id: Option<i32>,
        message_id: i32,
    },
}

pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self { bot: Bot::new(token) }
    }

    pub async fn get_me_username(&self) -> Result<String, TelegramClientError> {
        let me = self.bot.get_me().await?;
        Ok(me.user.username.clone().unwrap_or_default())
    }

    /// Long-polls for updates, returning decoded `ControllerUpdate`s plus the
    /// new offset (`max(update_id) + 1`), or the unchanged `offset` if the
    /// batch was empty.
    pub async fn get_updates(
        &self,
        offset: i64,
        limit: u8,
        timeout_secs: u32,
    ) -> Result<(Vec<ControllerUpdate>, i64), TelegramClientError> {
        #[allow(clippy::cast_possible_truncation)]
        let request = self
            .bot
            .get_updates()
            .offset(offset as i32)
            .limit(limit)
            .timeout(timeout_secs);
        let updates = request.await?;

        let mut decoded = Vec::new();
        let mut next_offset = offset;
        for update in updates {
            next_offset = next_offset.max(i64::from(update.id.0) + 1);
            match update.kind {
                UpdateKind::Message(msg) => {
                    if let Some(text) = msg.text() {
                        decoded.push(ControllerUpdate::Message {
                            chat_id: msg.chat.id.0,
                            topic_id: msg.thread_id.map(|t| t.0 .0),
                            is_forum: chat_is_forum(&msg.chat),
                            text: text.to_string(),
                            from_user_id: msg.from.as_ref().map(|u| u.id.0 as i64),
                            username: msg.from.as_ref().and_then(|u| u.username.clone()),
                        });
                    }
                }
                UpdateKind::CallbackQuery(query) => {
                    if let (Some(data), Some(message)) = (query.data, query.message) {
                        decoded.push(ControllerUpdate::CallbackQuery {
                            callback_id: query.id.0,
                            data,
                            chat_id: message.chat().id.0,
                            topic_id: message
                                .regular_message()
                                .and_then(|m| m.thread_id)
                                .map(|t| t.0 .0),
                            message_id: message.id().0,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok((decoded, next_offset))
    }

    async fn send(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TelegramClientError> {
        let text = truncate_for_telegram(text);
        let chat = teloxide::types::ChatId(chat_id);

        let mut request = self.bot.send_message(chat, text.clone()).parse_mode(ParseMode::MarkdownV2);
        if let Some(topic) = topic_id {
            request = request.message_thread_id(ThreadId(MessageId(topic)));
        }
        if let Some(kb) = keyboard {
            request = request.reply_markup(build_markup(kb));
        }

        match request.await {
            Ok(_) => Ok(()),
            Err(teloxide::RequestError::Api(_)) => {
                // Markdown formatting failure: retry once in plain text.
                let mut plain = self.bot.send_message(chat, text);
                if let Some(topic) = topic_id {
                    plain = plain.message_thread_id(ThreadId(MessageId(topic)));
                }
                if let Some(kb) = keyboard {
                    plain = plain.reply_markup(build_markup(kb));
                }
                plain.await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramClientError> {
        self.send(chat_id, None, text, None).await
    }

    pub async fn send_message_to_topic(
        &self,
        chat_id: i64,
        topic_id: i32,
        text: &str,
    ) -> Result<(), TelegramClientError> {
        self.send(chat_id, Some(topic_id), text, None).await
    }

    pub async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
        text: &str,
        keyboard: &Keyboard,
    ) -> Result<(), TelegramClientError> {
        self.send(chat_id, topic_id, text, Some(keyboard)).await
    }

    /// Collapses a picker/prompt message into a confirmation, optionally
    /// replacing its keyboard.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TelegramClientError> {
        let chat = teloxide::types::ChatId(chat_id);
        let mut request = self
            .bot
            .edit_message_text(chat, MessageId(message_id), truncate_for_telegram(text));
        if let Some(kb) = keyboard {
            request = request.reply_markup(build_markup(kb));
        }
        request.await?;
        Ok(())
    }

    /// Best-effort: expired callback queries routinely fail and are not
    /// actionable, so errors here are swallowed by the caller.
    pub async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramClientError> {
        let mut request = self
            .bot
            .answer_callback_query(teloxide::types::CallbackQueryId(callback_id.to_string()));
        if let Some(t) = text {
            request = request.text(t);
        }
        request.await?;
        Ok(())
    }

    pub async fn send_chat_action_typing(
        &self,
        chat_id: i64,
        topic_id: Option<i32>,
    ) -> Result<(), TelegramClientError> {
        let chat = teloxide::types::ChatId(chat_id);
        let mut request = self.bot.send_chat_action(chat, ChatAction::Typing);
        if let Some(topic) = topic_id {
            request = request.message_thread_id(ThreadId(MessageId(topic)));
        }
        request.await?;
        Ok(())
    }

    /// Best-effort rename, used when binding a topic to a project.
    pub async fn edit_forum_topic(
        &self,
        chat_id: i64,
        topic_id: i32,
        name: &str,
    ) -> Result<(), TelegramClientError> {
        let chat = teloxide::types::ChatId(chat_id);
        self.bot
            .edit_forum_topic(chat, ThreadId(MessageId(topic_id)))
            .name(name)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_noop_under_the_cap() {
        let text = "hello world";
        assert_eq!(truncate_for_telegram(text), text);
    }

    #[test]
    fn truncate_appends_marker_over_the_cap() {
        let text = "x".repeat(5000);
        let truncated = truncate_for_telegram(&text);
        assert!(truncated.len() <= TELEGRAM_MESSAGE_CAP);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn truncate_respects_utf8_char_boundaries() {
        let text = "é".repeat(3000);
        let truncated = truncate_for_telegram(&text);
        assert!(truncated.is_char_boundary(truncated.len() - TRUNCATION_MARKER.len()));
    }
}
