//! Telegram transport.
//!
//! The only module that talks to the chat platform. Inbound updates are
//! translated into [`ChatUpdate`]/[`CallbackUpdate`] and handed to the
//! pipeline; the [`TelegramOutbox`] implements the outbound operations the
//! core needs, propagating forum-topic thread ids to every reply.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ReplyParameters, ThreadId,
};
use tracing::info;

use super::{
    CallbackUpdate, ChatOutbox, ChatRef, ChatUpdate, MessagePipeline, CANCEL_CALLBACK_PREFIX,
};
use crate::CoreError;

pub struct TelegramTransport {
    token: String,
    pipeline: Arc<MessagePipeline>,
}

impl TelegramTransport {
    pub fn new(token: String, pipeline: Arc<MessagePipeline>) -> Self {
        Self { token, pipeline }
    }

    /// Build the outbox for a bot token without starting the dispatcher.
    pub fn outbox(token: &str) -> Arc<dyn ChatOutbox> {
        Arc::new(TelegramOutbox {
            bot: Bot::new(token),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let bot = Bot::new(&self.token);
        info!("telegram transport started");

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(
                |msg: Message, pipeline: Arc<MessagePipeline>| async move {
                    let Some(user) = msg.from.as_ref() else {
                        return respond(());
                    };
                    let Some(text) = msg.text() else {
                        return respond(());
                    };
                    let update = ChatUpdate {
                        chat: ChatRef {
                            chat_id: msg.chat.id.0,
                            thread_id: msg.thread_id.map(|t| t.0 .0),
                        },
                        message_id: msg.id.0,
                        user_id: user.id.0,
                        text: text.to_owned(),
                    };
                    pipeline.handle_update(update).await;
                    respond(())
                },
            ))
            .branch(Update::filter_callback_query().endpoint(
                |bot: Bot, query: CallbackQuery, pipeline: Arc<MessagePipeline>| async move {
                    // Clear the button spinner regardless of outcome.
                    let _ = bot.answer_callback_query(query.id.clone()).await;

                    let Some(data) = query.data.clone() else {
                        return respond(());
                    };
                    let Some(message) = query.message.as_ref() else {
                        return respond(());
                    };
                    let update = CallbackUpdate {
                        chat: ChatRef {
                            chat_id: message.chat().id.0,
                            thread_id: None,
                        },
                        user_id: query.from.id.0,
                        message_id: Some(message.id().0),
                        data,
                    };
                    pipeline.handle_callback(update).await;
                    respond(())
                },
            ));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![Arc::clone(&self.pipeline)])
            .default_handler(|_| async {})
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

pub struct TelegramOutbox {
    bot: Bot,
}

impl TelegramOutbox {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn chat_id(chat: &ChatRef) -> ChatId {
        ChatId(chat.chat_id)
    }
}

fn map_err(e: teloxide::RequestError) -> CoreError {
    CoreError::infra_msg(format!("telegram: {e}"))
}

fn keyboard(rows: &[Vec<(String, String)>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|(label, data)| InlineKeyboardButton::callback(label.clone(), data.clone()))
            .collect::<Vec<_>>()
    }))
}

#[async_trait]
impl ChatOutbox for TelegramOutbox {
    async fn send(&self, chat: &ChatRef, text: &str) -> Result<i32, CoreError> {
        let mut request = self.bot.send_message(Self::chat_id(chat), text);
        if let Some(thread) = chat.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        let sent = request.await.map_err(map_err)?;
        Ok(sent.id.0)
    }

    async fn send_with_buttons(
        &self,
        chat: &ChatRef,
        text: &str,
        buttons: &[Vec<(String, String)>],
    ) -> Result<i32, CoreError> {
        let mut request = self
            .bot
            .send_message(Self::chat_id(chat), text)
            .reply_markup(keyboard(buttons));
        if let Some(thread) = chat.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        let sent = request.await.map_err(map_err)?;
        Ok(sent.id.0)
    }

    async fn send_queue_indicator(
        &self,
        chat: &ChatRef,
        reply_to: i32,
        text: &str,
        entry_id: &str,
    ) -> Result<i32, CoreError> {
        let cancel_row = vec![vec![(
            "✖ Cancel this message".to_string(),
            format!("{CANCEL_CALLBACK_PREFIX}{entry_id}"),
        )]];
        let mut request = self
            .bot
            .send_message(Self::chat_id(chat), text)
            .reply_markup(keyboard(&cancel_row));
        if reply_to != 0 {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
        }
        if let Some(thread) = chat.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        let sent = request.await.map_err(map_err)?;
        Ok(sent.id.0)
    }

    async fn edit(&self, chat: &ChatRef, message_id: i32, text: &str) -> Result<(), CoreError> {
        self.bot
            .edit_message_text(Self::chat_id(chat), MessageId(message_id), text)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn delete(&self, chat: &ChatRef, message_id: i32) -> Result<(), CoreError> {
        self.bot
            .delete_message(Self::chat_id(chat), MessageId(message_id))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: &ChatRef,
        path: &std::path::Path,
    ) -> Result<(), CoreError> {
        let mut request = self
            .bot
            .send_document(Self::chat_id(chat), InputFile::file(path.to_path_buf()));
        if let Some(thread) = chat.thread_id {
            request = request.message_thread_id(ThreadId(MessageId(thread)));
        }
        request.await.map_err(map_err)?;
        Ok(())
    }
}
