use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{domain::ConversationId, protocol::HistoryPage};

use crate::config::Settings;

/// REST collaborator that owns message history and conversation lifecycle.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn fetch_history(&self, conversation_id: ConversationId, page: u32) -> Result<HistoryPage>;
    async fn close_conversation(&self, conversation_id: ConversationId) -> Result<()>;
}

/// Stand-in used when no history backend is configured: every page is empty.
pub struct NoHistoryApi;

#[async_trait]
impl ConversationApi for NoHistoryApi {
    async fn fetch_history(&self, _conversation_id: ConversationId, _page: u32) -> Result<HistoryPage> {
        Ok(HistoryPage::default())
    }

    async fn close_conversation(&self, _conversation_id: ConversationId) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct HistoryQuery {
    page: u32,
    page_size: u32,
}

pub struct HttpConversationApi {
    http: Client,
    api_base: String,
    access_token: Option<String>,
    page_size: u32,
}

impl HttpConversationApi {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: Client::new(),
            api_base: settings.api_base(),
            access_token: settings.access_token.clone(),
            page_size: settings.page_size,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_history(&self, conversation_id: ConversationId, page: u32) -> Result<HistoryPage> {
        let url = format!("{}/conversations/{conversation_id}/messages/", self.api_base);
        let page: HistoryPage = self
            .authorized(self.http.get(&url))
            .query(&HistoryQuery {
                page,
                page_size: self.page_size,
            })
            .send()
            .await
            .with_context(|| format!("failed to request history page {page} from {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("failed to decode history page")?;
        Ok(page)
    }

    async fn close_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let url = format!("{}/conversations/{conversation_id}/close/", self.api_base);
        self.authorized(self.http.post(&url))
            .send()
            .await
            .with_context(|| format!("failed to close conversation {conversation_id}"))?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
