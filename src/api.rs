use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::ClientError;
use crate::models::{Chat, ChatId, Member, Message, NewGroup, Role, User, UserId};

/// REST collaborator. Every call carries the session's bearer credential.
#[allow(async_fn_in_trait)]
pub trait ChatApi {
    async fn list_chats(&self) -> Result<Vec<Chat>, ClientError>;
    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, ClientError>;
    async fn send_message(&self, chat_id: ChatId, content: &str) -> Result<Message, ClientError>;
    async fn list_members(&self, chat_id: ChatId) -> Result<Vec<Member>, ClientError>;
    async fn list_users(&self) -> Result<Vec<User>, ClientError>;
    async fn create_private_chat(&self, user_id: UserId) -> Result<ChatId, ClientError>;
    async fn create_group(&self, group: &NewGroup) -> Result<ChatId, ClientError>;
    async fn delete_group(&self, chat_id: ChatId) -> Result<(), ClientError>;
    async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ClientError>;
    async fn set_member_role(
        &self,
        chat_id: ChatId,
        member_id: UserId,
        role: Role,
    ) -> Result<(), ClientError>;
    async fn remove_member(&self, chat_id: ChatId, member_id: UserId) -> Result<(), ClientError>;
    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), ClientError>;
}

/// Chat list with a last message filled in from history where the list lacks one.
pub async fn fetch_overview<A: ChatApi>(api: &A) -> Result<Vec<Chat>, ClientError> {
    let mut chats = api.list_chats().await?;
    for chat in chats.iter_mut().filter(|c| c.last_message.is_none()) {
        match api.list_messages(chat.id).await {
            Ok(mut history) => chat.last_message = history.pop(),
            Err(e) => debug!("No preview for chat {}: {}", chat.id, e),
        }
    }
    Ok(chats)
}

#[derive(Deserialize)]
struct CreatedChat {
    #[serde(alias = "chatId", alias = "chat_id")]
    id: ChatId,
}

pub struct HttpApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        HttpApi {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = self.authorized(builder).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!("Request failed with {}: {}", status, body);
        Err(ClientError::from_status(status.as_u16(), body)
            .unwrap_or_else(|| ClientError::Transport(format!("unexpected status {}", status))))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(self.client.get(self.url(path))).await?;
        Ok(response.json::<T>().await?)
    }
}

impl ChatApi for HttpApi {
    async fn list_chats(&self) -> Result<Vec<Chat>, ClientError> {
        self.get_json("chat").await
    }

    async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, ClientError> {
        self.get_json(&format!("chat/{}/messages", chat_id)).await
    }

    async fn send_message(&self, chat_id: ChatId, content: &str) -> Result<Message, ClientError> {
        let request = self
            .client
            .post(self.url(&format!("chat/{}/messages", chat_id)))
            .json(&json!({ "content": content }));
        Ok(self.send(request).await?.json::<Message>().await?)
    }

    async fn list_members(&self, chat_id: ChatId) -> Result<Vec<Member>, ClientError> {
        self.get_json(&format!("group/{}/members", chat_id)).await
    }

    async fn list_users(&self) -> Result<Vec<User>, ClientError> {
        self.get_json("users").await
    }

    async fn create_private_chat(&self, user_id: UserId) -> Result<ChatId, ClientError> {
        let request = self
            .client
            .post(self.url("chat/private"))
            .json(&json!({ "userId": user_id }));
        let created = self.send(request).await?.json::<CreatedChat>().await?;
        Ok(created.id)
    }

    async fn create_group(&self, group: &NewGroup) -> Result<ChatId, ClientError> {
        let request = self.client.post(self.url("group")).json(group);
        let created = self.send(request).await?.json::<CreatedChat>().await?;
        Ok(created.id)
    }

    async fn delete_group(&self, chat_id: ChatId) -> Result<(), ClientError> {
        self.send(self.client.delete(self.url(&format!("group/{}", chat_id))))
            .await
            .map(|_| ())
    }

    async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ClientError> {
        let request = self
            .client
            .post(self.url(&format!("group/{}/members", chat_id)))
            .json(&json!({ "userId": user_id }));
        self.send(request).await.map(|_| ())
    }

    async fn set_member_role(
        &self,
        chat_id: ChatId,
        member_id: UserId,
        role: Role,
    ) -> Result<(), ClientError> {
        let request = self
            .client
            .patch(self.url(&format!("group/{}/members/{}/role", chat_id, member_id)))
            .json(&json!({ "role": role }));
        self.send(request).await.map(|_| ())
    }

    async fn remove_member(&self, chat_id: ChatId, member_id: UserId) -> Result<(), ClientError> {
        let url = self.url(&format!("group/{}/members/{}", chat_id, member_id));
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    async fn leave_chat(&self, chat_id: ChatId) -> Result<(), ClientError> {
        let url = self.url(&format!("group/{}/leave", chat_id));
        self.send(self.client.delete(url)).await.map(|_| ())
    }
}
