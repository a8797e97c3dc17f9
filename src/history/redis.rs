use async_trait::async_trait;
use crate::models::chat::{ Conversation, Message };
use crate::history::{ HistoryStore, StoreError };
use redis::aio::ConnectionManager;
use redis::{ Client, AsyncCommands };
use tokio::sync::{ Mutex, OnceCell };

/// Key layout, all under a configurable prefix:
///
/// * `conversation:{id}`: the conversation as JSON
/// * `conversations`: sorted set of ids scored by `updated_at` in milliseconds
/// * `messages:{id}`: list of JSON messages in append order
pub struct RedisHistoryStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    write_lock: Mutex<()>,
}

impl RedisHistoryStore {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: OnceCell::new(),
            key_prefix: key_prefix.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    /// One shared, self-reconnecting connection, opened on first use.
    async fn get_connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self.connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone())).await?;
        Ok(manager.clone())
    }

    fn conversation_key(&self, id: &str) -> String {
        format!("{}conversation:{}", self.key_prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}conversations", self.key_prefix)
    }

    fn messages_key(&self, id: &str) -> String {
        format!("{}messages:{}", self.key_prefix, id)
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        id: &str
    ) -> Result<Conversation, StoreError> {
        let raw: Option<String> = conn.get(self.conversation_key(id)).await?;
        let raw = raw.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save(
        &self,
        conn: &mut ConnectionManager,
        convo: &Conversation
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(convo)?;
        redis::pipe()
            .atomic()
            .set(self.conversation_key(&convo.id), json)
            .ignore()
            .zadd(self.index_key(), &convo.id, convo.updated_at.timestamp_millis())
            .ignore()
            .query_async::<_, ()>(conn).await?;
        Ok(())
    }

    async fn modify<F>(&self, id: &str, change: F) -> Result<(), StoreError>
        where F: FnOnce(&mut Conversation) + Send
    {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.get_connection().await?;
        let mut convo = self.load(&mut conn, id).await?;
        change(&mut convo);
        self.save(&mut conn, &convo).await
    }
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn create_conversation(
        &self,
        id: &str,
        title: &str,
        model: &str
    ) -> Result<Conversation, StoreError> {
        let convo = Conversation::new(id, title, model);
        let _guard = self.write_lock.lock().await;
        let mut conn = self.get_connection().await?;
        self.save(&mut conn, &convo).await?;
        Ok(convo)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.zrevrange(self.index_key(), 0, -1).await?;

        let mut convos = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&mut conn, &id).await {
                Ok(convo) => convos.push(convo),
                // raced with a delete
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    return Err(e);
                }
            }
        }
        Ok(convos)
    }

    async fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let title = title.to_string();
        self.modify(id, move |convo| {
            convo.title = title;
            convo.touch();
        }).await
    }

    async fn touch(&self, id: &str) -> Result<(), StoreError> {
        self.modify(id, |convo| convo.touch()).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .del(self.conversation_key(id))
            .ignore()
            .del(self.messages_key(id))
            .ignore()
            .zrem(self.index_key(), id)
            .ignore()
            .query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        let json = serde_json::to_string(message)?;
        let _guard = self.write_lock.lock().await;
        let mut conn = self.get_connection().await?;

        let exists: bool = conn.exists(self.conversation_key(&message.conversation_id)).await?;
        if !exists {
            return Err(StoreError::NotFound(message.conversation_id.clone()));
        }
        let _: i64 = conn.rpush(self.messages_key(&message.conversation_id), json).await?;
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.get_connection().await?;
        let entries: Vec<String> = conn.lrange(self.messages_key(conversation_id), 0, -1).await?;
        decode_messages(&entries)
    }
}

/// Chronological. A single unreadable entry fails the whole read.
fn decode_messages(entries: &[String]) -> Result<Vec<Message>, StoreError> {
    let mut messages = entries
        .iter()
        .map(|entry| serde_json::from_str::<Message>(entry))
        .collect::<Result<Vec<_>, _>>()?;
    // stable, so appends with equal timestamps keep their order
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(messages)
}
