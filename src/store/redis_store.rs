use std::time::Duration;

use ::redis::{Client, Msg, aio::MultiplexedConnection};
use async_trait::async_trait;
use futures::{StreamExt, future};
use time::OffsetDateTime;

use crate::domain::types::{Artifact, ArtifactKey};

use super::{ArtifactStore, ExpirationEvent, ExpirationStream, StoreError, pattern::key_from_channel};

const EXPIRED_PAYLOAD: &str = "expired";

/// Redis-backed artifact store.
///
/// Expiration notifications require `notify-keyspace-events` to include `Ex`;
/// pass `configure_notifications` to have the store enable it on connect.
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str, configure_notifications: bool) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|err| StoreError::connection(err.to_string()))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::connection(err.to_string()))?;

        if configure_notifications {
            let _: () = ::redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query_async(&mut connection)
                .await
                .map_err(|err| StoreError::command("CONFIG SET", err.to_string()))?;
        }

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl ArtifactStore for RedisStore {
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        let mut connection = self.connection.clone();
        let (value, pttl): (Option<String>, i64) = ::redis::pipe()
            .cmd("GET")
            .arg(key.as_str())
            .cmd("PTTL")
            .arg(key.as_str())
            .query_async(&mut connection)
            .await
            .map_err(|err| StoreError::command("GET", err.to_string()))?;

        // PTTL is -1 without a TTL and -2 when the key vanished between commands.
        let expires_at = (pttl > 0)
            .then(|| OffsetDateTime::now_utc().checked_add(time::Duration::milliseconds(pttl)))
            .flatten();

        Ok(value.map(|value| Artifact {
            key: key.clone(),
            value,
            expires_at,
        }))
    }

    async fn set(&self, key: &ArtifactKey, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis())
            .map_err(|_| StoreError::command("SET", "ttl exceeds supported range"))?;
        if ttl_ms == 0 {
            return Err(StoreError::command("SET", "invalid expire time"));
        }

        let mut connection = self.connection.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key.as_str())
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(|err| StoreError::command("SET", err.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<ExpirationStream, StoreError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| StoreError::connection(err.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|err| StoreError::command("PSUBSCRIBE", err.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| future::ready(expiration_from_message(&msg)));

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|err| StoreError::command("PING", err.to_string()))?;
        Ok(())
    }
}

/// Keep `expired` keyspace notifications; other keyspace events are skipped.
fn expiration_from_message(msg: &Msg) -> Option<Result<ExpirationEvent, StoreError>> {
    let channel = msg.get_channel_name();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(_) => {
            return Some(Err(StoreError::MalformedNotification {
                channel: channel.to_string(),
            }));
        }
    };
    if payload != EXPIRED_PAYLOAD {
        return None;
    }

    Some(match key_from_channel(channel) {
        Some(key) => Ok(ExpirationEvent {
            key: key.to_string(),
        }),
        None => Err(StoreError::MalformedNotification {
            channel: channel.to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use ::redis::Value;

    use super::*;

    fn pmessage(channel: &str, payload: &[u8]) -> Msg {
        let value = Value::Array(vec![
            Value::BulkString(b"pmessage".to_vec()),
            Value::BulkString(b"__keyspace@*__:example.com".to_vec()),
            Value::BulkString(channel.as_bytes().to_vec()),
            Value::BulkString(payload.to_vec()),
        ]);
        Msg::from_value(&value).expect("pmessage should parse")
    }

    #[test]
    fn expired_notification_yields_key() {
        let msg = pmessage("__keyspace@0__:example.com", b"expired");
        let event = expiration_from_message(&msg)
            .expect("expired events are kept")
            .expect("well-formed notification");
        assert_eq!(event.key, "example.com");
    }

    #[test]
    fn other_keyspace_events_are_skipped() {
        for payload in [&b"set"[..], b"del", b"expire"] {
            let msg = pmessage("__keyspace@0__:example.com", payload);
            assert!(expiration_from_message(&msg).is_none());
        }
    }

    #[test]
    fn malformed_channel_is_reported() {
        let msg = pmessage("__keyspace@x__:example.com", b"expired");
        assert!(matches!(
            expiration_from_message(&msg),
            Some(Err(StoreError::MalformedNotification { channel }))
                if channel == "__keyspace@x__:example.com"
        ));
    }

    #[test]
    fn non_utf8_payload_is_reported() {
        let msg = pmessage("__keyspace@0__:example.com", &[0xff, 0xfe]);
        assert!(matches!(
            expiration_from_message(&msg),
            Some(Err(StoreError::MalformedNotification { .. }))
        ));
    }
}
