//! Single-shot handling of client-supplied message ids, backed by the
//! tenant's cache with SET-IF-ABSENT.

use redis::aio::ConnectionManager;

pub const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

pub fn idempotency_key(tenant_id: &str, room_id: &str, user_id: &str, client_msg_id: &str) -> String {
    format!("ws:message:idempotency:{tenant_id}:{room_id}:{user_id}:{client_msg_id}")
}

#[derive(Debug, PartialEq)]
pub enum GateOutcome {
    Created,
    Duplicate,
}

pub async fn acquire(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<GateOutcome, redis::RedisError> {
    let set: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(IDEMPOTENCY_TTL_SECS)
        .query_async(conn)
        .await?;
    Ok(if set.is_some() {
        GateOutcome::Created
    } else {
        GateOutcome::Duplicate
    })
}

/// Compensating release after a failed persist so the client can retry the
/// same client_msg_id.
pub async fn release(conn: &mut ConnectionManager, key: &str) {
    let _: Result<(), _> = redis::cmd("DEL").arg(key).query_async(conn).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(
            idempotency_key("t1", "r1", "u1", "abc"),
            "ws:message:idempotency:t1:r1:u1:abc"
        );
    }

    #[tokio::test]
    #[ignore]
    async fn second_acquire_is_a_duplicate() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).expect("redis");
        let mut conn = client.get_connection_manager().await.expect("conn");
        let key = idempotency_key("t-test", "r1", "u1", &uuid::Uuid::new_v4().to_string());

        assert_eq!(acquire(&mut conn, &key).await.unwrap(), GateOutcome::Created);
        assert_eq!(
            acquire(&mut conn, &key).await.unwrap(),
            GateOutcome::Duplicate
        );
        release(&mut conn, &key).await;
        assert_eq!(acquire(&mut conn, &key).await.unwrap(), GateOutcome::Created);
        release(&mut conn, &key).await;
    }
}
