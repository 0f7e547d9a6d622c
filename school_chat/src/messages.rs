use crate::conversations;
use crate::error::ChatError;
use crate::model::{
    ConversationType, Message, MessageStatus, MessageType, Role, UserRecord, MAX_CONTENT_CHARS,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Column list shared by every message query, including the reader set.
const MSG_COLS: &str = "m.id, m.conversation_id, m.seq, m.sender_id, m.sender_name, m.sender_role, \
     m.recipient_id, m.content, m.message_type, m.status, m.is_read, m.read_at, m.reply_to, \
     m.created_at, m.updated_at, m.deleted_at, \
     (SELECT GROUP_CONCAT(r.user_id) FROM message_reads r WHERE r.message_id = m.id)";

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
        conversation_id: Uuid::parse_str(row.get::<_, String>(1)?.as_str()).unwrap(),
        seq: row.get(2)?,
        sender_id: row.get(3)?,
        sender_name: row.get(4)?,
        sender_role: Role::parse(row.get::<_, String>(5)?.as_str()).unwrap(),
        recipient_id: row.get(6)?,
        content: row.get(7)?,
        message_type: MessageType::parse(row.get::<_, String>(8)?.as_str()).unwrap(),
        status: MessageStatus::parse(row.get::<_, String>(9)?.as_str()).unwrap(),
        is_read: row.get::<_, i64>(10)? != 0,
        read_at: row.get(11)?,
        reply_to: row
            .get::<_, Option<String>>(12)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        deleted_at: row.get(15)?,
        read_by: row
            .get::<_, Option<String>>(16)?
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

pub fn get_message(conn: &Connection, id: &Uuid) -> Result<Option<Message>, ChatError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLS} FROM messages m WHERE m.id = ?1"
    ))?;
    let msg = stmt.query_row([id.to_string()], row_to_msg).optional()?;
    Ok(msg)
}

fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::EmptyContent);
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::ContentTooLong);
    }
    Ok(())
}

/// Append a message. One transaction covers the insert, the running total,
/// the last-message cache and every recipient's unread counter, so a send
/// either lands whole or not at all. A repeated `client_key` from the same
/// sender returns the already-accepted message instead of a duplicate.
pub fn send_message(
    conn: &mut Connection,
    conversation_id: &Uuid,
    sender: &UserRecord,
    content: &str,
    message_type: MessageType,
    reply_to: Option<&Uuid>,
    client_key: Option<&str>,
) -> Result<Message, ChatError> {
    validate_content(content)?;
    let conversation = conversations::get_conversation(conn, conversation_id)?
        .ok_or(ChatError::NotFound)?;
    if !conversation.participants.iter().any(|p| p == &sender.id) {
        return Err(ChatError::NotAParticipant);
    }
    if let Some(key) = client_key {
        let mut stmt = conn.prepare(&format!(
            "SELECT {MSG_COLS} FROM messages m WHERE m.sender_id = ?1 AND m.client_key = ?2"
        ))?;
        if let Some(existing) = stmt
            .query_row(params![sender.id, key], row_to_msg)
            .optional()?
        {
            return Ok(existing);
        }
    }
    if let Some(target) = reply_to {
        let in_conversation: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![target.to_string(), conversation_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if in_conversation.is_none() {
            return Err(ChatError::InvalidReplyTo);
        }
    }
    let recipient_id = match conversation.conversation_type {
        ConversationType::Direct => conversation
            .participants
            .iter()
            .find(|p| p.as_str() != sender.id)
            .cloned(),
        _ => None,
    };
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let seq: i64 = tx.query_row(
        "SELECT total_messages + 1 FROM conversations WHERE id = ?1",
        [conversation_id.to_string()],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO messages (id, conversation_id, seq, sender_id, sender_name, sender_role,
                               recipient_id, content, message_type, status, reply_to,
                               client_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'sent', ?10, ?11, ?12)",
        params![
            id.to_string(),
            conversation_id.to_string(),
            seq,
            sender.id,
            sender.display_name,
            sender.role.as_str(),
            recipient_id,
            content,
            message_type.as_str(),
            reply_to.map(|r| r.to_string()),
            client_key,
            now
        ],
    )?;
    tx.execute(
        "UPDATE conversations SET total_messages = ?2,
                last_message_content = ?3, last_message_at = ?4, last_message_by = ?5
         WHERE id = ?1",
        params![conversation_id.to_string(), seq, content, now, sender.id],
    )?;
    tx.execute(
        "UPDATE participants SET unread_count = unread_count + 1
         WHERE conversation_id = ?1 AND user_id != ?2",
        params![conversation_id.to_string(), sender.id],
    )?;
    tx.commit()?;
    Ok(Message {
        id,
        conversation_id: *conversation_id,
        seq,
        sender_id: sender.id.clone(),
        sender_name: sender.display_name.clone(),
        sender_role: sender.role,
        recipient_id,
        content: content.to_string(),
        message_type,
        status: MessageStatus::Sent,
        is_read: false,
        read_at: None,
        read_by: Vec::new(),
        reply_to: reply_to.copied(),
        created_at: now,
        updated_at: None,
        deleted_at: None,
    })
}

/// Bump a freshly fanned-out message to delivered; never moves backwards.
pub fn mark_delivered(conn: &Connection, message_id: &Uuid) -> Result<bool, ChatError> {
    let changed = conn.execute(
        "UPDATE messages SET status = 'delivered' WHERE id = ?1 AND status = 'sent'",
        [message_id.to_string()],
    )?;
    Ok(changed > 0)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReadReceipt {
    pub conversation_id: Uuid,
    pub user_id: String,
    pub up_to: Option<Uuid>,
    pub read_at: i64,
    pub newly_read: usize,
    pub participants: Vec<String>,
}

/// Record that `user_id` has read the conversation up to `up_to` (or all of
/// it). The unread counter is recomputed from the read set, so a partial
/// mark leaves exactly the tail unread, and a message flips to read once
/// every other participant has seen it.
pub fn mark_read(
    conn: &mut Connection,
    conversation_id: &Uuid,
    user_id: &str,
    up_to: Option<&Uuid>,
) -> Result<ReadReceipt, ChatError> {
    if !conversations::is_participant(conn, conversation_id, user_id)? {
        return Err(ChatError::NotAParticipant);
    }
    let participants = conversations::participants(conn, conversation_id)?;
    let cutoff_seq = match up_to {
        Some(id) => {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM messages WHERE id = ?1 AND conversation_id = ?2",
                    params![id.to_string(), conversation_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            seq.ok_or(ChatError::NotFound)?
        }
        None => i64::MAX,
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    let newly_read = tx.execute(
        "INSERT INTO message_reads (message_id, user_id, read_at)
         SELECT m.id, ?2, ?3 FROM messages m
         WHERE m.conversation_id = ?1 AND m.sender_id != ?2 AND m.deleted_at IS NULL
           AND m.seq <= ?4
           AND NOT EXISTS (SELECT 1 FROM message_reads r
                           WHERE r.message_id = m.id AND r.user_id = ?2)",
        params![conversation_id.to_string(), user_id, now, cutoff_seq],
    )?;
    let required = participants.len().saturating_sub(1);
    if required > 0 {
        tx.execute(
            "UPDATE messages SET is_read = 1, read_at = ?2, status = 'read'
             WHERE conversation_id = ?1 AND deleted_at IS NULL
               AND status IN ('sent','delivered')
               AND (SELECT COUNT(*) FROM message_reads r
                    WHERE r.message_id = messages.id) >= ?3",
            params![conversation_id.to_string(), now, required as i64],
        )?;
    }
    tx.execute(
        "UPDATE participants SET last_read_at = ?3,
                unread_count = (SELECT COUNT(*) FROM messages m
                                WHERE m.conversation_id = ?1 AND m.sender_id != ?2
                                  AND m.deleted_at IS NULL
                                  AND NOT EXISTS (SELECT 1 FROM message_reads r
                                                  WHERE r.message_id = m.id
                                                    AND r.user_id = ?2))
         WHERE conversation_id = ?1 AND user_id = ?2",
        params![conversation_id.to_string(), user_id, now],
    )?;
    tx.commit()?;
    Ok(ReadReceipt {
        conversation_id: *conversation_id,
        user_id: user_id.to_string(),
        up_to: up_to.copied(),
        read_at: now,
        newly_read,
        participants,
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

fn encode_cursor(seq: i64) -> String {
    STANDARD.encode(seq.to_string())
}

fn decode_cursor(cursor: &str) -> Result<i64, ChatError> {
    let bytes = STANDARD.decode(cursor).map_err(|_| ChatError::InvalidCursor)?;
    let text = String::from_utf8(bytes).map_err(|_| ChatError::InvalidCursor)?;
    text.parse().map_err(|_| ChatError::InvalidCursor)
}

/// Page through a conversation, newest first. Soft-deleted messages stay
/// hidden except from their own sender while the deletion is fresh enough
/// to undo.
pub fn history(
    conn: &Connection,
    conversation_id: &Uuid,
    requester: &str,
    cursor: Option<&str>,
    limit: usize,
    deleted_grace_secs: i64,
) -> Result<HistoryPage, ChatError> {
    if !conversations::is_participant(conn, conversation_id, requester)? {
        return Err(ChatError::NotAParticipant);
    }
    let limit = limit.clamp(1, 200);
    let before = match cursor {
        Some(c) => decode_cursor(c)?,
        None => i64::MAX,
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let mut stmt = conn.prepare(&format!(
        "SELECT {MSG_COLS} FROM messages m
         WHERE m.conversation_id = ?1 AND m.seq < ?2
           AND (m.deleted_at IS NULL OR (m.sender_id = ?3 AND m.deleted_at > ?4))
         ORDER BY m.seq DESC LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            conversation_id.to_string(),
            before,
            requester,
            now - deleted_grace_secs,
            limit as i64
        ],
        row_to_msg,
    )?;
    let mut messages = Vec::new();
    for msg in rows {
        messages.push(msg?);
    }
    let next_cursor = if messages.len() == limit {
        messages.last().map(|m| encode_cursor(m.seq))
    } else {
        None
    };
    Ok(HistoryPage {
        messages,
        next_cursor,
    })
}

/// Rewrite a message's content. Sender only, and only while the edit window
/// is open.
pub fn edit_message(
    conn: &Connection,
    message_id: &Uuid,
    editor: &str,
    content: &str,
    grace_secs: i64,
) -> Result<Message, ChatError> {
    validate_content(content)?;
    let msg = get_message(conn, message_id)?.ok_or(ChatError::NotFound)?;
    if msg.deleted_at.is_some() {
        return Err(ChatError::NotFound);
    }
    if msg.sender_id != editor {
        return Err(ChatError::PermissionDenied);
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if now - msg.created_at > grace_secs {
        return Err(ChatError::EditWindowElapsed);
    }
    conn.execute(
        "UPDATE messages SET content = ?2, updated_at = ?3 WHERE id = ?1",
        params![message_id.to_string(), content, now],
    )?;
    Ok(get_message(conn, message_id)?.ok_or(ChatError::NotFound)?)
}

/// Soft-delete a message and settle every participant's unread counter and
/// the conversation's last-message cache.
pub fn delete_message(
    conn: &mut Connection,
    message_id: &Uuid,
    requester: &str,
) -> Result<Message, ChatError> {
    let msg = get_message(conn, message_id)?.ok_or(ChatError::NotFound)?;
    if msg.deleted_at.is_some() {
        return Err(ChatError::NotFound);
    }
    if msg.sender_id != requester {
        return Err(ChatError::PermissionDenied);
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let conv = msg.conversation_id.to_string();
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE messages SET deleted_at = ?2 WHERE id = ?1",
        params![message_id.to_string(), now],
    )?;
    tx.execute(
        "UPDATE participants SET unread_count =
            (SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = participants.conversation_id
               AND m.sender_id != participants.user_id AND m.deleted_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM message_reads r
                               WHERE r.message_id = m.id
                                 AND r.user_id = participants.user_id))
         WHERE conversation_id = ?1",
        [&conv],
    )?;
    tx.execute(
        "UPDATE conversations SET
            last_message_content = (SELECT content FROM messages
                                    WHERE conversation_id = ?1 AND deleted_at IS NULL
                                    ORDER BY seq DESC LIMIT 1),
            last_message_at = (SELECT created_at FROM messages
                               WHERE conversation_id = ?1 AND deleted_at IS NULL
                               ORDER BY seq DESC LIMIT 1),
            last_message_by = (SELECT sender_id FROM messages
                               WHERE conversation_id = ?1 AND deleted_at IS NULL
                               ORDER BY seq DESC LIMIT 1)
         WHERE id = ?1",
        [&conv],
    )?;
    tx.commit()?;
    Ok(get_message(conn, message_id)?.ok_or(ChatError::NotFound)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::model::ConversationType;
    use crate::store::upsert_user;

    fn user(id: &str, role: Role) -> UserRecord {
        UserRecord {
            id: id.into(),
            username: id.into(),
            display_name: id.into(),
            role,
        }
    }

    fn setup() -> (Connection, Uuid, UserRecord, UserRecord) {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(db::SCHEMA).unwrap();
        let alice = user("alice", Role::Teacher);
        let bob = user("bob", Role::Student);
        upsert_user(&conn, &alice).unwrap();
        upsert_user(&conn, &bob).unwrap();
        let conv = conversations::create_conversation(
            &mut conn,
            "alice",
            &["alice".to_string(), "bob".to_string()],
            ConversationType::Direct,
        )
        .unwrap();
        (conn, conv.id, alice, bob)
    }

    fn unread(conn: &Connection, conv: &Uuid, user: &str) -> i64 {
        conn.query_row(
            "SELECT unread_count FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conv.to_string(), user],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn send_updates_counters_and_cache() {
        let (mut conn, conv, alice, _bob) = setup();
        let msg = send_message(&mut conn, &conv, &alice, "hello", MessageType::Text, None, None)
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.recipient_id.as_deref(), Some("bob"));
        assert_eq!(unread(&conn, &conv, "bob"), 1);
        assert_eq!(unread(&conn, &conv, "alice"), 0);
        let total: i64 = conn
            .query_row(
                "SELECT total_messages FROM conversations WHERE id = ?1",
                [conv.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 1);
        let last: String = conn
            .query_row(
                "SELECT last_message_content FROM conversations WHERE id = ?1",
                [conv.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last, "hello");
    }

    #[test]
    fn content_bounds_are_enforced() {
        let (mut conn, conv, alice, _bob) = setup();
        let too_long = "x".repeat(MAX_CONTENT_CHARS + 1);
        let err =
            send_message(&mut conn, &conv, &alice, &too_long, MessageType::Text, None, None)
                .unwrap_err();
        assert_eq!(err.code(), "content_too_long");
        let err = send_message(&mut conn, &conv, &alice, "  ", MessageType::Text, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "empty_content");
        // exactly at the limit is fine
        let max = "x".repeat(MAX_CONTENT_CHARS);
        assert!(send_message(&mut conn, &conv, &alice, &max, MessageType::Text, None, None).is_ok());
    }

    #[test]
    fn outsiders_cannot_send() {
        let (mut conn, conv, _alice, _bob) = setup();
        let eve = user("eve", Role::Teacher);
        upsert_user(&conn, &eve).unwrap();
        let err = send_message(&mut conn, &conv, &eve, "hi", MessageType::Text, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "not_a_participant");
    }

    #[test]
    fn client_key_makes_retries_idempotent() {
        let (mut conn, conv, alice, _bob) = setup();
        let first = send_message(
            &mut conn,
            &conv,
            &alice,
            "hello",
            MessageType::Text,
            None,
            Some("key-1"),
        )
        .unwrap();
        let second = send_message(
            &mut conn,
            &conv,
            &alice,
            "hello",
            MessageType::Text,
            None,
            Some("key-1"),
        )
        .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(unread(&conn, &conv, "bob"), 1);
    }

    #[test]
    fn reply_must_stay_in_the_conversation() {
        let (mut conn, conv, alice, bob) = setup();
        let other = conversations::create_conversation(
            &mut conn,
            "alice",
            &["alice".to_string(), "bob".to_string()],
            ConversationType::Group,
        )
        .unwrap();
        let msg = send_message(&mut conn, &conv, &alice, "hi", MessageType::Text, None, None)
            .unwrap();
        let err = send_message(
            &mut conn,
            &other.id,
            &bob,
            "re",
            MessageType::Text,
            Some(&msg.id),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_reply_to");
        let ok = send_message(
            &mut conn,
            &conv,
            &bob,
            "re",
            MessageType::Text,
            Some(&msg.id),
            None,
        )
        .unwrap();
        assert_eq!(ok.reply_to, Some(msg.id));
    }

    #[test]
    fn partial_mark_read_leaves_the_tail() {
        let (mut conn, conv, alice, _bob) = setup();
        let _m1 = send_message(&mut conn, &conv, &alice, "m1", MessageType::Text, None, None)
            .unwrap();
        let m2 = send_message(&mut conn, &conv, &alice, "m2", MessageType::Text, None, None)
            .unwrap();
        let _m3 = send_message(&mut conn, &conv, &alice, "m3", MessageType::Text, None, None)
            .unwrap();
        assert_eq!(unread(&conn, &conv, "bob"), 3);
        let receipt = mark_read(&mut conn, &conv, "bob", Some(&m2.id)).unwrap();
        assert_eq!(receipt.newly_read, 2);
        assert_eq!(unread(&conn, &conv, "bob"), 1);
        // a full mark clears the counter
        mark_read(&mut conn, &conv, "bob", None).unwrap();
        assert_eq!(unread(&conn, &conv, "bob"), 0);
    }

    #[test]
    fn read_status_flips_once_all_recipients_read() {
        let (mut conn, conv, alice, _bob) = setup();
        let msg = send_message(&mut conn, &conv, &alice, "hi", MessageType::Text, None, None)
            .unwrap();
        mark_read(&mut conn, &conv, "bob", None).unwrap();
        let read = get_message(&conn, &msg.id).unwrap().unwrap();
        assert!(read.is_read);
        assert_eq!(read.status, MessageStatus::Read);
        assert_eq!(read.read_by, vec!["bob".to_string()]);
        // already read: delivered must not regress the status
        assert!(!mark_delivered(&conn, &msg.id).unwrap());
        let still = get_message(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(still.status, MessageStatus::Read);
    }

    #[test]
    fn unread_never_counts_own_messages() {
        let (mut conn, conv, alice, bob) = setup();
        send_message(&mut conn, &conv, &alice, "from alice", MessageType::Text, None, None)
            .unwrap();
        send_message(&mut conn, &conv, &bob, "from bob", MessageType::Text, None, None)
            .unwrap();
        assert_eq!(unread(&conn, &conv, "alice"), 1);
        assert_eq!(unread(&conn, &conv, "bob"), 1);
    }

    #[test]
    fn history_pages_hold_total_order() {
        let (mut conn, conv, alice, _bob) = setup();
        for i in 0..5 {
            send_message(
                &mut conn,
                &conv,
                &alice,
                &format!("m{i}"),
                MessageType::Text,
                None,
                None,
            )
            .unwrap();
        }
        let all = history(&conn, &conv, "bob", None, 10, 300).unwrap();
        assert_eq!(all.messages.len(), 5);
        assert!(all.next_cursor.is_none());
        let first = history(&conn, &conv, "bob", None, 2, 300).unwrap();
        assert_eq!(first.messages.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();
        let second = history(&conn, &conv, "bob", Some(&cursor), 2, 300).unwrap();
        let mut combined = first.messages.clone();
        combined.extend(second.messages.clone());
        assert_eq!(combined, all.messages[..4]);
        assert_eq!(
            history(&conn, &conv, "bob", Some("???"), 2, 300)
                .unwrap_err()
                .code(),
            "invalid_cursor"
        );
    }

    #[test]
    fn deleted_messages_hide_from_everyone_but_the_sender() {
        let (mut conn, conv, alice, _bob) = setup();
        let msg = send_message(&mut conn, &conv, &alice, "oops", MessageType::Text, None, None)
            .unwrap();
        delete_message(&mut conn, &msg.id, "alice").unwrap();
        let bob_view = history(&conn, &conv, "bob", None, 10, 300).unwrap();
        assert!(bob_view.messages.is_empty());
        let alice_view = history(&conn, &conv, "alice", None, 10, 300).unwrap();
        assert_eq!(alice_view.messages.len(), 1);
        assert_eq!(unread(&conn, &conv, "bob"), 0);
        let cache: Option<String> = conn
            .query_row(
                "SELECT last_message_content FROM conversations WHERE id = ?1",
                [conv.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(cache, None);
    }

    #[test]
    fn edit_is_sender_only_and_windowed() {
        let (mut conn, conv, alice, _bob) = setup();
        let msg = send_message(&mut conn, &conv, &alice, "helo", MessageType::Text, None, None)
            .unwrap();
        let err = edit_message(&conn, &msg.id, "bob", "hax", 300).unwrap_err();
        assert_eq!(err.code(), "permission_denied");
        let err = edit_message(&conn, &msg.id, "alice", "hello", -1).unwrap_err();
        assert_eq!(err.code(), "edit_window_elapsed");
        let edited = edit_message(&conn, &msg.id, "alice", "hello", 300).unwrap();
        assert_eq!(edited.content, "hello");
        assert!(edited.updated_at.is_some());
    }
}
