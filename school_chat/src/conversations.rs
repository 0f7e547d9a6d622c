use crate::error::ChatError;
use crate::model::{Conversation, ConversationSummary, ConversationType, Role};
use crate::permissions::{can_message, FamilyPolicy};
use crate::store;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

/// Check a participant set before creating a conversation.
///
/// Every participant must be known to the identity mirror and must be
/// allowed to message at least one other participant; a direct conversation
/// must have exactly two members.
pub fn vet_participants(
    conn: &Connection,
    ids: &[String],
    kind: ConversationType,
    policy: &dyn FamilyPolicy,
) -> Result<Vec<(String, Role)>, ChatError> {
    if ids.is_empty() {
        return Err(ChatError::InvalidParticipants);
    }
    if kind == ConversationType::Direct && ids.len() != 2 {
        return Err(ChatError::InvalidParticipants);
    }
    let mut roles = Vec::with_capacity(ids.len());
    for id in ids {
        let role = store::role_of(conn, id)?.ok_or(ChatError::InvalidParticipants)?;
        roles.push((id.clone(), role));
    }
    if roles.len() < 2 {
        return Ok(roles);
    }
    for (a, role_a) in &roles {
        let mut reaches_someone = false;
        for (b, role_b) in &roles {
            if a == b {
                continue;
            }
            if can_message(*role_a, *role_b, policy.linked(a, b)?) {
                reaches_someone = true;
                break;
            }
        }
        if !reaches_someone {
            return Err(ChatError::InvalidParticipants);
        }
    }
    Ok(roles)
}

/// Create a conversation. A direct conversation between an existing pair is
/// reused instead of duplicated, so repeated opens from the dashboard land
/// in the same thread.
pub fn create_conversation(
    conn: &mut Connection,
    creator: &str,
    ids: &[String],
    kind: ConversationType,
) -> Result<Conversation, ChatError> {
    if kind == ConversationType::Direct {
        if ids.len() != 2 {
            return Err(ChatError::InvalidParticipants);
        }
        if let Some(existing) = find_direct(conn, &ids[0], &ids[1])? {
            return Ok(existing);
        }
    }
    let id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO conversations (id, kind, created_by, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), kind.as_str(), creator, now],
    )?;
    for user in ids {
        tx.execute(
            "INSERT INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), user],
        )?;
    }
    tx.commit()?;
    Ok(Conversation {
        id,
        conversation_type: kind,
        created_by: creator.to_string(),
        created_at: now,
        participants: ids.to_vec(),
        last_message_content: None,
        last_message_at: None,
        last_message_by: None,
        total_messages: 0,
        is_active: true,
    })
}

fn find_direct(conn: &Connection, a: &str, b: &str) -> Result<Option<Conversation>, ChatError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT c.id FROM conversations c
             WHERE c.kind = 'direct' AND c.is_deleted = 0
               AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = ?1)
               AND EXISTS (SELECT 1 FROM participants p WHERE p.conversation_id = c.id AND p.user_id = ?2)",
            params![a, b],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => get_conversation(conn, &Uuid::parse_str(&id).unwrap()),
        None => Ok(None),
    }
}

pub fn get_conversation(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<Conversation>, ChatError> {
    let row = conn
        .query_row(
            "SELECT id, kind, created_by, created_at, last_message_content, last_message_at,
                    last_message_by, total_messages, is_active
             FROM conversations WHERE id = ?1 AND is_deleted = 0",
            [id.to_string()],
            |row| {
                Ok(Conversation {
                    id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
                    conversation_type: ConversationType::parse(
                        row.get::<_, String>(1)?.as_str(),
                    )
                    .unwrap(),
                    created_by: row.get(2)?,
                    created_at: row.get(3)?,
                    last_message_content: row.get(4)?,
                    last_message_at: row.get(5)?,
                    last_message_by: row.get(6)?,
                    total_messages: row.get(7)?,
                    is_active: row.get::<_, i64>(8)? != 0,
                    participants: Vec::new(),
                })
            },
        )
        .optional()?;
    let Some(mut conversation) = row else {
        return Ok(None);
    };
    conversation.participants = participants(conn, id)?;
    Ok(Some(conversation))
}

pub fn participants(conn: &Connection, conversation_id: &Uuid) -> Result<Vec<String>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM participants WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let users = stmt
        .query_map([conversation_id.to_string()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(users)
}

pub fn is_participant(
    conn: &Connection,
    conversation_id: &Uuid,
    user_id: &str,
) -> Result<bool, ChatError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Check a send against membership and, for direct conversations, the role
/// policy. Returns the participant set for fan-out.
pub fn vet_send(
    conn: &Connection,
    conversation_id: &Uuid,
    sender_id: &str,
    policy: &dyn FamilyPolicy,
) -> Result<Vec<String>, ChatError> {
    let conversation =
        get_conversation(conn, conversation_id)?.ok_or(ChatError::NotFound)?;
    if !conversation.participants.iter().any(|p| p == sender_id) {
        return Err(ChatError::NotAParticipant);
    }
    if conversation.conversation_type == ConversationType::Direct {
        let other = conversation
            .participants
            .iter()
            .find(|p| p.as_str() != sender_id)
            .ok_or(ChatError::InvalidParticipants)?;
        let sender_role =
            store::role_of(conn, sender_id)?.ok_or(ChatError::NotAParticipant)?;
        let other_role = store::role_of(conn, other)?.ok_or(ChatError::InvalidParticipants)?;
        if !can_message(sender_role, other_role, policy.linked(sender_id, other)?) {
            return Err(ChatError::PermissionDenied);
        }
    }
    Ok(conversation.participants)
}

/// List conversations visible to a user, newest activity first.
pub fn list_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ConversationSummary>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.kind, c.last_message_content, c.last_message_at, c.last_message_by,
                c.total_messages, p.unread_count, p.is_muted, p.is_archived,
                (SELECT GROUP_CONCAT(p2.user_id) FROM participants p2 WHERE p2.conversation_id = c.id)
         FROM conversations c
         JOIN participants p ON p.conversation_id = c.id
         WHERE p.user_id = ?1 AND c.is_deleted = 0 AND c.is_active = 1
         ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
    )?;
    let rows = stmt.query_map([user_id], |row| {
        Ok(ConversationSummary {
            id: Uuid::parse_str(row.get::<_, String>(0)?.as_str()).unwrap(),
            conversation_type: ConversationType::parse(row.get::<_, String>(1)?.as_str())
                .unwrap(),
            last_message_content: row.get(2)?,
            last_message_at: row.get(3)?,
            last_message_by: row.get(4)?,
            total_messages: row.get(5)?,
            unread_count: row.get(6)?,
            is_muted: row.get::<_, i64>(7)? != 0,
            is_archived: row.get::<_, i64>(8)? != 0,
            participants: row
                .get::<_, Option<String>>(9)?
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    })?;
    let mut out = Vec::new();
    for summary in rows {
        out.push(summary?);
    }
    Ok(out)
}

/// Per-participant flag; other participants never see it.
pub fn set_muted(
    conn: &Connection,
    conversation_id: &Uuid,
    user_id: &str,
    muted: bool,
) -> Result<(), ChatError> {
    let changed = conn.execute(
        "UPDATE participants SET is_muted = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
        params![conversation_id.to_string(), user_id, muted as i64],
    )?;
    if changed == 0 {
        return Err(ChatError::NotAParticipant);
    }
    Ok(())
}

/// Per-participant flag; other participants never see it.
pub fn set_archived(
    conn: &Connection,
    conversation_id: &Uuid,
    user_id: &str,
    archived: bool,
) -> Result<(), ChatError> {
    let changed = conn.execute(
        "UPDATE participants SET is_archived = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
        params![conversation_id.to_string(), user_id, archived as i64],
    )?;
    if changed == 0 {
        return Err(ChatError::NotAParticipant);
    }
    Ok(())
}

/// Unread counter and running total for the pre-subscribe snapshot.
pub fn snapshot(
    conn: &Connection,
    conversation_id: &Uuid,
    user_id: &str,
) -> Result<(i64, i64), ChatError> {
    conn.query_row(
        "SELECT p.unread_count, c.total_messages
         FROM participants p JOIN conversations c ON c.id = p.conversation_id
         WHERE p.conversation_id = ?1 AND p.user_id = ?2",
        params![conversation_id.to_string(), user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or(ChatError::NotAParticipant)
}
