use crate::Database;
use crate::models::{
    ChatRow, CommunityImageRow, CreatorRow, MessageRow, NewMessage, PendingRegistrationRow,
    Promotion, UserRow,
};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_email(conn, email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Atomic balance debit. The caller checks affordability first; this
    /// never blocks on other rows.
    pub fn decrement_credits(&self, user_id: &str, amount: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET credits = credits - ?1 WHERE id = ?2",
                (amount, user_id),
            )?;
            Ok(())
        })
    }

    pub fn set_reset_token(&self, user_id: &str, token_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users
                 SET reset_token = ?1, reset_token_expires = datetime('now', '+1 hour')
                 WHERE id = ?2",
                (token_hash, user_id),
            )?;
            Ok(())
        })
    }

    /// Consumes a reset token: updates the password and clears the token in
    /// one statement. Returns false when the token is unknown or expired.
    pub fn reset_password_with_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET password = ?1, reset_token = NULL, reset_token_expires = NULL
                 WHERE reset_token = ?2 AND reset_token_expires > datetime('now')",
                (new_password_hash, token_hash),
            )?;
            Ok(changed > 0)
        })
    }

    // -- Pending registrations --

    /// Registering again before verifying replaces the earlier signup
    /// wholesale, token included.
    pub fn upsert_pending_registration(
        &self,
        id: &str,
        name: &str,
        email: &str,
        password_hash: &str,
        token_hash: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO pending_registrations
                     (id, name, email, password, verification_token, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now', '+24 hours'))
                 ON CONFLICT(email) DO UPDATE SET
                     name = excluded.name,
                     password = excluded.password,
                     verification_token = excluded.verification_token,
                     expires_at = excluded.expires_at,
                     created_at = datetime('now')",
                rusqlite::params![id, name, email, password_hash, token_hash],
            )?;
            Ok(())
        })
    }

    pub fn get_pending_by_email(&self, email: &str) -> Result<Option<PendingRegistrationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, password, verification_token, expires_at, created_at
                 FROM pending_registrations WHERE email = ?1",
            )?;

            let row = stmt
                .query_row([email], |row| {
                    Ok(PendingRegistrationRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                        password: row.get(3)?,
                        verification_token: row.get(4)?,
                        expires_at: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })
                .optional()?;

            Ok(row)
        })
    }

    pub fn rotate_pending_token(&self, email: &str, token_hash: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE pending_registrations
                 SET verification_token = ?1, expires_at = datetime('now', '+24 hours')
                 WHERE email = ?2",
                (token_hash, email),
            )?;
            Ok(changed > 0)
        })
    }

    /// Redeems a verification token: promotes the pending registration into a
    /// full account (credits from the schema default) and drops the pending
    /// row, all in one transaction.
    pub fn promote_pending(&self, token_hash: &str, new_user_id: &str) -> Result<Promotion> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(pending) = query_pending_by_token(&tx, token_hash)? else {
                return Ok(Promotion::Invalid);
            };

            // The email may already belong to an account verified through an
            // earlier token; answer success without a second insert.
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE email = ?1",
                    [&pending.email],
                    |row| row.get(0),
                )
                .optional()?;

            let outcome = if existing.is_some() {
                Promotion::AlreadyVerified
            } else {
                tx.execute(
                    "INSERT INTO users (id, name, email, password) VALUES (?1, ?2, ?3, ?4)",
                    (new_user_id, &pending.name, &pending.email, &pending.password),
                )?;
                Promotion::Promoted
            };

            tx.execute(
                "DELETE FROM pending_registrations WHERE id = ?1",
                [&pending.id],
            )?;
            tx.commit()?;
            Ok(outcome)
        })
    }

    pub fn purge_expired_pending(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM pending_registrations WHERE expires_at <= datetime('now')",
                [],
            )?;
            Ok(removed)
        })
    }

    // -- Chats --

    pub fn create_chat(&self, id: &str, user_id: &str, name: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chats (id, user_id, name) VALUES (?1, ?2, ?3)",
                (id, user_id, name),
            )?;
            Ok(())
        })
    }

    /// Lookup scoped to the owner: a foreign chat id behaves like a missing one.
    pub fn get_chat(&self, id: &str, user_id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, created_at, updated_at
                 FROM chats WHERE id = ?1 AND user_id = ?2",
            )?;

            let row = stmt
                .query_row((id, user_id), |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })
                .optional()?;

            Ok(row)
        })
    }

    pub fn get_chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, created_at, updated_at
                 FROM chats WHERE user_id = ?1
                 ORDER BY updated_at DESC, rowid DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn rename_chat(&self, id: &str, user_id: &str, name: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE chats SET name = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND user_id = ?3",
                (name, id, user_id),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_chat(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM chats WHERE id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn delete_all_chats(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute("DELETE FROM chats WHERE user_id = ?1", [user_id])?;
            Ok(removed)
        })
    }

    // -- Messages --

    pub fn count_messages(&self, chat_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
                [chat_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Persists a prompt/reply pair and the chat bookkeeping in one
    /// transaction: either both messages land (plus the rename, when the
    /// first prompt names the chat) or none do.
    pub fn append_exchange(
        &self,
        chat_id: &str,
        user_msg: &NewMessage,
        reply: &NewMessage,
        new_name: Option<&str>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for msg in [user_msg, reply] {
                tx.execute(
                    "INSERT INTO messages (id, chat_id, role, content, is_image, is_published)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        msg.id,
                        chat_id,
                        msg.role,
                        msg.content,
                        msg.is_image,
                        msg.is_published
                    ],
                )?;
            }

            match new_name {
                Some(name) => tx.execute(
                    "UPDATE chats SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                    (name, chat_id),
                )?,
                None => tx.execute(
                    "UPDATE chats SET updated_at = datetime('now') WHERE id = ?1",
                    [chat_id],
                )?,
            };

            tx.commit()?;
            Ok(())
        })
    }

    /// Batch-fetch messages for a set of chat IDs, in insertion order.
    pub fn get_messages_for_chats(&self, chat_ids: &[String]) -> Result<Vec<MessageRow>> {
        if chat_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=chat_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, chat_id, role, content, is_image, is_published, created_at
                 FROM messages WHERE chat_id IN ({})
                 ORDER BY rowid",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = chat_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        role: row.get(2)?,
                        content: row.get(3)?,
                        is_image: row.get(4)?,
                        is_published: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Image messages are addressed by their stored URL, not by message id.
    pub fn find_image_message(&self, chat_id: &str, image_url: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, role, content, is_image, is_published, created_at
                 FROM messages WHERE chat_id = ?1 AND content = ?2 AND is_image = 1",
            )?;

            let row = stmt
                .query_row((chat_id, image_url), |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        role: row.get(2)?,
                        content: row.get(3)?,
                        is_image: row.get(4)?,
                        is_published: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })
                .optional()?;

            Ok(row)
        })
    }

    pub fn publish_image_message(&self, message_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE messages SET is_published = 1 WHERE id = ?1",
                [message_id],
            )?;
            Ok(())
        })
    }

    /// Removes an image message, reporting whether it had been published.
    /// Returns None when no such message exists in the chat.
    pub fn delete_image_message(&self, chat_id: &str, image_url: &str) -> Result<Option<bool>> {
        self.with_conn_mut(|conn| {
            let found: Option<(String, Option<bool>)> = conn
                .query_row(
                    "SELECT id, is_published FROM messages
                     WHERE chat_id = ?1 AND content = ?2 AND is_image = 1",
                    (chat_id, image_url),
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((id, published)) = found else {
                return Ok(None);
            };

            conn.execute("DELETE FROM messages WHERE id = ?1", [&id])?;
            Ok(Some(published.unwrap_or(false)))
        })
    }

    // -- Community gallery --

    pub fn upsert_community_image(
        &self,
        id: &str,
        image_url: &str,
        user_id: &str,
        user_name: &str,
        prompt: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO community_images (id, image_url, user_id, user_name, prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(image_url) DO UPDATE SET
                     user_id = excluded.user_id,
                     user_name = excluded.user_name,
                     prompt = excluded.prompt,
                     published_at = datetime('now')",
                rusqlite::params![id, image_url, user_id, user_name, prompt],
            )?;
            Ok(())
        })
    }

    pub fn get_published_images(&self, limit: u32) -> Result<Vec<CommunityImageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image_url, user_id, user_name, prompt, published_at
                 FROM community_images
                 ORDER BY published_at DESC, rowid DESC
                 LIMIT ?1",
            )?;

            let rows = stmt
                .query_map([limit], |row| {
                    Ok(CommunityImageRow {
                        id: row.get(0)?,
                        image_url: row.get(1)?,
                        user_id: row.get(2)?,
                        user_name: row.get(3)?,
                        prompt: row.get(4)?,
                        published_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_creators(&self, limit: u32) -> Result<Vec<CreatorRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_name, COUNT(*) AS image_count, MAX(published_at) AS latest
                 FROM community_images
                 GROUP BY user_name
                 ORDER BY image_count DESC
                 LIMIT ?1",
            )?;

            let rows = stmt
                .query_map([limit], |row| {
                    Ok(CreatorRow {
                        user_name: row.get(0)?,
                        image_count: row.get(1)?,
                        latest_published_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_images_by_creator(
        &self,
        user_name: &str,
        limit: u32,
    ) -> Result<Vec<CommunityImageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, image_url, user_id, user_name, prompt, published_at
                 FROM community_images
                 WHERE user_name = ?1
                 ORDER BY published_at DESC, rowid DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![user_name, limit], |row| {
                    Ok(CommunityImageRow {
                        id: row.get(0)?,
                        image_url: row.get(1)?,
                        user_id: row.get(2)?,
                        user_name: row.get(3)?,
                        prompt: row.get(4)?,
                        published_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn query_user_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, password, credits, is_verified,
                reset_token, reset_token_expires, created_at
         FROM users WHERE email = ?1",
    )?;

    let row = stmt
        .query_row([email], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                credits: row.get(4)?,
                is_verified: row.get(5)?,
                reset_token: row.get(6)?,
                reset_token_expires: row.get(7)?,
                created_at: row.get(8)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, password, credits, is_verified,
                reset_token, reset_token_expires, created_at
         FROM users WHERE id = ?1",
    )?;

    let row = stmt
        .query_row([id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                credits: row.get(4)?,
                is_verified: row.get(5)?,
                reset_token: row.get(6)?,
                reset_token_expires: row.get(7)?,
                created_at: row.get(8)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_pending_by_token(
    conn: &Connection,
    token_hash: &str,
) -> Result<Option<PendingRegistrationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, password, verification_token, expires_at, created_at
         FROM pending_registrations
         WHERE verification_token = ?1 AND expires_at > datetime('now')",
    )?;

    let row = stmt
        .query_row([token_hash], |row| {
            Ok(PendingRegistrationRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                verification_token: row.get(4)?,
                expires_at: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
