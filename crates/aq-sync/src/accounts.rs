//! User provisioning, invite codes and friend edges.

use aq_core::UserRecord;
use aq_storage::{Store, StoreError, UserCreation};
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

/// No 0/O or 1/I.
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const INVITE_CODE_LEN: usize = 6;
const MAX_MINT_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid invite code")]
    InvalidInviteCode,
    #[error("cannot add yourself as a friend")]
    SelfFriend,
    #[error("could not mint a unique invite code after {0} attempts")]
    InviteCodeExhausted(usize),
}

/// Identity claims from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
}

pub fn generate_invite_code<R: Rng>(rng: &mut R) -> String {
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect()
}

/// Returns the stored user, creating it with a fresh invite code on first
/// sight. Code collisions are retried with a new code.
pub async fn ensure_user<S>(
    store: &S,
    identity: &NewUser,
    now: DateTime<Utc>,
) -> Result<UserRecord, AccountError>
where
    S: Store + ?Sized,
{
    if let Some(user) = store.get_user(&identity.user_id).await? {
        return Ok(user);
    }

    for attempt in 1..=MAX_MINT_ATTEMPTS {
        let code = generate_invite_code(&mut rand::thread_rng());
        let user = UserRecord::new(
            identity.user_id.clone(),
            identity.name.clone(),
            identity.email.clone(),
            code,
            now,
        );
        match store.create_user(&user).await? {
            UserCreation::Created => {
                info!(user_id = %user.user_id, invite_code = %user.invite_code, "created user");
                return Ok(user);
            }
            // A concurrent first request won the insert.
            UserCreation::UserExists => {
                return store
                    .get_user(&identity.user_id)
                    .await?
                    .ok_or_else(|| StoreError::UserNotFound(identity.user_id.clone()).into());
            }
            UserCreation::InviteCodeTaken => {
                warn!(user_id = %identity.user_id, attempt, "invite code collision");
            }
        }
    }
    Err(AccountError::InviteCodeExhausted(MAX_MINT_ATTEMPTS))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddFriendOutcome {
    Added { friend_id: String },
    AlreadyFriends { friend_id: String },
}

/// Adds the owner of `code` to `user_id`'s friends. The edge is one-directional.
pub async fn add_friend_by_code<S>(
    store: &S,
    user_id: &str,
    code: &str,
) -> Result<AddFriendOutcome, AccountError>
where
    S: Store + ?Sized,
{
    let code = code.trim().to_ascii_uppercase();
    let friend_id = store
        .resolve_invite_code(&code)
        .await?
        .ok_or(AccountError::InvalidInviteCode)?;
    if friend_id == user_id {
        return Err(AccountError::SelfFriend);
    }

    if store.add_friend(user_id, &friend_id).await? {
        info!(user_id, friend_id = %friend_id, "added friend");
        Ok(AddFriendOutcome::Added { friend_id })
    } else {
        Ok(AddFriendOutcome::AlreadyFriends { friend_id })
    }
}

/// Looks up a friend of `user` by display name. Users outside the friends
/// list are never returned.
pub async fn find_friend_by_name<S>(
    store: &S,
    user: &UserRecord,
    name: &str,
) -> Result<Option<UserRecord>, AccountError>
where
    S: Store + ?Sized,
{
    for friend_id in &user.friends {
        if let Some(friend) = store.get_user(friend_id).await? {
            if friend.name == name {
                return Ok(Some(friend));
            }
        }
    }
    Ok(None)
}
