//! Thread reconstruction over the UID DB's In-Reply-To / References
//! columns, and stable URL-safe slugs for thread roots.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::storage::UidDb;
use crate::types::PulledRecord;

const SLUG_MAX_ATTEMPTS: u64 = 1_000;

/// The 48-bit integer a root's slug is derived from.
pub fn slug_seed(root_message_id: &str) -> u64 {
    let digest = Sha256::digest(root_message_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes[2..8].copy_from_slice(&digest[..6]);
    u64::from_be_bytes(bytes)
}

/// URL-safe base64 of a 48-bit value (8 characters, no padding).
pub fn slug_from_seed(seed: u64) -> String {
    let bytes = seed.to_be_bytes();
    URL_SAFE_NO_PAD.encode(&bytes[2..8])
}

/// Hex fallback used when the increment search fails to find a free slug.
pub fn slug_fallback(root_message_id: &str) -> String {
    hex::encode(Sha256::digest(root_message_id.as_bytes()))[..16].to_string()
}

/// Assign (or look up) the slug for a thread root. Collisions with a
/// different root increment the underlying 48-bit integer until a free
/// slug is found; after 1,000 attempts the full hex prefix wins.
pub async fn assign_thread_slug(db: &UidDb, root_message_id: &str) -> Result<String> {
    if let Some(existing) = db.slug_for_root(root_message_id).await? {
        return Ok(existing);
    }

    let mut seed = slug_seed(root_message_id);
    for _ in 0..SLUG_MAX_ATTEMPTS {
        let candidate = slug_from_seed(seed);
        match db.slug_owner(&candidate).await? {
            None => {
                db.insert_slug(&candidate, root_message_id).await?;
                return Ok(candidate);
            }
            Some(owner) if owner == root_message_id => return Ok(candidate),
            Some(_) => {
                seed = (seed + 1) & 0xFFFF_FFFF_FFFF;
            }
        }
    }

    let fallback = slug_fallback(root_message_id);
    if db.slug_owner(&fallback).await?.is_none() {
        db.insert_slug(&fallback, root_message_id).await?;
    }
    Ok(fallback)
}

/// All messages in the thread containing `message_id`, msg_date ascending.
pub async fn get_thread(db: &UidDb, message_id: &str, limit: i64) -> Result<Vec<PulledRecord>> {
    db.get_thread(message_id, limit).await
}

/// Direct replies only.
pub async fn get_replies(db: &UidDb, message_id: &str, limit: i64) -> Result<Vec<PulledRecord>> {
    db.get_replies(message_id, limit).await
}
