use crate::db::{timestamp_now, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{AccessTokenRecord, CloudInstance, CreateAccessTokenResponse};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Decoded form of the secret handed to the user.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEnvelope {
    token: String,
    instance: CloudInstance,
}

#[derive(Clone)]
pub struct TokenManager {
    db: Arc<Database>,
    instance: CloudInstance,
    issue_lock: Arc<Mutex<()>>,
}

impl TokenManager {
    pub fn new(db: Arc<Database>, instance: CloudInstance) -> Self {
        Self {
            db,
            instance,
            issue_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn issue_token(&self) -> AppResult<CreateAccessTokenResponse> {
        let _guard = self
            .issue_lock
            .lock()
            .map_err(|_| AppError::Internal("token issue lock poisoned".to_string()))?;

        let now = timestamp_now();
        if let Some(active) = self.db.get_active_token(now)? {
            return Err(AppError::Conflict(format!(
                "token {} is still active; delete it before issuing a new one",
                active.id
            )));
        }

        let settings = self.db.get_settings()?;
        let id = Uuid::new_v4().simple().to_string();
        let secret_bytes: [u8; 32] = rand::random();
        let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret_bytes);

        let record = AccessTokenRecord {
            id: id.clone(),
            display_name: format!("cloud-migration-{}", self.instance.slug),
            expires_at: now + chrono::Duration::days(i64::from(settings.token_ttl_days)),
            first_used_at: None,
            last_used_at: None,
            created_at: now,
        };
        self.db.insert_token(&record, &digest(&secret))?;

        let envelope = TokenEnvelope {
            token: format!("{id}.{secret}"),
            instance: self.instance.clone(),
        };
        let token = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&envelope)?);

        tracing::info!(token_id = %id, expires_at = %record.expires_at, "issued migration token");
        Ok(CreateAccessTokenResponse { token })
    }

    pub fn get_token(&self) -> AppResult<AccessTokenRecord> {
        self.db
            .get_active_token(timestamp_now())?
            .ok_or_else(|| AppError::NotFound("no active migration token".to_string()))
    }

    pub fn delete_token(&self, id: &str) -> AppResult<()> {
        if !self.db.mark_token_deleted(id)? {
            return Err(AppError::NotFound(format!("token {id} not found")));
        }
        tracing::info!(token_id = %id, "deleted migration token");
        Ok(())
    }

    /// Resolves a secret to the destination it authorizes and records the use.
    pub fn validate(&self, secret: &str) -> AppResult<CloudInstance> {
        let envelope = decode_envelope(secret)?;
        let (id, raw_secret) = envelope
            .token
            .split_once('.')
            .ok_or_else(|| AppError::Auth("malformed migration token".to_string()))?;

        let Some(stored) = self.db.get_stored_token(id)? else {
            return Err(AppError::Auth("unknown migration token".to_string()));
        };
        if stored.deleted_at.is_some() {
            return Err(AppError::Auth("migration token has been revoked".to_string()));
        }
        let now = timestamp_now();
        if stored.record.expires_at <= now {
            return Err(AppError::Auth("migration token has expired".to_string()));
        }
        if stored.secret_hash != digest(raw_secret) {
            return Err(AppError::Auth("invalid migration token".to_string()));
        }
        if envelope.instance != self.instance {
            return Err(AppError::Auth(
                "migration token was issued for a different instance".to_string(),
            ));
        }

        self.db.touch_token_usage(id, now)?;
        Ok(envelope.instance)
    }
}

fn decode_envelope(secret: &str) -> AppResult<TokenEnvelope> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(secret.trim())
        .map_err(|_| AppError::Auth("migration token is not valid base64".to_string()))?;
    serde_json::from_slice::<TokenEnvelope>(&decoded)
        .map_err(|_| AppError::Auth("malformed migration token".to_string()))
}

fn digest(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::{TokenEnvelope, TokenManager};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::CloudInstance;
    use base64::Engine;
    use std::sync::Arc;

    fn manager() -> (tempfile::TempDir, TokenManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let instance = CloudInstance {
            stack_id: 12,
            slug: "acme".to_string(),
            region_slug: "us".to_string(),
            cluster_slug: "prod-us-0".to_string(),
        };
        (dir, TokenManager::new(db, instance))
    }

    #[test]
    fn second_token_conflicts_until_first_is_deleted() {
        let (_dir, tokens) = manager();
        tokens.issue_token().expect("first token");

        let second = tokens.issue_token();
        assert!(matches!(second, Err(AppError::Conflict(_))));

        let active = tokens.get_token().expect("active token");
        tokens.delete_token(&active.id).expect("delete");
        assert!(matches!(tokens.get_token(), Err(AppError::NotFound(_))));
        tokens.issue_token().expect("token after delete");
    }

    #[test]
    fn deleting_unknown_token_is_not_found() {
        let (_dir, tokens) = manager();
        assert!(matches!(tokens.delete_token("nope"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn validate_returns_instance_and_stamps_usage() {
        let (_dir, tokens) = manager();
        let issued = tokens.issue_token().expect("token");

        let instance = tokens.validate(&issued.token).expect("valid");
        assert_eq!(instance.slug, "acme");
        assert_eq!(instance.stack_id, 12);

        let first = tokens.get_token().expect("token");
        assert!(first.first_used_at.is_some());
        tokens.validate(&issued.token).expect("valid again");
        let second = tokens.get_token().expect("token");
        assert_eq!(first.first_used_at, second.first_used_at);
        assert!(second.last_used_at >= first.last_used_at);
    }

    #[test]
    fn tampered_revoked_and_garbage_tokens_are_rejected() {
        let (_dir, tokens) = manager();
        let issued = tokens.issue_token().expect("token");

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&issued.token)
            .expect("decode");
        let mut envelope: TokenEnvelope = serde_json::from_slice(&decoded).expect("envelope");
        envelope.token.push('x');
        let tampered = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&envelope).expect("encode"));
        assert!(matches!(tokens.validate(&tampered), Err(AppError::Auth(_))));
        assert!(matches!(tokens.validate("not a token"), Err(AppError::Auth(_))));

        let active = tokens.get_token().expect("token");
        tokens.delete_token(&active.id).expect("delete");
        assert!(matches!(tokens.validate(&issued.token), Err(AppError::Auth(_))));
    }

    #[test]
    fn expired_token_fails_validation_and_frees_the_slot() {
        let (_dir, tokens) = manager();
        tokens
            .db
            .update_settings(serde_json::json!({ "tokenTtlDays": 0 }))
            .expect("settings");
        let issued = tokens.issue_token().expect("token");

        assert!(matches!(tokens.validate(&issued.token), Err(AppError::Auth(_))));
        tokens.issue_token().expect("expired token does not block a new one");
    }
}
